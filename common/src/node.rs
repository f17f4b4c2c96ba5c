use embedded_hal::{delay::DelayNs, digital::OutputPin};
use log::{debug, info, warn};

use crate::{
    command::CommandDispatcher,
    config::{NodeConfig, RuntimeConfig},
    error::NodeError,
    sensor::{sample_all, EnvironmentSensors},
    stepper::{ActuatorState, Stepper},
    telemetry::TelemetryPublisher,
    topics::Topics,
    transport::{Clock, Transport},
};

const IDLE_PAUSE_MS: u64 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub reconnected: bool,
    pub failed_connects: u32,
    pub commands: usize,
    pub steps: u32,
    pub sampled: bool,
    pub published: usize,
}

pub struct MonitorNode<T, S, P, D, C> {
    transport: T,
    sensors: S,
    stepper: Stepper<P, D>,
    clock: C,
    dispatcher: CommandDispatcher,
    publisher: TelemetryPublisher,
    topics: Topics,
    config: NodeConfig,
    last_sample_ms: u64,
    subscribed_session: Option<u64>,
    deferred_logged: bool,
}

impl<T, S, P, D, C> MonitorNode<T, S, P, D, C>
where
    T: Transport,
    S: EnvironmentSensors,
    P: OutputPin,
    D: DelayNs,
    C: Clock,
{
    pub fn new(
        runtime: &RuntimeConfig,
        transport: T,
        sensors: S,
        stepper: Stepper<P, D>,
        clock: C,
    ) -> Self {
        let topics = runtime.topics.resolve();
        let last_sample_ms = clock.now_ms();
        Self {
            transport,
            sensors,
            stepper,
            clock,
            dispatcher: CommandDispatcher::new(topics.control.clone(), runtime.node.rotation_steps),
            publisher: TelemetryPublisher::new(topics.clone()),
            topics,
            config: runtime.node.clone(),
            last_sample_ms,
            subscribed_session: None,
            deferred_logged: false,
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    pub fn actuator_state(&self) -> ActuatorState {
        self.stepper.state()
    }

    pub fn is_idle(&self) -> bool {
        self.stepper.is_idle()
    }

    // `housekeeping` runs after every cycle and after every failed connect
    // attempt, so watchdog and WiFi checks keep running through an outage.
    pub fn run<F>(&mut self, mut housekeeping: F) -> Result<(), NodeError>
    where
        F: FnMut(&CycleReport),
    {
        loop {
            let report = self.cycle(&mut housekeeping)?;
            housekeeping(&report);
            if self.stepper.is_idle() {
                self.clock.sleep_ms(IDLE_PAUSE_MS);
            }
        }
    }

    pub fn run_once(&mut self) -> Result<CycleReport, NodeError> {
        self.cycle(&mut |_: &CycleReport| {})
    }

    fn cycle(
        &mut self,
        between_attempts: &mut dyn FnMut(&CycleReport),
    ) -> Result<CycleReport, NodeError> {
        let (reconnected, failed_connects) = self.ensure_connected(between_attempts)?;
        let commands = self.pump();
        let steps = self.drive()?;
        let (sampled, published) = self.sample_if_due();

        Ok(CycleReport {
            reconnected,
            failed_connects,
            commands,
            steps,
            sampled,
            published,
        })
    }

    fn session_is_subscribed(&self) -> bool {
        self.transport.is_connected() && self.subscribed_session == Some(self.transport.session())
    }

    fn ensure_connected(
        &mut self,
        between_attempts: &mut dyn FnMut(&CycleReport),
    ) -> Result<(bool, u32), NodeError> {
        if self.session_is_subscribed() {
            return Ok((false, 0));
        }
        self.subscribed_session = None;

        let mut attempts = 0_u32;
        loop {
            attempts = attempts.saturating_add(1);
            info!("Attempting MQTT connection...");

            let failure = match self.transport.connect() {
                Ok(()) => {
                    let session = self.transport.session();
                    match self.transport.subscribe(&self.topics.control) {
                        Ok(()) => {
                            info!("connected; subscribed to topic: {}", self.topics.control);
                            self.subscribed_session = Some(session);
                            return Ok((true, attempts - 1));
                        }
                        Err(err) => err,
                    }
                }
                Err(err) => err,
            };

            let policy = &self.config.reconnect;
            if policy.exhausted(attempts) {
                warn!("giving up on broker after {attempts} attempts: {failure}");
                return Err(NodeError::ReconnectExhausted { attempts });
            }

            let delay_ms = policy.delay_for(attempts);
            warn!("failed ({failure}), try again in {delay_ms} ms");
            self.clock.sleep_ms(delay_ms);
            between_attempts(&CycleReport {
                failed_connects: attempts,
                ..CycleReport::default()
            });
        }
    }

    fn pump(&mut self) -> usize {
        let mut accepted = 0;
        for message in self.transport.poll() {
            let Some(motion) = self.dispatcher.dispatch_message(&message) else {
                continue;
            };

            if self.stepper.start(motion) {
                accepted += 1;
            } else {
                warn!(
                    "stepper busy ({} steps remaining); dropping {} command",
                    self.stepper.state().remaining,
                    motion.direction.as_str()
                );
            }
        }
        accepted
    }

    fn drive(&mut self) -> Result<u32, NodeError> {
        if self.stepper.is_idle() {
            return Ok(0);
        }
        Ok(self.stepper.advance(self.config.pump_every_steps)?)
    }

    fn sample_if_due(&mut self) -> (bool, usize) {
        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_sample_ms) <= self.config.sample_interval_ms {
            return (false, 0);
        }

        if !self.config.publish_while_moving && !self.stepper.is_idle() {
            if !self.deferred_logged {
                debug!("telemetry deferred until rotation completes");
                self.deferred_logged = true;
            }
            return (false, 0);
        }

        self.deferred_logged = false;
        self.last_sample_ms = now;
        let readings = sample_all(&mut self.sensors);
        let published = self.publisher.publish_all(&mut self.transport, &readings);
        (true, published)
    }
}
