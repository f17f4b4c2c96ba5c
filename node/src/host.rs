use std::{
    convert::Infallible,
    io::ErrorKind,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        mpsc::{self, Receiver},
        Arc, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::Context;
use embedded_hal::{
    delay::DelayNs,
    digital::{ErrorType, OutputPin},
};
use rumqttc::{Client, Event, Incoming, MqttOptions, QoS};
use tracing::{debug, info, warn};

use monitor_common::{
    sensor::{validate_climate, validate_lux},
    ClimateSample, Clock, EnvironmentSensors, InboundMessage, MonitorNode, RuntimeConfig,
    SensorError, Stepper, Transport, TransportError,
};

const CONNECT_WAIT_MS: u64 = 3_000;

pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut runtime = load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();
    runtime.validate().context("runtime config is incomplete")?;

    let transport = MqttTransport::new(&runtime)?;
    let coils = [1, 2, 3, 4].map(SimulatedCoil::new);
    let stepper = Stepper::new(
        coils,
        ThreadDelay,
        runtime.node.step_period_ms,
        runtime.node.pump_every_steps,
    );

    let mut node = MonitorNode::new(
        &runtime,
        transport,
        SimulatedSensors::default(),
        stepper,
        SystemClock,
    );

    info!(
        "monitor node started; commands on `{}`",
        node.topics().control
    );

    node.run(|report| {
        if report.steps > 0 {
            debug!("stepped {} this cycle", report.steps);
        }
    })?;
    Ok(())
}

fn data_dir() -> PathBuf {
    std::env::var("MONITOR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.monitor"))
}

fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let path = data_dir().join("runtime.json");
    match std::fs::read(&path) {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(host) = std::env::var("MQTT_HOST") {
        runtime.network.mqtt_host = host;
    }
    if runtime.network.mqtt_host.is_empty() {
        runtime.network.mqtt_host = "127.0.0.1".to_string();
    }
    if let Some(port) = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
    {
        runtime.network.mqtt_port = port;
    }
    if let Ok(user) = std::env::var("MQTT_USER") {
        runtime.network.mqtt_user = user;
        runtime.network.mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    }
    if let Ok(owner) = std::env::var("MONITOR_OWNER") {
        runtime.topics.owner = owner;
    }
    if let Ok(room) = std::env::var("MONITOR_ROOM") {
        runtime.topics.room = Some(room);
    }
}

struct MqttTransport {
    client: Client,
    inbox: Receiver<InboundMessage>,
    connected: Arc<AtomicBool>,
    sessions: Arc<AtomicU64>,
}

impl MqttTransport {
    fn new(runtime: &RuntimeConfig) -> anyhow::Result<Self> {
        let network = &runtime.network;
        let mut options = MqttOptions::new(
            network.client_id.clone(),
            network.mqtt_host.clone(),
            network.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(15));
        if !network.mqtt_user.is_empty() {
            options.set_credentials(network.mqtt_user.clone(), network.mqtt_pass.clone());
        }

        let (client, mut connection) = Client::new(options, 32);
        let (tx, inbox) = mpsc::channel();
        let connected = Arc::new(AtomicBool::new(false));
        let sessions = Arc::new(AtomicU64::new(0));

        let flag = connected.clone();
        let established = sessions.clone();
        thread::Builder::new()
            .name("mqtt-poll".to_string())
            .spawn(move || {
                for notification in connection.iter() {
                    match notification {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            established.fetch_add(1, Ordering::Relaxed);
                            flag.store(true, Ordering::Relaxed);
                        }
                        Ok(Event::Incoming(Incoming::Publish(message))) => {
                            let inbound =
                                InboundMessage::new(message.topic, message.payload.to_vec());
                            if tx.send(inbound).is_err() {
                                break;
                            }
                        }
                        Ok(Event::Incoming(Incoming::Disconnect)) => {
                            flag.store(false, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(err) => {
                            flag.store(false, Ordering::Relaxed);
                            warn!("node mqtt poll error: {err}");
                            thread::sleep(Duration::from_secs(2));
                        }
                    }
                }
            })
            .context("failed to spawn mqtt thread")?;

        Ok(Self {
            client,
            inbox,
            connected,
            sessions,
        })
    }
}

impl Transport for MqttTransport {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn session(&self) -> u64 {
        self.sessions.load(Ordering::Relaxed)
    }

    // The event loop thread reconnects on its own; this waits for its ConnAck.
    fn connect(&mut self) -> Result<(), TransportError> {
        let deadline = Instant::now() + Duration::from_millis(CONNECT_WAIT_MS);
        while Instant::now() < deadline {
            if self.is_connected() {
                return Ok(());
            }
            thread::sleep(Duration::from_millis(50));
        }
        Err(TransportError::Disconnected)
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client
            .subscribe(topic, QoS::AtMostOnce)
            .map_err(|err| TransportError::Subscribe {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, false, payload.as_bytes().to_vec())
            .map_err(|err| TransportError::Publish {
                topic: topic.to_string(),
                reason: err.to_string(),
            })
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        self.inbox.try_iter().collect()
    }
}

// Deterministic drift with a DHT dropout every twelfth read.
#[derive(Default)]
struct SimulatedSensors {
    tick: u64,
}

impl EnvironmentSensors for SimulatedSensors {
    fn read_temperature_humidity(&mut self) -> Result<ClimateSample, SensorError> {
        self.tick = self.tick.saturating_add(1);
        if self.tick % 12 == 0 {
            return validate_climate(f32::NAN, f32::NAN);
        }
        let temperature_c = 21.0 + (self.tick % 8) as f32 * 0.2;
        let humidity_pct = 48.0 + (self.tick % 6) as f32 * 0.5;
        validate_climate(temperature_c, humidity_pct)
    }

    fn read_light(&mut self) -> Result<f32, SensorError> {
        let lux = 120.0 + (self.tick % 10) as f32 * 25.0;
        validate_lux(lux)
    }
}

struct SimulatedCoil {
    line: u8,
}

impl SimulatedCoil {
    fn new(line: u8) -> Self {
        Self { line }
    }
}

impl ErrorType for SimulatedCoil {
    type Error = Infallible;
}

impl OutputPin for SimulatedCoil {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        tracing::trace!("IN{} high", self.line);
        Ok(())
    }
}

struct ThreadDelay;

impl DelayNs for ThreadDelay {
    fn delay_ns(&mut self, ns: u32) {
        thread::sleep(Duration::from_nanos(ns as u64));
    }
}

struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&mut self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
