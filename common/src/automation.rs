use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::{Channel, MotorCommand};

pub const DEFAULT_THRESHOLD_LUX: f32 = 200.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LightAutomation {
    pub threshold_lux: f32,
    last_decision: Option<MotorCommand>,
}

impl Default for LightAutomation {
    fn default() -> Self {
        Self {
            threshold_lux: DEFAULT_THRESHOLD_LUX,
            last_decision: None,
        }
    }
}

impl LightAutomation {
    pub fn new(threshold_lux: f32) -> Self {
        if threshold_lux.is_finite() && threshold_lux >= 0.0 {
            Self {
                threshold_lux,
                last_decision: None,
            }
        } else {
            Self::default()
        }
    }

    pub fn decide(&self, lux: f32) -> MotorCommand {
        if lux <= self.threshold_lux {
            MotorCommand::Down
        } else {
            MotorCommand::Up
        }
    }

    // Only a change of decision yields a command; the node drops commands
    // while it is rotating, so repeating one would restart the motor forever.
    pub fn on_lux_payload(&mut self, payload: &str) -> Option<MotorCommand> {
        let lux = payload.trim().parse::<f32>().ok().filter(|lux| lux.is_finite())?;
        let command = self.decide(lux);
        if self.last_decision == Some(command) {
            return None;
        }
        self.last_decision = Some(command);
        Some(command)
    }

    // Lets the next reading resend, e.g. after a failed publish.
    pub fn forget_decision(&mut self) {
        self.last_decision = None;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelSnapshot {
    pub value: f32,
    pub unit: &'static str,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandRecord {
    pub command: MotorCommand,
    pub source: CommandSource,
    #[serde(rename = "sentAt")]
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    Automation,
    Manual,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct Dashboard {
    pub readings: BTreeMap<&'static str, ChannelSnapshot>,
    #[serde(rename = "lastCommand")]
    pub last_command: Option<CommandRecord>,
    #[serde(rename = "rejectedPayloads")]
    pub rejected_payloads: u64,
}

impl Dashboard {
    pub fn record_payload(&mut self, channel: Channel, payload: &str, now: DateTime<Utc>) -> Option<f32> {
        match payload.trim().parse::<f32>() {
            Ok(value) if value.is_finite() => {
                self.readings.insert(
                    channel.as_str(),
                    ChannelSnapshot {
                        value,
                        unit: channel.unit(),
                        updated_at: now,
                    },
                );
                Some(value)
            }
            _ => {
                self.rejected_payloads = self.rejected_payloads.saturating_add(1);
                None
            }
        }
    }

    pub fn record_command(&mut self, command: MotorCommand, source: CommandSource, now: DateTime<Utc>) {
        self.last_command = Some(CommandRecord {
            command,
            source,
            sent_at: now,
        });
    }

    pub fn latest(&self, channel: Channel) -> Option<f32> {
        self.readings.get(channel.as_str()).map(|snapshot| snapshot.value)
    }
}
