use embedded_hal::digital::ErrorKind;
use thiserror::Error;

use crate::types::Channel;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("{channel:?} sensor returned no number")]
    NotANumber { channel: Channel },
    #[error("{channel:?} reading {value} outside plausible range")]
    OutOfRange { channel: Channel, value: f32 },
    #[error("sensor bus error: {0}")]
    Bus(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("broker connection is down")]
    Disconnected,
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("subscribe to `{topic}` failed: {reason}")]
    Subscribe { topic: String, reason: String },
    #[error("publish to `{topic}` failed: {reason}")]
    Publish { topic: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StepperError {
    #[error("failed to drive coil line IN{line}: {kind:?}")]
    Coil { line: usize, kind: ErrorKind },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("broker unreachable after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error(transparent)]
    Stepper(#[from] StepperError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("no MQTT broker configured")]
    MissingBroker,
    #[error("mqtt port must be between 1 and 65535")]
    InvalidPort,
    #[error("mqtt client id cannot be empty")]
    MissingClientId,
    #[error("two peripherals share a GPIO")]
    PinConflict,
    #[error("invalid topic segment `{0}`")]
    InvalidTopicSegment(String),
}
