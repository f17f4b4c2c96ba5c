pub mod automation;
pub mod command;
pub mod config;
pub mod error;
pub mod node;
pub mod sensor;
pub mod stepper;
pub mod telemetry;
pub mod topics;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

pub use automation::{CommandSource, Dashboard, LightAutomation};
pub use command::CommandDispatcher;
pub use config::{HardwareConfig, NetworkConfig, NodeConfig, ReconnectPolicy, RuntimeConfig};
pub use error::{ConfigError, NodeError, SensorError, StepperError, TransportError};
pub use node::{CycleReport, MonitorNode};
pub use sensor::{ClimateSample, EnvironmentSensors};
pub use stepper::{ActuatorState, MotionState, Stepper};
pub use telemetry::{format_value, TelemetryPublisher};
pub use topics::{TopicScheme, Topics};
pub use transport::{Clock, Transport};
pub use types::{Channel, Direction, InboundMessage, Motion, MotorCommand, Reading};
