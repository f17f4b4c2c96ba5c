use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, topics::TopicScheme};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub sample_interval_ms: u64,
    pub rotation_steps: u32,
    pub step_period_ms: u32,
    pub pump_every_steps: u32,
    pub publish_while_moving: bool,
    pub reconnect: ReconnectPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            rotation_steps: 10_240,
            step_period_ms: 2,
            pump_every_steps: 64,
            publish_while_moving: false,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

// Longest the loop may spend inside one stepper slice without pumping.
pub const MAX_SLICE_MS: u32 = 1_000;

impl NodeConfig {
    pub fn sanitize(&mut self) {
        self.sample_interval_ms = self.sample_interval_ms.clamp(1_000, 3_600_000);
        self.step_period_ms = self.step_period_ms.clamp(1, 100);
        self.pump_every_steps = self
            .pump_every_steps
            .clamp(1, MAX_SLICE_MS / self.step_period_ms);
        self.reconnect.sanitize();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    pub delay_ms: u64,
    pub backoff_factor: u32,
    pub max_delay_ms: u64,
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay_ms: 5_000,
            backoff_factor: 1,
            max_delay_ms: 5_000,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn sanitize(&mut self) {
        self.delay_ms = self.delay_ms.clamp(100, 300_000);
        self.backoff_factor = self.backoff_factor.clamp(1, 10);
        self.max_delay_ms = self.max_delay_ms.max(self.delay_ms);
        if self.max_attempts == Some(0) {
            self.max_attempts = None;
        }
    }

    // `attempt` is 1-based.
    pub fn delay_for(&self, attempt: u32) -> u64 {
        let growth = (self.backoff_factor as u64).saturating_pow(attempt.saturating_sub(1));
        self.delay_ms
            .saturating_mul(growth)
            .min(self.max_delay_ms.max(self.delay_ms))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        self.max_attempts.is_some_and(|max| attempts >= max)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub client_id: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: String::new(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            client_id: "ESP32DHTClient".to_string(),
        }
    }
}

impl NetworkConfig {
    pub fn has_station_credentials(&self) -> bool {
        let ssid = self.wifi_ssid.trim();
        !ssid.is_empty() && ssid != "CHANGE_ME"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareConfig {
    pub dht_pin: i32,
    pub i2c_sda_pin: i32,
    pub i2c_scl_pin: i32,
    pub bh1750_address: u8,
    pub stepper_pins: [i32; 4],
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            dht_pin: 15,
            i2c_sda_pin: 21,
            i2c_scl_pin: 22,
            bh1750_address: 0x23,
            stepper_pins: [19, 18, 5, 17],
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if self.dht_pin < 0 {
            self.dht_pin = defaults.dht_pin;
        }
        if self.i2c_sda_pin < 0 {
            self.i2c_sda_pin = defaults.i2c_sda_pin;
        }
        if self.i2c_scl_pin < 0 {
            self.i2c_scl_pin = defaults.i2c_scl_pin;
        }
        // BH1750 only answers on 0x23 (ADDR low) or 0x5C (ADDR high).
        if !matches!(self.bh1750_address, 0x23 | 0x5C) {
            self.bh1750_address = defaults.bh1750_address;
        }
        if self.stepper_pins.iter().any(|pin| *pin < 0) {
            self.stepper_pins = defaults.stepper_pins;
        }
    }

    pub fn pin_conflicts(&self) -> bool {
        let mut pins = vec![self.dht_pin, self.i2c_sda_pin, self.i2c_scl_pin];
        pins.extend_from_slice(&self.stepper_pins);
        pins.sort_unstable();
        pins.windows(2).any(|pair| pair[0] == pair[1])
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub topics: TopicScheme,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.node.sanitize();
        self.hardware.sanitize();
        self.topics.sanitize();
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network.mqtt_host.trim().is_empty() {
            return Err(ConfigError::MissingBroker);
        }
        if self.network.mqtt_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        if self.network.client_id.trim().is_empty() {
            return Err(ConfigError::MissingClientId);
        }
        if self.hardware.pin_conflicts() {
            return Err(ConfigError::PinConflict);
        }
        self.topics.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_never_grows() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), 5_000);
        assert_eq!(policy.delay_for(50), 5_000);
        assert!(!policy.exhausted(u32::MAX));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = ReconnectPolicy {
            delay_ms: 1_000,
            backoff_factor: 2,
            max_delay_ms: 6_000,
            max_attempts: Some(5),
        };
        assert_eq!(policy.delay_for(1), 1_000);
        assert_eq!(policy.delay_for(2), 2_000);
        assert_eq!(policy.delay_for(3), 4_000);
        assert_eq!(policy.delay_for(4), 6_000);
        assert!(!policy.exhausted(4));
        assert!(policy.exhausted(5));
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let runtime: RuntimeConfig =
            serde_json::from_str(r#"{"network":{"wifi_ssid":"lab","wifi_pass":"pw","mqtt_host":"10.0.0.2","mqtt_port":1883,"mqtt_user":"","mqtt_pass":"","client_id":"ESP32DHTClient"}}"#)
                .unwrap();

        assert_eq!(runtime.node.rotation_steps, 10_240);
        assert_eq!(runtime.node.sample_interval_ms, 5_000);
        assert_eq!(runtime.hardware, HardwareConfig::default());
        assert!(runtime.network.has_station_credentials());
        assert!(runtime.validate().is_ok());
    }

    #[test]
    fn unprovisioned_config_is_rejected() {
        let runtime = RuntimeConfig::default();
        assert!(!runtime.network.has_station_credentials());
        assert!(matches!(runtime.validate(), Err(ConfigError::MissingBroker)));
    }

    #[test]
    fn one_slice_never_outlasts_the_slice_budget() {
        let mut node = NodeConfig {
            step_period_ms: 100,
            pump_every_steps: 1_024,
            ..NodeConfig::default()
        };
        node.sanitize();
        assert_eq!(node.pump_every_steps, 10);
        assert!(node.step_period_ms * node.pump_every_steps <= MAX_SLICE_MS);

        let mut node = NodeConfig {
            step_period_ms: 0,
            pump_every_steps: 5_000,
            ..NodeConfig::default()
        };
        node.sanitize();
        assert_eq!(node.step_period_ms, 1);
        assert_eq!(node.pump_every_steps, 1_000);

        let mut node = NodeConfig::default();
        node.sanitize();
        assert_eq!(node.pump_every_steps, 64);
    }

    #[test]
    fn sanitize_restores_bad_hardware_values() {
        let mut hardware = HardwareConfig {
            dht_pin: -1,
            bh1750_address: 0x40,
            stepper_pins: [1, 2, -3, 4],
            ..HardwareConfig::default()
        };
        hardware.sanitize();
        assert_eq!(hardware, HardwareConfig::default());
    }

    #[test]
    fn shared_pins_are_a_conflict() {
        let mut runtime = RuntimeConfig::default();
        runtime.network.mqtt_host = "broker.local".to_string();
        runtime.hardware.stepper_pins = [15, 18, 5, 17];
        assert!(matches!(runtime.validate(), Err(ConfigError::PinConflict)));
    }
}
