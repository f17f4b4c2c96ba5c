use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, types::Channel};

pub const TOPIC_ROOT: &str = "id";

pub const DEVICE_DHT: &str = "dht";
pub const DEVICE_LIGHT: &str = "light";

pub const MEASUREMENT_TEMP: &str = "temp";
pub const MEASUREMENT_HUMIDITY: &str = "humi";
pub const MEASUREMENT_LUX: &str = "lux";
pub const MEASUREMENT_CONTROL: &str = "control";

// id/<owner>[/<room>]/<device>/<measurement>
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicScheme {
    pub owner: String,
    #[serde(default)]
    pub room: Option<String>,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self {
            owner: "jihoon".to_string(),
            room: None,
        }
    }
}

impl TopicScheme {
    pub fn new(owner: impl Into<String>, room: Option<String>) -> Self {
        let mut scheme = Self {
            owner: owner.into(),
            room,
        };
        scheme.sanitize();
        scheme
    }

    pub fn sanitize(&mut self) {
        self.owner = self.owner.trim().to_string();
        if let Some(room) = self.room.as_mut() {
            *room = room.trim().to_string();
        }
        if self.room.as_deref().is_some_and(str::is_empty) {
            self.room = None;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let segments = std::iter::once(self.owner.as_str()).chain(self.room.as_deref());
        for segment in segments {
            if segment.is_empty() || segment.contains(['/', '+', '#']) {
                return Err(ConfigError::InvalidTopicSegment(segment.to_string()));
            }
        }
        Ok(())
    }

    pub fn topic(&self, device: &str, measurement: &str) -> String {
        match self.room.as_deref() {
            Some(room) => format!("{TOPIC_ROOT}/{}/{room}/{device}/{measurement}", self.owner),
            None => format!("{TOPIC_ROOT}/{}/{device}/{measurement}", self.owner),
        }
    }

    pub fn resolve(&self) -> Topics {
        Topics {
            temperature: self.topic(DEVICE_DHT, MEASUREMENT_TEMP),
            humidity: self.topic(DEVICE_DHT, MEASUREMENT_HUMIDITY),
            lux: self.topic(DEVICE_LIGHT, MEASUREMENT_LUX),
            control: self.topic(DEVICE_LIGHT, MEASUREMENT_CONTROL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topics {
    pub temperature: String,
    pub humidity: String,
    pub lux: String,
    pub control: String,
}

impl Topics {
    pub fn for_channel(&self, channel: Channel) -> &str {
        match channel {
            Channel::Temperature => &self.temperature,
            Channel::Humidity => &self.humidity,
            Channel::Lux => &self.lux,
        }
    }

    pub fn channel_of(&self, topic: &str) -> Option<Channel> {
        Channel::ALL
            .into_iter()
            .find(|channel| self.for_channel(*channel) == topic)
    }

    pub fn telemetry(&self) -> [&str; 3] {
        [&self.temperature, &self.humidity, &self.lux]
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn default_scheme_matches_deployed_topics() {
        let topics = TopicScheme::default().resolve();
        assert_eq!(
            topics,
            Topics {
                temperature: "id/jihoon/dht/temp".to_string(),
                humidity: "id/jihoon/dht/humi".to_string(),
                lux: "id/jihoon/light/lux".to_string(),
                control: "id/jihoon/light/control".to_string(),
            }
        );
    }

    #[test]
    fn room_is_inserted_after_owner() {
        let topics = TopicScheme::new("jihoon", Some("bedroom".to_string())).resolve();
        assert_eq!(topics.lux, "id/jihoon/bedroom/light/lux");
        assert_eq!(topics.control, "id/jihoon/bedroom/light/control");
    }

    #[test]
    fn blank_room_is_dropped() {
        let scheme = TopicScheme::new(" jihoon ", Some("  ".to_string()));
        assert_eq!(scheme.room, None);
        assert_eq!(scheme.resolve().temperature, "id/jihoon/dht/temp");
    }

    #[test]
    fn wildcards_are_rejected() {
        assert!(TopicScheme::new("a/b", None).validate().is_err());
        assert!(TopicScheme::new("owner", Some("#".to_string()))
            .validate()
            .is_err());
        assert!(TopicScheme::new("", None).validate().is_err());
    }

    #[test]
    fn telemetry_topics_map_back_to_channels() {
        let topics = TopicScheme::default().resolve();
        assert_eq!(topics.channel_of("id/jihoon/dht/humi"), Some(Channel::Humidity));
        assert_eq!(topics.channel_of("id/jihoon/light/control"), None);
    }
}
