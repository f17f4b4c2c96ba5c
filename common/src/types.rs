use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Temperature,
    Humidity,
    Lux,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Self::Temperature, Self::Humidity, Self::Lux];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Lux => "lux",
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            Self::Temperature => "°C",
            Self::Humidity => "%",
            Self::Lux => "lx",
        }
    }
}

// `value` is `None` for an invalid sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub channel: Channel,
    pub value: Option<f32>,
}

impl Reading {
    pub fn valid(channel: Channel, value: f32) -> Self {
        Self {
            channel,
            value: Some(value),
        }
    }

    pub fn invalid(channel: Channel) -> Self {
        Self {
            channel,
            value: None,
        }
    }

    pub fn from_raw(channel: Channel, raw: f32) -> Self {
        Self {
            channel,
            value: raw.is_finite().then_some(raw),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Backward => "backward",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotorCommand {
    Up,
    Down,
}

impl MotorCommand {
    pub fn parse(payload: &str) -> Option<Self> {
        match payload {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            Self::Up => Direction::Forward,
            Self::Down => Direction::Backward,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Motion {
    pub direction: Direction,
    pub steps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_is_the_invalid_marker() {
        assert!(!Reading::from_raw(Channel::Lux, f32::NAN).is_valid());
        assert!(!Reading::from_raw(Channel::Lux, f32::INFINITY).is_valid());
        assert_eq!(Reading::valid(Channel::Lux, 12.5).value, Some(12.5));
        assert_eq!(
            Reading::from_raw(Channel::Lux, 12.5),
            Reading::valid(Channel::Lux, 12.5)
        );
    }

    #[test]
    fn only_exact_literals_parse() {
        assert_eq!(MotorCommand::parse("up"), Some(MotorCommand::Up));
        assert_eq!(MotorCommand::parse("down"), Some(MotorCommand::Down));
        for payload in ["UP", "Down", " up", "up\n", "", "upp", "stop"] {
            assert_eq!(MotorCommand::parse(payload), None, "payload {payload:?}");
        }
    }

    #[test]
    fn commands_map_to_directions() {
        assert_eq!(MotorCommand::Up.direction(), Direction::Forward);
        assert_eq!(MotorCommand::Down.direction(), Direction::Backward);
    }
}
