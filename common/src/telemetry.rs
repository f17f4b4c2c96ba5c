use log::{info, warn};

use crate::{
    topics::Topics,
    transport::Transport,
    types::Reading,
};

pub fn format_value(value: f32) -> String {
    format!("{value:.2}")
}

#[derive(Debug, Clone)]
pub struct TelemetryPublisher {
    topics: Topics,
}

impl TelemetryPublisher {
    pub fn new(topics: Topics) -> Self {
        Self { topics }
    }

    pub fn publish<T: Transport + ?Sized>(&self, transport: &mut T, reading: &Reading) -> bool {
        let Some(value) = reading.value else {
            return false;
        };

        let topic = self.topics.for_channel(reading.channel);
        let payload = format_value(value);
        match transport.publish(topic, &payload) {
            Ok(()) => {
                info!(
                    "Published -> {}: {}{}",
                    reading.channel.as_str(),
                    payload,
                    reading.channel.unit()
                );
                true
            }
            Err(err) => {
                warn!("failed to publish {}: {err}", reading.channel.as_str());
                false
            }
        }
    }

    pub fn publish_all<T: Transport + ?Sized>(&self, transport: &mut T, readings: &[Reading]) -> usize {
        readings
            .iter()
            .filter(|reading| self.publish(transport, reading))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::TransportError, testing::FakeTransport, topics::TopicScheme, types::Channel,
    };

    fn publisher() -> TelemetryPublisher {
        TelemetryPublisher::new(TopicScheme::default().resolve())
    }

    #[test]
    fn formats_two_decimals() {
        assert_eq!(format_value(23.456), "23.46");
        assert_eq!(format_value(21.7), "21.70");
        assert_eq!(format_value(55.3), "55.30");
        assert_eq!(format_value(0.0), "0.00");
        assert_eq!(format_value(-3.14159), "-3.14");
        assert_eq!(format_value(2.675), "2.67");
    }

    #[test]
    fn climate_scenario_publishes_two_payloads() {
        let mut transport = FakeTransport::connected();
        let published = publisher().publish_all(
            &mut transport,
            &[
                Reading::valid(Channel::Temperature, 21.7),
                Reading::valid(Channel::Humidity, 55.3),
            ],
        );

        assert_eq!(published, 2);
        assert_eq!(
            transport.published(),
            vec![
                ("id/jihoon/dht/temp".to_string(), "21.70".to_string()),
                ("id/jihoon/dht/humi".to_string(), "55.30".to_string()),
            ]
        );
    }

    #[test]
    fn invalid_readings_never_reach_the_transport() {
        let mut transport = FakeTransport::connected();
        let publisher = publisher();
        for channel in Channel::ALL {
            assert!(!publisher.publish(&mut transport, &Reading::invalid(channel)));
            assert!(!publisher.publish(&mut transport, &Reading::from_raw(channel, f32::NAN)));
        }
        assert!(transport.published().is_empty());
        assert!(transport.events().is_empty());
    }

    #[test]
    fn publish_failure_is_swallowed() {
        let mut transport = FakeTransport::connected();
        transport.fail_publish(Some(TransportError::Disconnected));
        assert!(!publisher().publish(&mut transport, &Reading::valid(Channel::Lux, 120.0)));
        assert!(transport.published().is_empty());
    }
}
