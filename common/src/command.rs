use log::{info, warn};

use crate::types::{InboundMessage, Motion, MotorCommand};

pub const MAX_COMMAND_PAYLOAD_BYTES: usize = 64;

#[derive(Debug, Clone)]
pub struct CommandDispatcher {
    control_topic: String,
    rotation_steps: u32,
}

impl CommandDispatcher {
    pub fn new(control_topic: impl Into<String>, rotation_steps: u32) -> Self {
        Self {
            control_topic: control_topic.into(),
            rotation_steps,
        }
    }

    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Option<Motion> {
        if topic != self.control_topic {
            return None;
        }

        if payload.len() > MAX_COMMAND_PAYLOAD_BYTES {
            warn!(
                "dropping oversized command on topic {} ({} bytes)",
                topic,
                payload.len()
            );
            return None;
        }

        let Ok(message) = core::str::from_utf8(payload) else {
            warn!("dropping non utf8 command on topic {topic}");
            return None;
        };

        info!("Message received on topic {topic}: {message}");

        match MotorCommand::parse(message) {
            Some(command) => {
                info!("received '{}' command", command.as_str());
                Some(Motion {
                    direction: command.direction(),
                    steps: self.rotation_steps,
                })
            }
            None => {
                warn!("unknown command received: {message:?}");
                None
            }
        }
    }

    pub fn dispatch_message(&self, message: &InboundMessage) -> Option<Motion> {
        self.dispatch(&message.topic, &message.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Direction;

    const CONTROL: &str = "id/jihoon/light/control";

    #[test]
    fn up_and_down_map_to_full_rotations() {
        let dispatcher = CommandDispatcher::new(CONTROL, 10_240);
        assert_eq!(
            dispatcher.dispatch(CONTROL, b"up"),
            Some(Motion {
                direction: Direction::Forward,
                steps: 10_240
            })
        );
        assert_eq!(
            dispatcher.dispatch(CONTROL, b"down"),
            Some(Motion {
                direction: Direction::Backward,
                steps: 10_240
            })
        );
    }

    #[test]
    fn anything_else_is_dropped() {
        let dispatcher = CommandDispatcher::new(CONTROL, 10_240);
        let rejected: [&[u8]; 7] = [b"UP", b"up ", b"left", b"", b"d\xffown", b"downdown", b"Down"];
        for payload in rejected {
            assert_eq!(dispatcher.dispatch(CONTROL, payload), None);
        }
        assert_eq!(dispatcher.dispatch(CONTROL, &[b'u'; 65]), None);
    }

    #[test]
    fn other_topics_are_ignored() {
        let dispatcher = CommandDispatcher::new(CONTROL, 10_240);
        assert_eq!(dispatcher.dispatch("id/jihoon/light/lux", b"up"), None);
        assert_eq!(
            dispatcher.dispatch_message(&InboundMessage::new("id/jihoon/dht/temp", "down")),
            None
        );
    }

    #[test]
    fn rotation_length_is_configurable() {
        let dispatcher = CommandDispatcher::new(CONTROL, 512);
        let motion = dispatcher
            .dispatch_message(&InboundMessage::new(CONTROL, "down"))
            .unwrap();
        assert_eq!(motion.steps, 512);
    }
}
