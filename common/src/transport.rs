use crate::{error::TransportError, types::InboundMessage};

pub trait Transport {
    fn is_connected(&self) -> bool;
    // Bumped on every established broker session, including ones the client
    // re-established on its own.
    fn session(&self) -> u64;
    fn connect(&mut self) -> Result<(), TransportError>;
    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;
    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError>;
    fn poll(&mut self) -> Vec<InboundMessage>;
}

pub trait Clock {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&mut self, ms: u64);
}
