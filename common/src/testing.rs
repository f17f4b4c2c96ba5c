use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
};

use crate::{
    error::TransportError,
    transport::{Clock, Transport},
    types::InboundMessage,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect { ok: bool },
    Subscribe(String),
    Publish(String, String),
    Sleep(u64),
}

pub type EventLog = Rc<RefCell<Vec<Event>>>;

#[derive(Default)]
struct TransportInner {
    connected: bool,
    session: u64,
    connect_failures: u32,
    inbox: VecDeque<InboundMessage>,
    publish_error: Option<TransportError>,
}

// Clones share state so a test keeps a handle after moving one into a node.
#[derive(Clone)]
pub struct FakeTransport {
    inner: Rc<RefCell<TransportInner>>,
    log: EventLog,
}

impl FakeTransport {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: Rc::default(),
            log,
        }
    }

    pub fn connected() -> Self {
        let transport = Self::new(EventLog::default());
        transport.inner.borrow_mut().connected = true;
        transport
    }

    pub fn fail_connects(&self, count: u32) {
        self.inner.borrow_mut().connect_failures = count;
    }

    pub fn fail_publish(&self, error: Option<TransportError>) {
        self.inner.borrow_mut().publish_error = error;
    }

    pub fn drop_connection(&self) {
        self.inner.borrow_mut().connected = false;
    }

    // Drop and re-establish between two polls, as a client with automatic
    // reconnect does; the broker forgets clean-session subscriptions.
    pub fn bounce_session(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.connected = true;
        inner.session += 1;
    }

    pub fn deliver(&self, topic: &str, payload: &str) {
        self.inner
            .borrow_mut()
            .inbox
            .push_back(InboundMessage::new(topic, payload));
    }

    pub fn events(&self) -> Vec<Event> {
        self.log.borrow().clone()
    }

    pub fn clear_events(&self) {
        self.log.borrow_mut().clear();
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.log
            .borrow()
            .iter()
            .filter_map(|event| match event {
                Event::Publish(topic, payload) => Some((topic.clone(), payload.clone())),
                _ => None,
            })
            .collect()
    }
}

impl Transport for FakeTransport {
    fn is_connected(&self) -> bool {
        self.inner.borrow().connected
    }

    fn session(&self) -> u64 {
        self.inner.borrow().session
    }

    fn connect(&mut self) -> Result<(), TransportError> {
        let mut inner = self.inner.borrow_mut();
        if inner.connect_failures > 0 {
            inner.connect_failures -= 1;
            self.log.borrow_mut().push(Event::Connect { ok: false });
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        if !inner.connected {
            inner.connected = true;
            inner.session += 1;
        }
        self.log.borrow_mut().push(Event::Connect { ok: true });
        Ok(())
    }

    fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.log
            .borrow_mut()
            .push(Event::Subscribe(topic.to_string()));
        Ok(())
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<(), TransportError> {
        if let Some(err) = self.inner.borrow().publish_error.clone() {
            return Err(err);
        }
        self.log
            .borrow_mut()
            .push(Event::Publish(topic.to_string(), payload.to_string()));
        Ok(())
    }

    fn poll(&mut self) -> Vec<InboundMessage> {
        self.inner.borrow_mut().inbox.drain(..).collect()
    }
}

#[derive(Clone)]
pub struct FakeClock {
    now: Rc<Cell<u64>>,
    log: EventLog,
}

impl FakeClock {
    pub fn new(log: EventLog) -> Self {
        Self {
            now: Rc::default(),
            log,
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for FakeClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }

    fn sleep_ms(&mut self, ms: u64) {
        self.log.borrow_mut().push(Event::Sleep(ms));
        self.advance(ms);
    }
}
