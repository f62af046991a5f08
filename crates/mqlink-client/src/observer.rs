//! Host-side event handling.
//!
//! The global observer sees every event of the current generation. Per-op
//! completions are one-shot and only see the event that finished their
//! operation, always after the observer has seen it.

use mqlink_core::packet::QoS;

use crate::events::Event;

/// One-shot completion attached to a single command.
///
/// It may be created on any thread; it runs on the thread calling
/// [`SessionManager::dispatch`](crate::SessionManager::dispatch).
pub type Completion = Box<dyn FnOnce(&Event) + Send>;

/// Handler trait for session events.
///
/// All methods have default implementations that do nothing. Any
/// `FnMut(&Event)` closure is an observer too.
pub trait SessionObserver {
    #[allow(unused_variables)]
    fn on_connected(&mut self, session_present: bool) {}

    #[allow(unused_variables)]
    fn on_disconnected(&mut self, code: i32, message: &str) {}

    #[allow(unused_variables)]
    fn on_message(&mut self, topic: &str, payload: &[u8], qos: QoS, retained: bool) {}

    #[allow(unused_variables)]
    fn on_subscribed(&mut self, topic: &str, granted_qos: QoS) {}

    #[allow(unused_variables)]
    fn on_unsubscribed(&mut self, topic: &str) {}

    #[allow(unused_variables)]
    fn on_published(&mut self, mid: u16) {}

    #[allow(unused_variables)]
    fn on_error(&mut self, message: &str, code: i32) {}

    /// Route an event to the matching method.
    fn on_event(&mut self, event: &Event) {
        match event {
            Event::Connected { session_present } => self.on_connected(*session_present),
            Event::Disconnected { code, message } => self.on_disconnected(*code, message),
            Event::Message {
                topic,
                payload,
                qos,
                retained,
            } => self.on_message(topic, payload, *qos, *retained),
            Event::Subscribed { topic, granted_qos } => self.on_subscribed(topic, *granted_qos),
            Event::Unsubscribed { topic } => self.on_unsubscribed(topic),
            Event::Published { mid } => self.on_published(*mid),
            Event::Error { message, code } => self.on_error(message, *code),
        }
    }
}

impl<F> SessionObserver for F
where
    F: FnMut(&Event),
{
    fn on_event(&mut self, event: &Event) {
        self(event)
    }
}
