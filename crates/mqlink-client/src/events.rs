//! Events delivered to the host and connection state.

use std::fmt;

use bytes::Bytes;
use mqlink_core::packet::QoS;

/// A named event delivered to the global observer and, for the operation
/// that caused it, to the per-op completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Handshake accepted by the broker.
    Connected {
        /// Whether a previous session was restored.
        session_present: bool,
    },
    /// The connection ended. Code 0 is a clean disconnect.
    Disconnected { code: i32, message: String },
    /// Received a publish message.
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    },
    Subscribed { topic: String, granted_qos: QoS },
    Unsubscribed { topic: String },
    /// Publish handed off (QoS 0) or acknowledged (QoS 1/2).
    Published { mid: u16 },
    Error { message: String, code: i32 },
}

impl Event {
    /// Event name as seen by hosts.
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connected { .. } => "connected",
            Event::Disconnected { .. } => "disconnected",
            Event::Message { .. } => "message",
            Event::Subscribed { .. } => "subscribed",
            Event::Unsubscribed { .. } => "unsubscribed",
            Event::Published { .. } => "published",
            Event::Error { .. } => "error",
        }
    }

    /// The per-op `isError` flag.
    pub fn is_error(&self) -> bool {
        matches!(self, Event::Error { .. })
    }

    /// Message payload as UTF-8, if this is a message event with a valid
    /// UTF-8 payload.
    pub fn payload_str(&self) -> Option<&str> {
        match self {
            Event::Message { payload, .. } => std::str::from_utf8(payload).ok(),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Connected { session_present } => {
                write!(f, "connected (session_present={})", session_present)
            }
            Event::Disconnected { code, message } => {
                write!(f, "disconnected [{}] {}", code, message)
            }
            Event::Message {
                topic,
                payload,
                qos,
                retained,
            } => write!(
                f,
                "message on {} ({} bytes, {:?}, retained={})",
                topic,
                payload.len(),
                qos,
                retained
            ),
            Event::Subscribed { topic, granted_qos } => {
                write!(f, "subscribed to {} ({:?})", topic, granted_qos)
            }
            Event::Unsubscribed { topic } => write!(f, "unsubscribed from {}", topic),
            Event::Published { mid } => write!(f, "published mid {}", mid),
            Event::Error { message, code } => write!(f, "error [{}] {}", code, message),
        }
    }
}

/// Connection state as seen by the serializer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}
