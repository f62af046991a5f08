//! The boundary between the session manager and a protocol engine.
//!
//! An engine owns the wire: handshake, packet I/O, keep-alive and TLS. It
//! runs its own background context and reports back through
//! [`EngineCallbacks`], which only forward plain data to the serializer.

mod tcp;

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::Sender;
use mqlink_core::packet::QoS;

use crate::config::ConnectOptions;
use crate::error::Result;
use crate::serializer::Command;

pub use tcp::{TcpEngine, TcpEngineFactory};

/// Identity of one engine connection within a session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Creates one engine per `connect`.
pub trait EngineFactory: Send + 'static {
    /// Create a handle and apply credentials, TLS and will.
    ///
    /// TLS configuration errors are reported here, before anything starts.
    fn create(
        &self,
        options: &ConnectOptions,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn ProtocolEngine>>;
}

/// One broker connection.
///
/// All methods are called from the serializer thread and must not block,
/// except [`stop`](Self::stop), which waits at most `timeout`. Dropping the
/// engine destroys the handle.
pub trait ProtocolEngine: Send {
    /// Start the background context.
    fn start(&mut self) -> Result<()>;

    /// Begin the handshake. The outcome arrives as `connected` or
    /// `connect_failed`.
    fn connect(&mut self) -> Result<()>;

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<u16>;

    fn unsubscribe(&mut self, topic: &str) -> Result<u16>;

    /// Returns the mid that the matching `published` callback will carry,
    /// for every QoS.
    fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<u16>;

    /// Request a clean close.
    fn disconnect(&mut self) -> Result<()>;

    /// Cancel the background context and wait up to `timeout` for it to
    /// finish. After the bound it is abandoned.
    fn stop(&mut self, timeout: Duration);
}

/// What an engine reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Signal {
    Connected { return_code: u8, session_present: bool },
    ConnectFailed { code: i32, message: String },
    Disconnected { code: i32, message: String },
    Message {
        topic: String,
        payload: Bytes,
        qos: QoS,
        retained: bool,
    },
    Subscribed { mid: u16, granted: u8 },
    Published { mid: u16 },
    Unsubscribed { mid: u16 },
}

impl Signal {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Signal::Connected { .. } => "connected",
            Signal::ConnectFailed { .. } => "connect_failed",
            Signal::Disconnected { .. } => "disconnected",
            Signal::Message { .. } => "message",
            Signal::Subscribed { .. } => "subscribed",
            Signal::Published { .. } => "published",
            Signal::Unsubscribed { .. } => "unsubscribed",
        }
    }

    /// The mid this signal would consume from the correlation table.
    pub(crate) fn mid(&self) -> Option<u16> {
        match self {
            Signal::Subscribed { mid, .. }
            | Signal::Published { mid }
            | Signal::Unsubscribed { mid } => Some(*mid),
            _ => None,
        }
    }
}

/// An engine callback stamped with the connection that produced it.
#[derive(Debug)]
pub(crate) struct EngineEvent {
    pub(crate) generation: u64,
    pub(crate) connection: ConnectionId,
    pub(crate) signal: Signal,
}

/// Callback sink handed to an engine at creation.
///
/// Cheap to clone and safe to call from any thread. Calls after the session
/// manager has gone away are ignored.
#[derive(Clone)]
pub struct EngineCallbacks {
    tx: Sender<Command>,
    generation: u64,
    connection: ConnectionId,
}

impl fmt::Debug for EngineCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCallbacks")
            .field("generation", &self.generation)
            .field("connection", &self.connection)
            .finish()
    }
}

impl EngineCallbacks {
    pub(crate) fn new(tx: Sender<Command>, generation: u64, connection: ConnectionId) -> Self {
        Self {
            tx,
            generation,
            connection,
        }
    }

    /// The connection these callbacks report for.
    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Handshake finished. A nonzero `return_code` is a rejection.
    pub fn connected(&self, return_code: u8, session_present: bool) {
        self.send(Signal::Connected {
            return_code,
            session_present,
        });
    }

    /// The transport failed before the handshake completed.
    pub fn connect_failed(&self, code: i32, message: impl Into<String>) {
        self.send(Signal::ConnectFailed {
            code,
            message: message.into(),
        });
    }

    pub fn disconnected(&self, code: i32, message: impl Into<String>) {
        self.send(Signal::Disconnected {
            code,
            message: message.into(),
        });
    }

    pub fn message(&self, topic: impl Into<String>, payload: Bytes, qos: QoS, retained: bool) {
        self.send(Signal::Message {
            topic: topic.into(),
            payload,
            qos,
            retained,
        });
    }

    /// SUBACK for `mid`; `granted` is the raw return code (0x80 = failure).
    pub fn subscribed(&self, mid: u16, granted: u8) {
        self.send(Signal::Subscribed { mid, granted });
    }

    pub fn published(&self, mid: u16) {
        self.send(Signal::Published { mid });
    }

    pub fn unsubscribed(&self, mid: u16) {
        self.send(Signal::Unsubscribed { mid });
    }

    fn send(&self, signal: Signal) {
        let event = EngineEvent {
            generation: self.generation,
            connection: self.connection,
            signal,
        };
        if self.tx.send(Command::Engine(event)).is_err() {
            log::debug!("{} callback after serializer exit ignored", self.connection);
        }
    }
}
