//! Client error types and the integer codes carried by `error` events.

use std::io;

use thiserror::Error;

/// Integer codes reported in [`Event::Disconnected`](crate::Event::Disconnected)
/// and [`Event::Error`](crate::Event::Error).
///
/// Positive values below 128 come from the broker or the connection itself,
/// negative values are local failures.
pub mod code {
    /// Clean, user-initiated disconnect.
    pub const CLEAN: i32 = 0;
    /// The transport dropped after the handshake.
    pub const CONNECTION_LOST: i32 = 7;
    /// Two keep-alive pings went unanswered.
    pub const KEEP_ALIVE_TIMEOUT: i32 = 8;
    /// SUBACK return code 0x80.
    pub const SUBSCRIBE_REJECTED: i32 = 128;
    pub const ENGINE: i32 = -1;
    pub const TLS: i32 = -2;
    pub const IO: i32 = -3;
    pub const PROTOCOL: i32 = -4;
    pub const TIMEOUT: i32 = -5;
    pub const INVALID_OPTIONS: i32 = -6;
}

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] mqlink_core::ProtocolError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

impl ClientError {
    /// The `errorCode` reported when this error surfaces as an event.
    pub fn code(&self) -> i32 {
        match self {
            ClientError::Io(_) | ClientError::ConnectionClosed => code::IO,
            ClientError::Protocol(_) => code::PROTOCOL,
            ClientError::ConnectionTimeout => code::TIMEOUT,
            ClientError::InvalidState(_) | ClientError::Engine(_) => code::ENGINE,
            ClientError::InvalidOptions(_) => code::INVALID_OPTIONS,
            ClientError::Tls(_) => code::TLS,
        }
    }
}

impl From<mqlink_core::Error> for ClientError {
    fn from(e: mqlink_core::Error) -> Self {
        match e {
            mqlink_core::Error::Io(e) => ClientError::Io(e),
            mqlink_core::Error::Protocol(e) => ClientError::Protocol(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
