//! Error types for the MQTT codec.

use std::io;

use thiserror::Error;

/// Main error type for mqlink-core.
#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

/// MQTT protocol errors raised while decoding broker packets.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Invalid packet type: {0}")]
    InvalidPacketType(u8),

    #[error("Invalid remaining length encoding")]
    InvalidRemainingLength,

    #[error("Incomplete packet: need {needed} bytes, have {have}")]
    IncompletePacket { needed: usize, have: usize },

    #[error("Invalid UTF-8 string")]
    InvalidUtf8,

    #[error("Invalid QoS: {0}")]
    InvalidQos(u8),

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    #[error("Unexpected packet from broker: {0}")]
    UnexpectedPacket(String),
}

pub type Result<T> = std::result::Result<T, Error>;
