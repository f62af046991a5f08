//! mqlink-core - MQTT 3.1.1 wire types for the mqlink client.
//!
//! This crate provides the packet types, the client side of the codec and
//! topic validation shared by the session manager and its built-in engine.

pub mod error;
pub mod packet;
pub mod varint;

pub use error::{Error, ProtocolError, Result};
pub use packet::*;
