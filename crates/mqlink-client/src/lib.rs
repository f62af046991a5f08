//! mqlink-client - Single-connection MQTT session manager.
//!
//! A [`SessionManager`] owns at most one broker connection. Commands
//! (connect, subscribe, unsubscribe, publish, disconnect) return immediately
//! and are executed in order by a serializer thread. Their outcomes come back
//! as [`Event`]s delivered on the host thread: first to the global
//! [`SessionObserver`], then to the optional one-shot [`Completion`] passed
//! with the command.
//!
//! Every result is stamped with the generation current when its command was
//! issued. [`SessionManager::teardown`] and [`SessionManager::init`] start a
//! new generation, and anything stamped with an older one is released without
//! reaching the host.
//!
//! # Example
//!
//! ```ignore
//! use mqlink_client::{ConnectOptions, Event, QoS, SessionManager, Will};
//!
//! let mut session = SessionManager::with_tcp_engine()?;
//! session.init(|event: &Event| println!("{}", event));
//!
//! let options = ConnectOptions::new("broker.local")
//!     .client_id("sensor-7")
//!     .will(Will::new("sensors/7/status", "offline").retain(true));
//! session.connect(options, None)?;
//! session.publish(
//!     "sensors/7/temp",
//!     "21.5",
//!     QoS::AtLeastOnce,
//!     false,
//!     Some(Box::new(|event: &Event| println!("ack: {}", event))),
//! )?;
//! session.dispatch_timeout(std::time::Duration::from_secs(1));
//! ```
//!
//! The wire side is pluggable: implement [`EngineFactory`] and
//! [`ProtocolEngine`] to drive a different protocol stack.

mod config;
mod correlation;
mod engine;
mod epoch;
mod error;
mod events;
mod manager;
mod mid;
mod observer;
mod serializer;
mod session;
mod tls;
mod will;

pub use config::{
    generate_client_id, ConnectOptions, SessionConfig, DEFAULT_KEEP_ALIVE, DEFAULT_PORT,
    DEFAULT_STOP_TIMEOUT, DEFAULT_TLS_PORT,
};
pub use engine::{
    ConnectionId, EngineCallbacks, EngineFactory, ProtocolEngine, TcpEngine, TcpEngineFactory,
};
pub use error::{code, ClientError, Result};
pub use events::{ConnectionState, Event};
pub use manager::{SessionHandle, SessionManager};
pub use mid::MidAllocator;
pub use observer::{Completion, SessionObserver};
pub use will::Will;

// Re-export useful types from core
pub use mqlink_core::packet::QoS;

/// Library version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Integer build number, bumped with every release.
pub const BUILD_NUMBER: u32 = 4;
