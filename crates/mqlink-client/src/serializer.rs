//! The single writer over session state.
//!
//! Host commands and engine callbacks share one queue, so every mutation of
//! the connection handle, the phase flags and the correlation table happens
//! on the serializer thread in submission order.

use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use log::debug;
use mqlink_core::packet::QoS;

use crate::config::ConnectOptions;
use crate::engine::EngineEvent;
use crate::error::{ClientError, Result};
use crate::events::Event;
use crate::observer::Completion;
use crate::session::SessionState;

/// Work for the serializer. Host commands carry the generation that was
/// current when they were issued.
pub(crate) enum Command {
    Connect {
        generation: u64,
        options: ConnectOptions,
        completion: Option<Completion>,
    },
    Disconnect {
        generation: u64,
        completion: Option<Completion>,
    },
    Subscribe {
        generation: u64,
        topic: String,
        qos: QoS,
        completion: Option<Completion>,
    },
    Unsubscribe {
        generation: u64,
        topic: String,
        completion: Option<Completion>,
    },
    Publish {
        generation: u64,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        completion: Option<Completion>,
    },
    Engine(EngineEvent),
    Teardown,
    Shutdown,
}

impl Command {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "connect",
            Command::Disconnect { .. } => "disconnect",
            Command::Subscribe { .. } => "subscribe",
            Command::Unsubscribe { .. } => "unsubscribe",
            Command::Publish { .. } => "publish",
            Command::Engine(_) => "engine event",
            Command::Teardown => "teardown",
            Command::Shutdown => "shutdown",
        }
    }

    /// Generation stamped on a host command.
    fn generation(&self) -> Option<u64> {
        match self {
            Command::Connect { generation, .. }
            | Command::Disconnect { generation, .. }
            | Command::Subscribe { generation, .. }
            | Command::Unsubscribe { generation, .. }
            | Command::Publish { generation, .. } => Some(*generation),
            _ => None,
        }
    }
}

/// An event on its way to the host, with the per-op completion that should
/// see it after the global observer.
pub(crate) struct Delivery {
    pub(crate) generation: u64,
    pub(crate) event: Event,
    pub(crate) completion: Option<Completion>,
}

/// Run `state` on a dedicated thread until a `Shutdown` command arrives.
pub(crate) fn spawn(mut state: SessionState, commands: Receiver<Command>) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("mqlink-serializer".to_string())
        .spawn(move || {
            for command in commands.iter() {
                if let Command::Shutdown = command {
                    break;
                }
                if let Some(generation) = command.generation() {
                    if !state.is_current(generation) {
                        debug!(
                            "discarding {} issued under stale generation {}",
                            command.name(),
                            generation
                        );
                        continue;
                    }
                }
                state.apply(command);
            }
            state.shutdown();
            debug!("serializer stopped");
        })
        .map_err(|e| ClientError::Engine(format!("failed to spawn serializer: {}", e)))
}
