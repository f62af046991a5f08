//! Session state: the one live connection handle, its phase flags, the
//! single-slot connect/disconnect callbacks and the correlation table.
//!
//! Only the serializer thread owns a `SessionState`.

use std::sync::Arc;

use bytes::Bytes;
use crossbeam_channel::Sender;
use log::{debug, info, warn};
use mqlink_core::packet::{ConnackCode, QoS, SUBACK_FAILURE};

use crate::config::{ConnectOptions, SessionConfig};
use crate::correlation::{CorrelationTable, OpKind, PendingOp};
use crate::engine::{ConnectionId, EngineCallbacks, EngineEvent, EngineFactory, ProtocolEngine, Signal};
use crate::epoch::Epoch;
use crate::error::{code, ClientError};
use crate::events::{ConnectionState, Event};
use crate::observer::Completion;
use crate::serializer::{Command, Delivery};

/// The live engine connection.
struct Handle {
    id: ConnectionId,
    /// Generation of the connect command that created it.
    generation: u64,
    engine: Box<dyn ProtocolEngine>,
}

/// Reset at the start of every connect.
#[derive(Debug, Default, Clone, Copy)]
struct PhaseFlags {
    ever_connected: bool,
    user_initiated: bool,
    disconnect_delivered: bool,
}

pub(crate) struct SessionState {
    factory: Box<dyn EngineFactory>,
    epoch: Arc<Epoch>,
    config: SessionConfig,
    /// Handed to engines through their callbacks.
    commands: Sender<Command>,
    deliveries: Sender<Delivery>,
    handle: Option<Handle>,
    next_connection: u64,
    state: ConnectionState,
    flags: PhaseFlags,
    on_connect: Option<Completion>,
    on_disconnect: Option<Completion>,
    pending: CorrelationTable,
}

impl SessionState {
    pub(crate) fn new(
        factory: Box<dyn EngineFactory>,
        epoch: Arc<Epoch>,
        config: SessionConfig,
        commands: Sender<Command>,
        deliveries: Sender<Delivery>,
    ) -> Self {
        Self {
            factory,
            epoch,
            config,
            commands,
            deliveries,
            handle: None,
            next_connection: 1,
            state: ConnectionState::Idle,
            flags: PhaseFlags::default(),
            on_connect: None,
            on_disconnect: None,
            pending: CorrelationTable::new(),
        }
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        self.epoch.is_current(generation)
    }

    pub(crate) fn apply(&mut self, command: Command) {
        match command {
            Command::Connect {
                generation,
                options,
                completion,
            } => self.connect(generation, options, completion),
            Command::Disconnect {
                generation,
                completion,
            } => self.disconnect(generation, completion),
            Command::Subscribe {
                topic,
                qos,
                completion,
                ..
            } => self.subscribe(topic, qos, completion),
            Command::Unsubscribe {
                topic, completion, ..
            } => self.unsubscribe(topic, completion),
            Command::Publish {
                topic,
                payload,
                qos,
                retain,
                completion,
                ..
            } => self.publish(topic, payload, qos, retain, completion),
            Command::Engine(event) => self.engine_event(event),
            Command::Teardown => self.teardown(),
            Command::Shutdown => self.shutdown(),
        }
    }

    fn connect(&mut self, generation: u64, options: ConnectOptions, completion: Option<Completion>) {
        self.on_connect = None;
        self.on_disconnect = None;
        let purged = self.pending.purge();
        if purged > 0 {
            debug!("purged {} pending operations before connect", purged);
        }
        if let Some(handle) = self.handle.take() {
            debug!("closing {} before reconnecting", handle.id);
            self.flags.user_initiated = true;
            self.close(handle);
        }

        self.flags = PhaseFlags::default();
        self.on_connect = completion;

        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        let callbacks = EngineCallbacks::new(self.commands.clone(), generation, id);

        let mut engine = match self.factory.create(&options, callbacks) {
            Ok(engine) => engine,
            Err(e) => return self.fail_connect(generation, e),
        };
        if let Err(e) = engine.start() {
            return self.fail_connect(generation, e);
        }
        if let Err(e) = engine.connect() {
            engine.stop(self.config.stop_timeout);
            return self.fail_connect(generation, e);
        }

        info!(
            "connecting {} to {}:{} as {}",
            id, options.broker, options.port, options.client_id
        );
        self.handle = Some(Handle {
            id,
            generation,
            engine,
        });
        self.set_state(ConnectionState::Connecting);
    }

    fn fail_connect(&mut self, generation: u64, error: ClientError) {
        warn!("connect failed: {}", error);
        let completion = self.on_connect.take();
        self.deliver(
            generation,
            Event::Error {
                message: error.to_string(),
                code: error.code(),
            },
            completion,
        );
        self.set_state(ConnectionState::Idle);
    }

    fn disconnect(&mut self, generation: u64, completion: Option<Completion>) {
        let Some(handle) = self.handle.take() else {
            warn!("disconnect ignored: not connected");
            return;
        };

        self.on_disconnect = completion;
        self.flags.user_initiated = true;
        self.flags.disconnect_delivered = false;
        self.set_state(ConnectionState::Disconnecting);
        self.close(handle);
        self.set_state(ConnectionState::Idle);

        // The engine's own `disconnected` arrives for a retired handle and is
        // dropped, so the clean event is synthesized here.
        if !self.flags.disconnect_delivered {
            self.flags.disconnect_delivered = true;
            let completion = self.on_disconnect.take();
            self.deliver(
                generation,
                Event::Disconnected {
                    code: code::CLEAN,
                    message: "Clean disconnect".to_string(),
                },
                completion,
            );
        }
    }

    fn subscribe(&mut self, topic: String, qos: QoS, completion: Option<Completion>) {
        let Some(handle) = self.handle.as_mut() else {
            warn!("subscribe to '{}' ignored: not connected", topic);
            return;
        };
        match handle.engine.subscribe(&topic, qos) {
            Ok(mid) => self.record(mid, PendingOp::Subscribe { topic, completion }),
            Err(e) => warn!("subscribe to '{}' failed: {}", topic, e),
        }
    }

    fn unsubscribe(&mut self, topic: String, completion: Option<Completion>) {
        let Some(handle) = self.handle.as_mut() else {
            warn!("unsubscribe from '{}' ignored: not connected", topic);
            return;
        };
        match handle.engine.unsubscribe(&topic) {
            Ok(mid) => self.record(mid, PendingOp::Unsubscribe { topic, completion }),
            Err(e) => warn!("unsubscribe from '{}' failed: {}", topic, e),
        }
    }

    fn publish(
        &mut self,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
        completion: Option<Completion>,
    ) {
        let Some(handle) = self.handle.as_mut() else {
            warn!("publish to '{}' ignored: not connected", topic);
            return;
        };
        match handle.engine.publish(&topic, payload, qos, retain) {
            Ok(mid) => self.record(mid, PendingOp::Publish { completion }),
            Err(e) => warn!("publish to '{}' failed: {}", topic, e),
        }
    }

    fn record(&mut self, mid: u16, op: PendingOp) {
        if let Some(displaced) = self.pending.insert(mid, op) {
            warn!(
                "engine reused mid {} while a {} was pending; dropping it",
                mid,
                displaced.kind()
            );
        }
    }

    fn engine_event(&mut self, event: EngineEvent) {
        let EngineEvent {
            generation,
            connection,
            signal,
        } = event;

        let Some(handle) = self.handle.as_ref().filter(|h| h.id == connection) else {
            debug!(
                "discarding {} from retired connection {}",
                signal.name(),
                connection
            );
            return;
        };
        if handle.generation != generation || !self.epoch.is_current(generation) {
            if let Some(mid) = signal.mid() {
                self.pending.discard(mid);
            }
            debug!(
                "discarding {} stamped with stale generation {}",
                signal.name(),
                generation
            );
            return;
        }

        match signal {
            Signal::Connected {
                return_code,
                session_present,
            } => self.on_connack(generation, return_code, session_present),
            Signal::ConnectFailed { code, message } => {
                warn!("connection {} failed: {}", connection, message);
                self.retire_handle();
                self.flags.disconnect_delivered = true;
                let completion = self.on_connect.take();
                self.deliver(generation, Event::Error { message, code }, completion);
                self.set_state(ConnectionState::Idle);
            }
            Signal::Disconnected { code, message } => {
                self.on_engine_disconnect(generation, code, message)
            }
            Signal::Message {
                topic,
                payload,
                qos,
                retained,
            } => self.deliver(
                generation,
                Event::Message {
                    topic,
                    payload,
                    qos,
                    retained,
                },
                None,
            ),
            Signal::Subscribed { mid, granted } => self.on_suback(generation, mid, granted),
            Signal::Published { mid } => match self.pending.take(mid, OpKind::Publish) {
                Some(PendingOp::Publish { completion }) => {
                    self.deliver(generation, Event::Published { mid }, completion)
                }
                _ => debug!("no pending publish for mid {}", mid),
            },
            Signal::Unsubscribed { mid } => match self.pending.take(mid, OpKind::Unsubscribe) {
                Some(PendingOp::Unsubscribe { topic, completion }) => {
                    self.deliver(generation, Event::Unsubscribed { topic }, completion)
                }
                _ => debug!("no pending unsubscribe for mid {}", mid),
            },
        }
    }

    fn on_connack(&mut self, generation: u64, return_code: u8, session_present: bool) {
        let completion = self.on_connect.take();
        if return_code == ConnackCode::Accepted as u8 {
            self.flags.ever_connected = true;
            self.set_state(ConnectionState::Connected);
            self.deliver(generation, Event::Connected { session_present }, completion);
            return;
        }

        let message = match ConnackCode::from_u8(return_code) {
            Some(code) => code.description().to_string(),
            None => format!("Connection refused: return code {}", return_code),
        };
        warn!("{}", message);
        // Close right away so the engine does not retry.
        self.retire_handle();
        self.flags.disconnect_delivered = true;
        self.set_state(ConnectionState::Idle);
        self.deliver(
            generation,
            Event::Error {
                message,
                code: i32::from(return_code),
            },
            completion,
        );
    }

    fn on_engine_disconnect(&mut self, generation: u64, code: i32, message: String) {
        if !self.flags.ever_connected && !self.flags.user_initiated {
            debug!("suppressing pre-handshake disconnect: {}", message);
            return;
        }
        if self.flags.disconnect_delivered {
            debug!("disconnect already delivered, dropping: {}", message);
            return;
        }

        self.flags.disconnect_delivered = true;
        self.retire_handle();
        // Acks from the retired connection are dropped, so nothing can
        // complete these.
        let purged = self.pending.purge();
        if purged > 0 {
            debug!("released {} pending operations on disconnect", purged);
        }
        self.set_state(ConnectionState::Idle);
        let completion = self.on_disconnect.take();
        self.deliver(generation, Event::Disconnected { code, message }, completion);
    }

    fn on_suback(&mut self, generation: u64, mid: u16, granted: u8) {
        let Some(PendingOp::Subscribe { topic, completion }) =
            self.pending.take(mid, OpKind::Subscribe)
        else {
            debug!("no pending subscribe for mid {}", mid);
            return;
        };

        let event = if granted == SUBACK_FAILURE {
            warn!("broker rejected subscription to '{}'", topic);
            Event::Error {
                message: format!("Subscribe failed for {}", topic),
                code: code::SUBSCRIBE_REJECTED,
            }
        } else {
            match QoS::try_from(granted) {
                Ok(granted_qos) => Event::Subscribed { topic, granted_qos },
                Err(e) => Event::Error {
                    message: format!("Subscribe failed for {}: {}", topic, e),
                    code: code::PROTOCOL,
                },
            }
        };
        self.deliver(generation, event, completion);
    }

    fn teardown(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.flags.user_initiated = true;
            self.close(handle);
        }
        let purged = self.pending.purge();
        self.on_connect = None;
        self.on_disconnect = None;
        self.flags = PhaseFlags::default();
        self.set_state(ConnectionState::Idle);
        debug!("teardown complete, {} pending operations released", purged);
    }

    pub(crate) fn shutdown(&mut self) {
        if self.handle.is_some() || self.pending.len() > 0 {
            self.teardown();
        }
    }

    /// Close and destroy the live handle, if any.
    fn retire_handle(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.close(handle);
        }
    }

    /// Request a clean close, stop the background context, destroy the
    /// handle. Emits nothing.
    fn close(&self, mut handle: Handle) {
        if let Err(e) = handle.engine.disconnect() {
            debug!("close of {}: {}", handle.id, e);
        }
        handle.engine.stop(self.config.stop_timeout);
        debug!("destroyed {}", handle.id);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("connection state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
    }

    fn deliver(&self, generation: u64, event: Event, completion: Option<Completion>) {
        debug!("delivering {}", event);
        let delivery = Delivery {
            generation,
            event,
            completion,
        };
        if self.deliveries.send(delivery).is_err() {
            debug!("host receiver gone, delivery dropped");
        }
    }
}
