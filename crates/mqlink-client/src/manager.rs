//! Host-facing session manager.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use mqlink_core::packet::{self, QoS};

use crate::config::{ConnectOptions, SessionConfig};
use crate::engine::{EngineFactory, TcpEngineFactory};
use crate::epoch::Epoch;
use crate::error::{ClientError, Result};
use crate::observer::{Completion, SessionObserver};
use crate::serializer::{self, Command, Delivery};
use crate::session::SessionState;

/// Cloneable command sender.
///
/// Commands return immediately; their outcome arrives as events on the
/// thread that drives [`SessionManager::dispatch`]. A handle can be moved
/// into completions to chain operations.
#[derive(Clone)]
pub struct SessionHandle {
    epoch: Arc<Epoch>,
    commands: Sender<Command>,
}

impl SessionHandle {
    /// Open a connection, closing any existing one first.
    ///
    /// Invalid options are reported here and nothing is queued.
    pub fn connect(&self, options: ConnectOptions, on_connect: Option<Completion>) -> Result<()> {
        let options = options.resolve()?;
        let generation = self.live_generation()?;
        self.send(Command::Connect {
            generation,
            options,
            completion: on_connect,
        })
    }

    pub fn disconnect(&self, on_disconnect: Option<Completion>) -> Result<()> {
        let generation = self.live_generation()?;
        self.send(Command::Disconnect {
            generation,
            completion: on_disconnect,
        })
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        on_subscribed: Option<Completion>,
    ) -> Result<()> {
        let topic = topic.into();
        packet::validate_topic_filter(&topic)
            .map_err(|e| ClientError::InvalidOptions(e.to_string()))?;
        let generation = self.live_generation()?;
        self.send(Command::Subscribe {
            generation,
            topic,
            qos,
            completion: on_subscribed,
        })
    }

    pub fn unsubscribe(
        &self,
        topic: impl Into<String>,
        on_unsubscribed: Option<Completion>,
    ) -> Result<()> {
        let topic = topic.into();
        packet::validate_topic_filter(&topic)
            .map_err(|e| ClientError::InvalidOptions(e.to_string()))?;
        let generation = self.live_generation()?;
        self.send(Command::Unsubscribe {
            generation,
            topic,
            completion: on_unsubscribed,
        })
    }

    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        on_published: Option<Completion>,
    ) -> Result<()> {
        let topic = topic.into();
        packet::validate_topic_name(&topic)
            .map_err(|e| ClientError::InvalidOptions(e.to_string()))?;
        let generation = self.live_generation()?;
        self.send(Command::Publish {
            generation,
            topic,
            payload: payload.into(),
            qos,
            retain,
            completion: on_published,
        })
    }

    fn live_generation(&self) -> Result<u64> {
        if !self.epoch.is_alive() {
            return Err(ClientError::InvalidState(
                "session manager is not initialized".to_string(),
            ));
        }
        Ok(self.epoch.generation())
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ClientError::InvalidState("serializer has stopped".to_string()))
    }
}

/// Owns one broker connection at a time on behalf of a host context.
///
/// ```ignore
/// use mqlink_client::{ConnectOptions, Event, QoS, SessionManager};
///
/// let mut session = SessionManager::with_tcp_engine()?;
/// session.init(|event: &Event| println!("{}", event));
/// session.connect(ConnectOptions::new("localhost").client_id("c1"), None)?;
/// session.subscribe("sensors/#", QoS::AtLeastOnce, None)?;
///
/// loop {
///     session.dispatch_timeout(std::time::Duration::from_millis(100));
/// }
/// ```
pub struct SessionManager {
    handle: SessionHandle,
    deliveries: Receiver<Delivery>,
    observer: Option<Box<dyn SessionObserver>>,
    serializer: Option<JoinHandle<()>>,
}

impl SessionManager {
    /// Create a manager driving engines from `factory`.
    pub fn new<F: EngineFactory>(factory: F) -> Result<Self> {
        Self::with_config(factory, SessionConfig::default())
    }

    pub fn with_config<F: EngineFactory>(factory: F, config: SessionConfig) -> Result<Self> {
        let epoch = Arc::new(Epoch::new());
        let (commands, command_rx) = crossbeam_channel::unbounded();
        let (delivery_tx, deliveries) = crossbeam_channel::unbounded();

        let state = SessionState::new(
            Box::new(factory),
            epoch.clone(),
            config,
            commands.clone(),
            delivery_tx,
        );
        let serializer = serializer::spawn(state, command_rx)?;

        Ok(Self {
            handle: SessionHandle { epoch, commands },
            deliveries,
            observer: None,
            serializer: Some(serializer),
        })
    }

    /// Create a manager using the built-in TCP/TLS engine.
    pub fn with_tcp_engine() -> Result<Self> {
        Self::new(TcpEngineFactory)
    }

    /// Begin a new generation with `observer` as the global listener.
    ///
    /// An already live context is torn down first. Returns the generation.
    pub fn init<O: SessionObserver + 'static>(&mut self, observer: O) -> u64 {
        if self.is_alive() {
            self.teardown();
        }
        let generation = self.handle.epoch.begin();
        self.observer = Some(Box::new(observer));
        info!("session generation {} started", generation);
        generation
    }

    /// Invalidate the current generation and destroy the connection.
    ///
    /// Results still in flight are discarded, never delivered.
    pub fn teardown(&mut self) {
        if !self.is_alive() {
            return;
        }
        self.handle.epoch.end();
        if self.handle.commands.send(Command::Teardown).is_err() {
            warn!("teardown: serializer has stopped");
        }
        self.observer = None;
        info!("session generation {} torn down", self.generation());
    }

    /// A cloneable sender for commands.
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn connect(&self, options: ConnectOptions, on_connect: Option<Completion>) -> Result<()> {
        self.handle.connect(options, on_connect)
    }

    pub fn disconnect(&self, on_disconnect: Option<Completion>) -> Result<()> {
        self.handle.disconnect(on_disconnect)
    }

    pub fn subscribe(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        on_subscribed: Option<Completion>,
    ) -> Result<()> {
        self.handle.subscribe(topic, qos, on_subscribed)
    }

    pub fn unsubscribe(
        &self,
        topic: impl Into<String>,
        on_unsubscribed: Option<Completion>,
    ) -> Result<()> {
        self.handle.unsubscribe(topic, on_unsubscribed)
    }

    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Bytes>,
        qos: QoS,
        retain: bool,
        on_published: Option<Completion>,
    ) -> Result<()> {
        self.handle
            .publish(topic, payload, qos, retain, on_published)
    }

    /// Deliver everything that is ready without blocking. Returns the number
    /// of events delivered.
    pub fn dispatch(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(delivery) = self.deliveries.try_recv() {
            delivered += usize::from(self.deliver(delivery));
        }
        delivered
    }

    /// Wait up to `timeout` for the first delivery, then drain the rest.
    pub fn dispatch_timeout(&mut self, timeout: Duration) -> usize {
        match self.deliveries.recv_timeout(timeout) {
            Ok(delivery) => usize::from(self.deliver(delivery)) + self.dispatch(),
            Err(_) => 0,
        }
    }

    pub fn generation(&self) -> u64 {
        self.handle.epoch.generation()
    }

    pub fn is_alive(&self) -> bool {
        self.handle.epoch.is_alive()
    }

    /// Global observer first, then the per-op completion.
    fn deliver(&mut self, delivery: Delivery) -> bool {
        let Delivery {
            generation,
            event,
            completion,
        } = delivery;

        if !self.handle.epoch.is_current(generation) {
            debug!(
                "dropping stale {} from generation {}",
                event.name(),
                generation
            );
            return false;
        }
        if let Some(observer) = self.observer.as_mut() {
            observer.on_event(&event);
        }
        if let Some(completion) = completion {
            completion(&event);
        }
        true
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.teardown();
        let _ = self.handle.commands.send(Command::Shutdown);
        if let Some(serializer) = self.serializer.take() {
            if serializer.join().is_err() {
                warn!("serializer thread panicked");
            }
        }
    }
}
