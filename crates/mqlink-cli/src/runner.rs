//! Scripted orchestration over one session.
//!
//! The session core never times anything out. The runner waits for each
//! operation's per-op callback up to the configured bound, counts a timeout
//! or an error event as a failed step, then disconnects and reconnects before
//! moving on.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::TryRecvError;
use log::{debug, error, info, warn};
use mqlink_client::{
    ClientError, Completion, ConnectOptions, EngineFactory, Event, SessionManager,
    TcpEngineFactory,
};
use thiserror::Error;

use crate::config::{Config, StepAction, StepConfig};

/// Upper bound on one blocking dispatch while waiting.
const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{0}")]
    Rejected(String),
    #[error("no result within {0:?}")]
    Timeout(Duration),
    /// The command was a no-op, typically because nothing was connected.
    #[error("operation dropped without a result")]
    Dropped,
}

/// Outcome of one run.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub passed: usize,
    pub failed: usize,
    /// Messages received from the broker.
    pub messages: usize,
}

impl RunReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

pub struct Runner {
    session: SessionManager,
    options: ConnectOptions,
    timeout: Duration,
    messages: Arc<AtomicUsize>,
}

impl Runner {
    /// Runner over the built-in TCP/TLS engine.
    pub fn new(config: &Config) -> Result<Self, StepError> {
        Self::with_factory(TcpEngineFactory, config)
    }

    pub fn with_factory<F: EngineFactory>(factory: F, config: &Config) -> Result<Self, StepError> {
        let options = config
            .connect_options()
            .map_err(|e| StepError::Client(ClientError::InvalidOptions(e.to_string())))?;
        let session_config =
            mqlink_client::SessionConfig::default().stop_timeout(config.session.stop_timeout());
        let session = SessionManager::with_config(factory, session_config)?;
        Ok(Self {
            session,
            options,
            timeout: config.session.operation_timeout(),
            messages: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Connect, run `steps` in order, disconnect.
    ///
    /// Fails only when the first connect fails. Step failures are counted in
    /// the report.
    pub fn run(&mut self, steps: &[StepConfig]) -> Result<RunReport, StepError> {
        let messages = self.messages.clone();
        self.session.init(move |event: &Event| match event {
            Event::Message {
                topic,
                payload,
                qos,
                retained,
            } => {
                messages.fetch_add(1, Ordering::Relaxed);
                info!(
                    "message on {} ({:?}, retained={}): {}",
                    topic,
                    qos,
                    retained,
                    String::from_utf8_lossy(payload)
                );
            }
            Event::Error { .. } => warn!("{}", event),
            Event::Disconnected { code, .. } if *code != 0 => warn!("{}", event),
            _ => debug!("{}", event),
        });

        if let Err(e) = self.connect() {
            self.session.teardown();
            return Err(e);
        }

        let mut report = RunReport::default();
        for (i, step) in steps.iter().enumerate() {
            match self.execute(step) {
                Ok(()) => {
                    info!("step {} ({}) ok", i + 1, step);
                    report.passed += 1;
                }
                Err(e) => {
                    error!("step {} ({}) failed: {}", i + 1, step, e);
                    report.failed += 1;
                    self.resume();
                }
            }
        }

        if let Err(e) = self.disconnect() {
            debug!("final disconnect: {}", e);
        }
        // Let late events drain before tearing down.
        self.session.dispatch();
        self.session.teardown();

        report.messages = self.messages.load(Ordering::Relaxed);
        Ok(report)
    }

    fn execute(&mut self, step: &StepConfig) -> Result<(), StepError> {
        match step.action {
            StepAction::Subscribe => {
                let (topic, qos) = (step.topic.clone(), step.qos());
                self.await_op(|session, done| session.subscribe(topic, qos, Some(done)))
            }
            StepAction::Unsubscribe => {
                let topic = step.topic.clone();
                self.await_op(|session, done| session.unsubscribe(topic, Some(done)))
            }
            StepAction::Publish => {
                let topic = step.topic.clone();
                let payload = Bytes::from(step.payload.clone());
                let (qos, retain) = (step.qos(), step.retain);
                self.await_op(|session, done| {
                    session.publish(topic, payload, qos, retain, Some(done))
                })
            }
            StepAction::Wait => {
                self.pump_for(step.duration());
                Ok(())
            }
        }
    }

    fn connect(&mut self) -> Result<(), StepError> {
        info!(
            "connecting to {}:{}",
            self.options.broker, self.options.port
        );
        let options = self.options.clone();
        self.await_op(|session, done| session.connect(options, Some(done)))
    }

    fn disconnect(&mut self) -> Result<(), StepError> {
        self.await_op(|session, done| session.disconnect(Some(done)))
    }

    /// Best-effort disconnect and reconnect after a failed step.
    fn resume(&mut self) {
        if let Err(e) = self.disconnect() {
            debug!("disconnect before resume: {}", e);
        }
        if let Err(e) = self.connect() {
            error!("reconnect failed: {}", e);
        }
    }

    /// Issue one command and wait for its per-op callback.
    fn await_op<F>(&mut self, issue: F) -> Result<(), StepError>
    where
        F: FnOnce(&SessionManager, Completion) -> mqlink_client::Result<()>,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let done: Completion = Box::new(move |event: &Event| {
            let _ = tx.send(event.clone());
        });
        issue(&self.session, done)?;

        let deadline = Instant::now() + self.timeout;
        loop {
            match rx.try_recv() {
                Ok(Event::Error { message, code }) => {
                    return Err(StepError::Rejected(format!("[{}] {}", code, message)))
                }
                Ok(_) => return Ok(()),
                Err(TryRecvError::Disconnected) => return Err(StepError::Dropped),
                Err(TryRecvError::Empty) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(StepError::Timeout(self.timeout));
            }
            self.session.dispatch_timeout((deadline - now).min(POLL));
        }
    }

    fn pump_for(&mut self, duration: Duration) {
        let deadline = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.session.dispatch_timeout((deadline - now).min(POLL));
        }
    }
}
