//! Session manager behaviour against a scripted engine.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use mqlink_client::{
    ClientError, Completion, ConnectOptions, EngineCallbacks, EngineFactory, Event, MidAllocator,
    ProtocolEngine, QoS, Result, SessionConfig, SessionManager,
};
use parking_lot::Mutex;

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(150);

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Create(String),
    Start(String),
    Connect(String),
    Subscribe(String, String, QoS, u16),
    Unsubscribe(String, String, u16),
    Publish(String, String, Bytes, QoS, u16),
    Disconnect(String),
    Stop(String),
    Dropped(String),
}

struct ScriptedFactory {
    calls: Sender<Call>,
    engines: Sender<(String, EngineCallbacks)>,
}

impl EngineFactory for ScriptedFactory {
    fn create(
        &self,
        options: &ConnectOptions,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn ProtocolEngine>> {
        let name = options.client_id.clone();
        if name == "tls-broken" {
            return Err(ClientError::Tls("bad ca".to_string()));
        }
        self.calls.send(Call::Create(name.clone())).unwrap();
        self.engines.send((name.clone(), callbacks)).unwrap();
        Ok(Box::new(ScriptedEngine {
            name,
            calls: self.calls.clone(),
            mids: MidAllocator::starting_at(6),
        }))
    }
}

struct ScriptedEngine {
    name: String,
    calls: Sender<Call>,
    mids: MidAllocator,
}

impl ScriptedEngine {
    fn record(&self, call: Call) {
        let _ = self.calls.send(call);
    }

    fn mid(&mut self) -> Result<u16> {
        self.mids
            .allocate()
            .ok_or_else(|| ClientError::InvalidState("no mids".to_string()))
    }
}

impl ProtocolEngine for ScriptedEngine {
    fn start(&mut self) -> Result<()> {
        self.record(Call::Start(self.name.clone()));
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.record(Call::Connect(self.name.clone()));
        Ok(())
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<u16> {
        if topic == "refused/sync" {
            return Err(ClientError::Engine("subscribe refused".to_string()));
        }
        let mid = self.mid()?;
        self.record(Call::Subscribe(self.name.clone(), topic.to_string(), qos, mid));
        Ok(mid)
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<u16> {
        let mid = self.mid()?;
        self.record(Call::Unsubscribe(self.name.clone(), topic.to_string(), mid));
        Ok(mid)
    }

    fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS, _retain: bool) -> Result<u16> {
        let mid = self.mid()?;
        self.record(Call::Publish(
            self.name.clone(),
            topic.to_string(),
            payload,
            qos,
            mid,
        ));
        Ok(mid)
    }

    fn disconnect(&mut self) -> Result<()> {
        self.record(Call::Disconnect(self.name.clone()));
        Ok(())
    }

    fn stop(&mut self, _timeout: Duration) {
        self.record(Call::Stop(self.name.clone()));
    }
}

impl Drop for ScriptedEngine {
    fn drop(&mut self) {
        self.record(Call::Dropped(self.name.clone()));
    }
}

type Log = Arc<Mutex<Vec<String>>>;

struct Harness {
    session: SessionManager,
    calls: Receiver<Call>,
    engines: Receiver<(String, EngineCallbacks)>,
    log: Log,
}

impl Harness {
    fn new() -> Self {
        let mut harness = Self::uninitialized();
        let sink = harness.log.clone();
        harness
            .session
            .init(move |event: &Event| sink.lock().push(format!("global:{}", event)));
        harness
    }

    fn uninitialized() -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let (calls_tx, calls) = crossbeam_channel::unbounded();
        let (engines_tx, engines) = crossbeam_channel::unbounded();
        let factory = ScriptedFactory {
            calls: calls_tx,
            engines: engines_tx,
        };
        let config = SessionConfig::default().stop_timeout(Duration::from_millis(100));
        let session = SessionManager::with_config(factory, config).unwrap();
        Self {
            session,
            calls,
            engines,
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn per_op(&self) -> Option<Completion> {
        let sink = self.log.clone();
        Some(Box::new(move |event: &Event| {
            sink.lock().push(format!("op:{}", event))
        }))
    }

    fn connect(&self, client_id: &str, on_connect: Option<Completion>) -> EngineCallbacks {
        self.session
            .connect(ConnectOptions::new("b").client_id(client_id), on_connect)
            .unwrap();
        let (name, callbacks) = self.engines.recv_timeout(WAIT).unwrap();
        assert_eq!(name, client_id);
        callbacks
    }

    fn connected(&mut self, client_id: &str) -> EngineCallbacks {
        let callbacks = self.connect(client_id, None);
        callbacks.connected(0, false);
        self.pump(1);
        self.log.lock().clear();
        callbacks
    }

    /// Dispatch until the log holds `count` entries.
    fn pump(&mut self, count: usize) -> Vec<String> {
        let deadline = Instant::now() + WAIT;
        while self.log.lock().len() < count && Instant::now() < deadline {
            self.session.dispatch_timeout(Duration::from_millis(20));
        }
        self.log.lock().clone()
    }

    /// Assert nothing more reaches the host.
    fn assert_quiet(&mut self) {
        assert_eq!(self.session.dispatch_timeout(QUIET), 0);
    }

    /// Wait for the next engine call matching `pred`, returning it.
    fn wait_call(&self, pred: impl Fn(&Call) -> bool) -> Call {
        let deadline = Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let call = self
                .calls
                .recv_timeout(remaining)
                .expect("expected engine call");
            if pred(&call) {
                return call;
            }
        }
    }

    fn drain_calls(&self) -> Vec<Call> {
        let mut calls = Vec::new();
        while let Ok(call) = self.calls.recv_timeout(QUIET) {
            calls.push(call);
        }
        calls
    }
}

#[test]
fn test_connect_subscribe_publish_scenario() {
    let mut h = Harness::new();

    let cb = h.connect("c1", h.per_op());
    cb.connected(0, false);
    assert_eq!(
        h.pump(2),
        vec![
            "global:connected (session_present=false)",
            "op:connected (session_present=false)",
        ]
    );
    h.log.lock().clear();

    h.session.subscribe("t", QoS::AtLeastOnce, None).unwrap();
    let Call::Subscribe(_, topic, qos, sub_mid) =
        h.wait_call(|c| matches!(c, Call::Subscribe(..)))
    else {
        unreachable!()
    };
    assert_eq!((topic.as_str(), qos), ("t", QoS::AtLeastOnce));
    cb.subscribed(sub_mid, 1);
    assert_eq!(h.pump(1), vec!["global:subscribed to t (AtLeastOnce)"]);
    h.log.lock().clear();

    h.session
        .publish("t", "hello", QoS::AtLeastOnce, false, h.per_op())
        .unwrap();
    let call = h.wait_call(|c| matches!(c, Call::Publish(..)));
    assert_eq!(
        call,
        Call::Publish(
            "c1".into(),
            "t".into(),
            Bytes::from_static(b"hello"),
            QoS::AtLeastOnce,
            7
        )
    );
    cb.published(7);
    assert_eq!(
        h.pump(2),
        vec!["global:published mid 7", "op:published mid 7"]
    );
}

#[test]
fn test_rejected_handshake_is_error_and_not_retried() {
    let mut h = Harness::new();
    let ran_error = Arc::new(Mutex::new(None));
    let flag = ran_error.clone();

    let cb = h.connect(
        "c2",
        Some(Box::new(move |event: &Event| {
            *flag.lock() = Some(event.is_error())
        })),
    );
    cb.connected(5, false);
    assert_eq!(
        h.pump(1),
        vec!["global:error [5] Connection refused: not authorized"]
    );
    assert_eq!(*ran_error.lock(), Some(true));

    let calls = h.drain_calls();
    assert_eq!(
        calls,
        vec![
            Call::Create("c2".into()),
            Call::Start("c2".into()),
            Call::Connect("c2".into()),
            Call::Disconnect("c2".into()),
            Call::Stop("c2".into()),
            Call::Dropped("c2".into()),
        ]
    );

    // The engine's late disconnect belongs to a destroyed handle.
    cb.disconnected(7, "Connection closed by peer");
    h.assert_quiet();
}

#[test]
fn test_second_connect_destroys_first_handle_before_creating() {
    let mut h = Harness::new();
    let a_ran = Arc::new(Mutex::new(false));
    let flag = a_ran.clone();

    let cb_a = h.connect(
        "a",
        Some(Box::new(move |_: &Event| *flag.lock() = true)),
    );
    let cb_b = h.connect("b", h.per_op());

    let calls = h.drain_calls();
    assert_eq!(
        calls,
        vec![
            Call::Create("a".into()),
            Call::Start("a".into()),
            Call::Connect("a".into()),
            Call::Disconnect("a".into()),
            Call::Stop("a".into()),
            Call::Dropped("a".into()),
            Call::Create("b".into()),
            Call::Start("b".into()),
            Call::Connect("b".into()),
        ]
    );

    cb_a.connected(0, false);
    cb_b.connected(0, true);
    assert_eq!(
        h.pump(2),
        vec![
            "global:connected (session_present=true)",
            "op:connected (session_present=true)",
        ]
    );
    h.assert_quiet();
    assert!(!*a_ran.lock());
}

#[test]
fn test_stale_generation_results_never_reach_host() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    h.session
        .publish(
            "t",
            "x",
            QoS::AtLeastOnce,
            false,
            Some(Box::new(move |_: &Event| *flag.lock() = true)),
        )
        .unwrap();
    let Call::Publish(.., mid) = h.wait_call(|c| matches!(c, Call::Publish(..))) else {
        unreachable!()
    };

    // Acknowledged and forwarded by the serializer, not yet dispatched.
    cb.published(mid);
    std::thread::sleep(Duration::from_millis(100));

    let old_generation = h.session.generation();
    h.session.teardown();
    assert!(!h.session.is_alive());

    let fresh: Log = Arc::new(Mutex::new(Vec::new()));
    let sink = fresh.clone();
    let new_generation = h
        .session
        .init(move |event: &Event| sink.lock().push(format!("global:{}", event)));
    assert!(new_generation > old_generation);

    cb.published(mid);
    cb.disconnected(7, "late");
    h.assert_quiet();

    assert!(h.log.lock().is_empty());
    assert!(fresh.lock().is_empty());
    assert!(!*ran.lock());

    let calls = h.drain_calls();
    assert!(calls.contains(&Call::Dropped("c1".into())));
}

#[test]
fn test_acknowledgment_is_delivered_at_most_once() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    h.session
        .publish("t", "x", QoS::AtMostOnce, false, h.per_op())
        .unwrap();
    let Call::Publish(.., mid) = h.wait_call(|c| matches!(c, Call::Publish(..))) else {
        unreachable!()
    };

    cb.published(mid);
    cb.published(mid);
    assert_eq!(
        h.pump(2),
        vec![
            format!("global:published mid {}", mid),
            format!("op:published mid {}", mid),
        ]
    );
    h.assert_quiet();
}

#[test]
fn test_acknowledgment_of_wrong_kind_is_ignored() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    h.session.unsubscribe("t", h.per_op()).unwrap();
    let Call::Unsubscribe(_, _, mid) = h.wait_call(|c| matches!(c, Call::Unsubscribe(..))) else {
        unreachable!()
    };

    cb.published(mid);
    h.assert_quiet();

    cb.unsubscribed(mid);
    assert_eq!(
        h.pump(2),
        vec!["global:unsubscribed from t", "op:unsubscribed from t"]
    );
}

#[test]
fn test_global_observer_runs_before_per_op_callback() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    for topic in ["a", "b", "c"] {
        h.session
            .subscribe(topic, QoS::ExactlyOnce, h.per_op())
            .unwrap();
    }
    let mut mids = Vec::new();
    for _ in 0..3 {
        if let Call::Subscribe(_, _, _, mid) = h.wait_call(|c| matches!(c, Call::Subscribe(..))) {
            mids.push(mid);
        }
    }
    for mid in mids.iter().rev() {
        cb.subscribed(*mid, 2);
    }

    let log = h.pump(6);
    assert_eq!(log.len(), 6);
    for pair in log.chunks(2) {
        assert!(pair[0].starts_with("global:subscribed to "));
        assert_eq!(pair[1], pair[0].replacen("global:", "op:", 1));
    }
    assert_eq!(log[0], "global:subscribed to c (ExactlyOnce)");
}

#[test]
fn test_operations_without_connection_are_noops() {
    let mut h = Harness::new();

    h.session.subscribe("t", QoS::AtLeastOnce, h.per_op()).unwrap();
    h.session.unsubscribe("t", h.per_op()).unwrap();
    h.session
        .publish("t", "x", QoS::AtMostOnce, false, h.per_op())
        .unwrap();
    h.session.disconnect(h.per_op()).unwrap();

    // Commands are serialized, so the engine's first call proves the
    // earlier ones were already processed.
    h.connect("c1", None);
    assert_eq!(
        h.calls.recv_timeout(WAIT).unwrap(),
        Call::Create("c1".into())
    );
    h.assert_quiet();
    assert!(h.log.lock().is_empty());
}

#[test]
fn test_user_disconnect_delivers_exactly_once() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    h.session.disconnect(h.per_op()).unwrap();
    assert_eq!(
        h.pump(2),
        vec![
            "global:disconnected [0] Clean disconnect",
            "op:disconnected [0] Clean disconnect",
        ]
    );

    let calls = h.drain_calls();
    let tail: Vec<_> = calls.iter().rev().take(3).rev().cloned().collect();
    assert_eq!(
        tail,
        vec![
            Call::Disconnect("c1".into()),
            Call::Stop("c1".into()),
            Call::Dropped("c1".into()),
        ]
    );

    cb.disconnected(0, "Clean disconnect");
    h.assert_quiet();

    // Nothing is connected any more.
    h.session.subscribe("t", QoS::AtMostOnce, h.per_op()).unwrap();
    h.assert_quiet();
    assert!(h.drain_calls().is_empty());
}

#[test]
fn test_runtime_disconnect_delivers_once_and_retires_handle() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    cb.disconnected(7, "Connection closed by peer");
    cb.disconnected(7, "Connection closed by peer");
    assert_eq!(
        h.pump(1),
        vec!["global:disconnected [7] Connection closed by peer"]
    );
    h.assert_quiet();

    let calls = h.drain_calls();
    assert!(calls.contains(&Call::Dropped("c1".into())));

    h.session.publish("t", "x", QoS::AtMostOnce, false, None).unwrap();
    assert!(h.drain_calls().is_empty());
}

#[test]
fn test_runtime_disconnect_releases_pending_operations() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    let (ran_tx, ran_rx) = crossbeam_channel::unbounded::<()>();
    h.session
        .publish(
            "t",
            "x",
            QoS::AtLeastOnce,
            false,
            Some(Box::new(move |_: &Event| {
                let _ = ran_tx.send(());
            })),
        )
        .unwrap();
    let Call::Publish(.., mid) = h.wait_call(|c| matches!(c, Call::Publish(..))) else {
        unreachable!()
    };

    cb.disconnected(7, "Connection closed by peer");
    assert_eq!(
        h.pump(1),
        vec!["global:disconnected [7] Connection closed by peer"]
    );

    // The completion was dropped without running.
    assert_eq!(
        ran_rx.try_recv(),
        Err(crossbeam_channel::TryRecvError::Disconnected)
    );
    cb.published(mid);
    h.assert_quiet();
}

#[test]
fn test_pre_handshake_disconnect_is_suppressed() {
    let mut h = Harness::new();
    let cb = h.connect("c1", h.per_op());

    cb.disconnected(7, "transient");
    h.assert_quiet();

    cb.connected(0, false);
    assert_eq!(
        h.pump(2),
        vec![
            "global:connected (session_present=false)",
            "op:connected (session_present=false)",
        ]
    );
}

#[test]
fn test_transport_failure_is_error_event() {
    let mut h = Harness::new();
    let is_error = Arc::new(Mutex::new(None));
    let flag = is_error.clone();

    let cb = h.connect(
        "c1",
        Some(Box::new(move |event: &Event| {
            *flag.lock() = Some(event.is_error())
        })),
    );
    cb.connect_failed(-3, "I/O error: connection refused");
    assert_eq!(
        h.pump(1),
        vec!["global:error [-3] I/O error: connection refused"]
    );
    assert_eq!(*is_error.lock(), Some(true));

    // No disconnected event follows a failed connect.
    cb.disconnected(7, "gone");
    h.assert_quiet();
}

#[test]
fn test_engine_creation_failure_is_error_event() {
    let mut h = Harness::new();

    h.session
        .connect(ConnectOptions::new("b").client_id("tls-broken"), h.per_op())
        .unwrap();
    assert_eq!(
        h.pump(2),
        vec![
            "global:error [-2] TLS error: bad ca",
            "op:error [-2] TLS error: bad ca",
        ]
    );
    assert!(h.drain_calls().is_empty());
}

#[test]
fn test_rejected_subscription_is_error_event() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    h.session
        .subscribe("private/#", QoS::AtLeastOnce, h.per_op())
        .unwrap();
    let Call::Subscribe(.., mid) = h.wait_call(|c| matches!(c, Call::Subscribe(..))) else {
        unreachable!()
    };
    cb.subscribed(mid, 0x80);
    assert_eq!(
        h.pump(2),
        vec![
            "global:error [128] Subscribe failed for private/#",
            "op:error [128] Subscribe failed for private/#",
        ]
    );
}

#[test]
fn test_synchronous_primitive_failure_releases_callback() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    h.session
        .subscribe("refused/sync", QoS::AtMostOnce, h.per_op())
        .unwrap();
    h.assert_quiet();

    // A stray ack for the mid the engine never issued finds nothing.
    cb.subscribed(6, 0);
    h.assert_quiet();
}

#[test]
fn test_reconnect_purges_pending_operations() {
    let mut h = Harness::new();
    let first = h.connected("c1");

    let ran = Arc::new(Mutex::new(false));
    let flag = ran.clone();
    h.session
        .publish(
            "t",
            "x",
            QoS::AtLeastOnce,
            false,
            Some(Box::new(move |_: &Event| *flag.lock() = true)),
        )
        .unwrap();
    let Call::Publish(.., mid) = h.wait_call(|c| matches!(c, Call::Publish(..))) else {
        unreachable!()
    };

    let second = h.connected("c2");
    first.published(mid);
    second.published(mid);
    h.assert_quiet();
    assert!(!*ran.lock());
}

#[test]
fn test_messages_reach_global_observer_only() {
    let mut h = Harness::new();
    let cb = h.connected("c1");

    cb.message("sensors/t", Bytes::from_static(b"21.5"), QoS::AtLeastOnce, true);
    assert_eq!(
        h.pump(1),
        vec!["global:message on sensors/t (4 bytes, AtLeastOnce, retained=true)"]
    );
}

#[test]
fn test_invalid_arguments_fail_synchronously() {
    let h = Harness::new();

    assert!(matches!(
        h.session.connect(ConnectOptions::new(""), None),
        Err(ClientError::InvalidOptions(_))
    ));
    assert!(matches!(
        h.session.subscribe("a/#/b", QoS::AtMostOnce, None),
        Err(ClientError::InvalidOptions(_))
    ));
    assert!(matches!(
        h.session.publish("a/+", "x", QoS::AtMostOnce, false, None),
        Err(ClientError::InvalidOptions(_))
    ));
    assert!(h.drain_calls().is_empty());
}

#[test]
fn test_commands_require_initialized_context() {
    let h = Harness::uninitialized();
    assert!(!h.session.is_alive());
    assert!(matches!(
        h.session.connect(ConnectOptions::new("b"), None),
        Err(ClientError::InvalidState(_))
    ));
    assert!(h.drain_calls().is_empty());
}

#[test]
fn test_generated_client_id_reaches_engine() {
    let h = Harness::new();
    h.session.connect(ConnectOptions::new("b"), None).unwrap();
    let (name, _) = h.engines.recv_timeout(WAIT).unwrap();
    assert!(name.starts_with("mqlink-"));
}

#[test]
fn test_drop_destroys_live_connection() {
    let mut h = Harness::new();
    h.connected("c1");
    h.drain_calls();

    let calls = h.calls.clone();
    drop(h.session);
    let mut seen = Vec::new();
    while let Ok(call) = calls.recv_timeout(QUIET) {
        seen.push(call);
    }
    assert_eq!(
        seen,
        vec![
            Call::Disconnect("c1".into()),
            Call::Stop("c1".into()),
            Call::Dropped("c1".into()),
        ]
    );
}
