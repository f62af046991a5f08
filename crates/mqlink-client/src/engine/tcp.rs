//! Built-in MQTT 3.1.1 engine over TCP or TLS.
//!
//! Each connection runs on its own thread with a current-thread tokio
//! runtime. The serializer talks to it through an unbounded request channel;
//! mids are allocated synchronously on the caller's side so every primitive
//! returns immediately.

use std::collections::HashSet;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, info, warn};
use mqlink_core::packet::{
    decode_packet, encode_packet, Connack, Connect, Packet, Publish, QoS, Subscribe, Unsubscribe,
};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use super::{EngineCallbacks, EngineFactory, ProtocolEngine};
use crate::config::ConnectOptions;
use crate::error::{code, ClientError, Result};
use crate::mid::MidAllocator;
use crate::tls;

const DEFAULT_BUFFER_SIZE: usize = 8192;
/// How long a clean close may spend flushing DISCONNECT.
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);
/// Placeholder period for the ping timer when keep-alive is disabled.
const IDLE_PING_PERIOD: Duration = Duration::from_secs(3600);

/// Creates a [`TcpEngine`] per connect.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpEngineFactory;

impl EngineFactory for TcpEngineFactory {
    fn create(
        &self,
        options: &ConnectOptions,
        callbacks: EngineCallbacks,
    ) -> Result<Box<dyn ProtocolEngine>> {
        let tls = if options.use_tls() {
            let config = tls::build_tls_config(options)?;
            Some(TlsConnector::from(Arc::new(config)))
        } else {
            None
        };
        Ok(Box::new(TcpEngine::new(options.clone(), tls, callbacks)))
    }
}

/// Wrapper enum for async streams (plain TCP or TLS).
enum AsyncStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Requests sent from the engine handle to its worker.
#[derive(Debug)]
enum Request {
    Connect,
    Subscribe { mid: u16, topic: String, qos: QoS },
    Unsubscribe { mid: u16, topic: String },
    Publish {
        mid: u16,
        topic: String,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    },
    Disconnect,
}

/// Handle to one connection's worker thread.
pub struct TcpEngine {
    options: ConnectOptions,
    tls: Option<TlsConnector>,
    callbacks: EngineCallbacks,
    mids: Arc<Mutex<MidAllocator>>,
    requests: mpsc::UnboundedSender<Request>,
    /// Taken by `start`.
    inbox: Option<mpsc::UnboundedReceiver<Request>>,
    shutdown: Option<oneshot::Sender<()>>,
    done: Option<crossbeam_channel::Receiver<()>>,
    worker: Option<JoinHandle<()>>,
}

impl TcpEngine {
    fn new(options: ConnectOptions, tls: Option<TlsConnector>, callbacks: EngineCallbacks) -> Self {
        let (requests, inbox) = mpsc::unbounded_channel();
        Self {
            options,
            tls,
            callbacks,
            mids: Arc::new(Mutex::new(MidAllocator::new())),
            requests,
            inbox: Some(inbox),
            shutdown: None,
            done: None,
            worker: None,
        }
    }

    fn request(&self, request: Request) -> Result<()> {
        self.requests
            .send(request)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    /// Allocate a mid and queue the request built from it.
    fn request_with_mid(&self, build: impl FnOnce(u16) -> Request) -> Result<u16> {
        let mid = self
            .mids
            .lock()
            .allocate()
            .ok_or_else(|| ClientError::InvalidState("all message ids in flight".to_string()))?;
        if let Err(e) = self.request(build(mid)) {
            self.mids.lock().release(mid);
            return Err(e);
        }
        Ok(mid)
    }
}

impl ProtocolEngine for TcpEngine {
    fn start(&mut self) -> Result<()> {
        let inbox = self
            .inbox
            .take()
            .ok_or_else(|| ClientError::InvalidState("engine already started".to_string()))?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (done_tx, done_rx) = crossbeam_channel::bounded(1);

        let worker = Worker {
            options: self.options.clone(),
            tls: self.tls.clone(),
            callbacks: self.callbacks.clone(),
            mids: self.mids.clone(),
            inbox,
            read_buf: BytesMut::with_capacity(DEFAULT_BUFFER_SIZE),
            write_buf: Vec::with_capacity(DEFAULT_BUFFER_SIZE),
            handed_off: Vec::new(),
            inbound_qos2: HashSet::new(),
            pending_pings: 0,
        };

        static WORKER_SEQ: AtomicU64 = AtomicU64::new(1);
        let name = format!("mqlink-engine-{}", WORKER_SEQ.fetch_add(1, Ordering::Relaxed));
        let callbacks = self.callbacks.clone();
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt.block_on(worker.run(shutdown_rx)),
                    Err(e) => callbacks.connect_failed(code::ENGINE, format!("runtime: {}", e)),
                }
                let _ = done_tx.send(());
            })
            .map_err(|e| ClientError::Engine(format!("failed to spawn worker: {}", e)))?;

        self.shutdown = Some(shutdown_tx);
        self.done = Some(done_rx);
        self.worker = Some(handle);
        Ok(())
    }

    fn connect(&mut self) -> Result<()> {
        self.request(Request::Connect)
    }

    fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<u16> {
        let topic = topic.to_string();
        self.request_with_mid(|mid| Request::Subscribe { mid, topic, qos })
    }

    fn unsubscribe(&mut self, topic: &str) -> Result<u16> {
        let topic = topic.to_string();
        self.request_with_mid(|mid| Request::Unsubscribe { mid, topic })
    }

    fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<u16> {
        let topic = topic.to_string();
        self.request_with_mid(|mid| Request::Publish {
            mid,
            topic,
            payload,
            qos,
            retain,
        })
    }

    fn disconnect(&mut self) -> Result<()> {
        self.request(Request::Disconnect)
    }

    fn stop(&mut self, timeout: Duration) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        let Some(worker) = self.worker.take() else {
            return;
        };
        let finished = match &self.done {
            Some(done) => !matches!(
                done.recv_timeout(timeout),
                Err(crossbeam_channel::RecvTimeoutError::Timeout)
            ),
            None => true,
        };
        if finished {
            if worker.join().is_err() {
                warn!("engine worker for {} panicked", self.options.broker);
            }
        } else {
            warn!(
                "engine worker for {} did not stop within {:?}, abandoning it",
                self.options.broker, timeout
            );
        }
    }
}

impl Drop for TcpEngine {
    fn drop(&mut self) {
        // The worker observes the dropped sender and exits on its own.
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Why the session loop ended.
enum Exit {
    Shutdown,
    Closed,
    Lost { code: i32, message: String },
}

/// Owns the socket for one connection.
struct Worker {
    options: ConnectOptions,
    tls: Option<TlsConnector>,
    callbacks: EngineCallbacks,
    mids: Arc<Mutex<MidAllocator>>,
    inbox: mpsc::UnboundedReceiver<Request>,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
    /// QoS 0 publishes written to `write_buf` but not yet flushed.
    handed_off: Vec<u16>,
    /// Inbound QoS 2 ids between PUBREC and PUBREL.
    inbound_qos2: HashSet<u16>,
    pending_pings: u8,
}

impl Worker {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        // Requests issued before the transport is up wait here.
        let mut backlog = Vec::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                request = self.inbox.recv() => match request {
                    Some(Request::Connect) => break,
                    Some(Request::Disconnect) | None => return,
                    Some(other) => backlog.push(other),
                },
            }
        }

        let established = tokio::select! {
            _ = &mut shutdown => return,
            result = self.establish() => result,
        };
        let (mut stream, connack) = match established {
            Ok(pair) => pair,
            Err(e) => {
                warn!("connect to {}:{} failed: {}", self.options.broker, self.options.port, e);
                self.callbacks.connect_failed(e.code(), e.to_string());
                return;
            }
        };

        self.callbacks
            .connected(connack.return_code, connack.session_present);
        if !connack.accepted() {
            debug!(
                "broker {} rejected connect with code {}",
                self.options.broker, connack.return_code
            );
            return;
        }
        info!(
            "connected to {}:{} as {}",
            self.options.broker, self.options.port, self.options.client_id
        );

        for request in backlog {
            self.handle_request(request);
        }

        match self.session(&mut stream, &mut shutdown).await {
            Exit::Shutdown => debug!("engine worker for {} cancelled", self.options.broker),
            Exit::Closed => self.callbacks.disconnected(code::CLEAN, "Clean disconnect"),
            Exit::Lost { code, message } => {
                warn!("connection to {} lost: {}", self.options.broker, message);
                self.callbacks.disconnected(code, message);
            }
        }
    }

    /// TCP connect, optional TLS handshake, CONNECT, and CONNACK.
    async fn establish(&mut self) -> Result<(AsyncStream, Connack)> {
        let timeout = self.options.connect_timeout;
        let addr = (self.options.broker.as_str(), self.options.port);

        let tcp_stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::ConnectionTimeout)??;
        tcp_stream.set_nodelay(true)?;

        let mut stream = match &self.tls {
            Some(connector) => {
                let server_name = tls::server_name(&self.options.broker)?;
                let tls_stream =
                    tokio::time::timeout(timeout, connector.connect(server_name, tcp_stream))
                        .await
                        .map_err(|_| ClientError::ConnectionTimeout)?
                        .map_err(|e| ClientError::Tls(e.to_string()))?;
                AsyncStream::Tls(Box::new(tls_stream))
            }
            None => AsyncStream::Plain(tcp_stream),
        };

        let connect = Connect {
            client_id: self.options.client_id.clone(),
            clean_session: self.options.clean_session,
            keep_alive: self.options.keep_alive,
            will: self.options.will.as_ref().map(|w| w.to_packet()),
            username: self.options.username.clone(),
            password: self.options.password.clone(),
        };
        encode_packet(&Packet::Connect(connect), &mut self.write_buf)?;
        stream.write_all(&self.write_buf).await?;
        self.write_buf.clear();

        let connack = tokio::time::timeout(timeout, self.read_connack(&mut stream))
            .await
            .map_err(|_| ClientError::ConnectionTimeout)??;
        Ok((stream, connack))
    }

    async fn read_connack(&mut self, stream: &mut AsyncStream) -> Result<Connack> {
        loop {
            if let Some((packet, consumed)) = decode_packet(&self.read_buf)? {
                let _ = self.read_buf.split_to(consumed);
                return match packet {
                    Packet::Connack(connack) => Ok(connack),
                    other => Err(mqlink_core::ProtocolError::UnexpectedPacket(format!(
                        "{:?} before CONNACK",
                        other
                    ))
                    .into()),
                };
            }
            if stream.read_buf(&mut self.read_buf).await? == 0 {
                return Err(ClientError::ConnectionClosed);
            }
        }
    }

    async fn session(
        &mut self,
        stream: &mut AsyncStream,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Exit {
        let keep_alive = match self.options.keep_alive {
            0 => None,
            secs => Some(Duration::from_secs(u64::from(secs))),
        };
        // Fires `keep_alive` after the last packet written to the broker.
        let period = keep_alive.unwrap_or(IDLE_PING_PERIOD);
        let ping = tokio::time::sleep(period);
        tokio::pin!(ping);

        loop {
            if !self.write_buf.is_empty() {
                tokio::select! {
                    _ = &mut *shutdown => return Exit::Shutdown,
                    result = stream.write_all(&self.write_buf) => {
                        if let Err(e) = result {
                            return Exit::Lost { code: code::CONNECTION_LOST, message: e.to_string() };
                        }
                    }
                }
                self.write_buf.clear();
                ping.as_mut().reset(Instant::now() + period);
                for mid in self.handed_off.drain(..) {
                    self.mids.lock().release(mid);
                    self.callbacks.published(mid);
                }
            }

            loop {
                match decode_packet(&self.read_buf) {
                    Ok(Some((packet, consumed))) => {
                        let _ = self.read_buf.split_to(consumed);
                        if let Err(e) = self.handle_packet(packet) {
                            return Exit::Lost {
                                code: e.code(),
                                message: e.to_string(),
                            };
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        return Exit::Lost {
                            code: code::PROTOCOL,
                            message: e.to_string(),
                        }
                    }
                }
            }
            if !self.write_buf.is_empty() {
                continue;
            }

            tokio::select! {
                biased;
                request = self.inbox.recv() => match request {
                    Some(Request::Disconnect) | None => {
                        self.close(stream).await;
                        return Exit::Closed;
                    }
                    Some(request) => self.handle_request(request),
                },
                _ = &mut *shutdown => return Exit::Shutdown,
                read = stream.read_buf(&mut self.read_buf) => match read {
                    Ok(0) => {
                        return Exit::Lost {
                            code: code::CONNECTION_LOST,
                            message: "Connection closed by peer".to_string(),
                        }
                    }
                    Ok(_) => self.pending_pings = 0,
                    Err(e) => {
                        return Exit::Lost { code: code::CONNECTION_LOST, message: e.to_string() }
                    }
                },
                _ = &mut ping, if keep_alive.is_some() => {
                    if self.pending_pings >= 2 {
                        return Exit::Lost {
                            code: code::KEEP_ALIVE_TIMEOUT,
                            message: "Keep-alive timeout".to_string(),
                        };
                    }
                    self.queue(&Packet::Pingreq);
                    self.pending_pings += 1;
                    ping.as_mut().reset(Instant::now() + period);
                }
            }
        }
    }

    /// Send DISCONNECT and close the stream, best effort.
    async fn close(&mut self, stream: &mut AsyncStream) {
        self.write_buf.clear();
        self.queue(&Packet::Disconnect);
        let flush = async {
            stream.write_all(&self.write_buf).await?;
            stream.shutdown().await?;
            Ok::<_, io::Error>(())
        };
        match tokio::time::timeout(DISCONNECT_GRACE, flush).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("DISCONNECT to {} not delivered: {}", self.options.broker, e),
            Err(_) => debug!("DISCONNECT to {} timed out", self.options.broker),
        }
        self.write_buf.clear();
    }

    fn queue(&mut self, packet: &Packet) -> bool {
        match encode_packet(packet, &mut self.write_buf) {
            Ok(()) => true,
            Err(e) => {
                warn!("dropping outbound packet: {}", e);
                false
            }
        }
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Subscribe { mid, topic, qos } => {
                let packet = Packet::Subscribe(Subscribe {
                    packet_id: mid,
                    topics: vec![(topic, qos)],
                });
                if !self.queue(&packet) {
                    self.mids.lock().release(mid);
                }
            }
            Request::Unsubscribe { mid, topic } => {
                let packet = Packet::Unsubscribe(Unsubscribe {
                    packet_id: mid,
                    topics: vec![topic],
                });
                if !self.queue(&packet) {
                    self.mids.lock().release(mid);
                }
            }
            Request::Publish {
                mid,
                topic,
                payload,
                qos,
                retain,
            } => {
                let packet = Packet::Publish(Publish {
                    dup: false,
                    qos,
                    retain,
                    topic,
                    packet_id: (qos != QoS::AtMostOnce).then_some(mid),
                    payload,
                });
                if !self.queue(&packet) {
                    self.mids.lock().release(mid);
                } else if qos == QoS::AtMostOnce {
                    self.handed_off.push(mid);
                }
            }
            Request::Connect => debug!("duplicate connect request ignored"),
            // Handled by the session loop.
            Request::Disconnect => {}
        }
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<()> {
        match packet {
            Packet::Publish(publish) => {
                let fresh = match (publish.qos, publish.packet_id) {
                    (QoS::AtMostOnce, _) => true,
                    (QoS::AtLeastOnce, Some(id)) => {
                        self.queue(&Packet::Puback { packet_id: id });
                        true
                    }
                    (QoS::ExactlyOnce, Some(id)) => {
                        self.queue(&Packet::Pubrec { packet_id: id });
                        self.inbound_qos2.insert(id)
                    }
                    (_, None) => true,
                };
                if fresh {
                    self.callbacks.message(
                        publish.topic,
                        publish.payload,
                        publish.qos,
                        publish.retain,
                    );
                }
            }
            Packet::Pubrel { packet_id } => {
                self.inbound_qos2.remove(&packet_id);
                self.queue(&Packet::Pubcomp { packet_id });
            }
            Packet::Puback { packet_id } | Packet::Pubcomp { packet_id } => {
                self.mids.lock().release(packet_id);
                self.callbacks.published(packet_id);
            }
            Packet::Pubrec { packet_id } => {
                self.queue(&Packet::Pubrel { packet_id });
            }
            Packet::Suback(suback) => {
                self.mids.lock().release(suback.packet_id);
                let granted = suback.return_codes.first().copied().unwrap_or_default();
                self.callbacks.subscribed(suback.packet_id, granted);
            }
            Packet::Unsuback { packet_id } => {
                self.mids.lock().release(packet_id);
                self.callbacks.unsubscribed(packet_id);
            }
            Packet::Pingresp => self.pending_pings = 0,
            other => {
                return Err(mqlink_core::ProtocolError::UnexpectedPacket(format!(
                    "{:?} after handshake",
                    other
                ))
                .into());
            }
        }
        Ok(())
    }
}
