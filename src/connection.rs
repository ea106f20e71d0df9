//! One RPC session over one byte stream.
//!
//! A [`Connection`] owns a stream and runs two tasks on it:
//!
//! ```text
//!            ┌──────────── reader task ────────────┐
//! stream ───►│ FrameBuffer ─► codec ─► dispatch    │──► PendingTable (responses)
//!            └─────────────────────────────────────┘──► Incoming / Event::Message
//!
//! request() / notification() / success() / error()
//!            ──► OutboundQueue ──► writer task ──► stream
//! ```
//!
//! The pending table, outbound queue and inbound channel live in a [`Link`]
//! that may outlive the stream: a [`Client`](crate::Client) keeps one link
//! across reconnects, so in-flight requests and queued frames survive a
//! dropped socket. A connection built by a server or by [`Connection::open`]
//! owns its link and tears it down together with the stream.
//!
//! # Handshake
//!
//! - [`Handshake::Prove`] - the first frame written is `auth([token])`; a
//!   success moves the connection to `Connected`, a `401` destroys it.
//! - [`Handshake::Verify`] - the first frame read must be `auth([token])`;
//!   anything else, or a token the authenticator refuses, is answered with a
//!   `401 Unauthorized` error and the stream is closed.
//! - [`Handshake::None`] - the connection starts `Connected`.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::auth::Authenticator;
use crate::config::ConnectionConfig;
use crate::error::{Result, RpcError};
use crate::message::{ErrorObject, Id, Message};
use crate::outbound::{write_frames, writer_loop, OutboundQueue};
use crate::pending::{PendingRequest, PendingTable};
use crate::protocol::{check_frame_size, FrameBuffer};
use crate::transport::{Endpoint, Stream};

/// Method name of the handshake request.
pub const AUTH_METHOD: &str = "auth";

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// How long a destroyed connection keeps flushing queued frames.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

static NEXT_SID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a [`Connection`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ConnectionState {
    /// Stream attached, tasks not yet running.
    Initializing,
    /// Handshake in progress.
    Authenticating,
    /// Ready; inbound messages are delivered.
    Connected,
    /// Stream gone. Absorbing.
    Closed,
}

/// Observable happenings on a connection, client or server.
#[derive(Debug, Clone)]
pub enum Event {
    /// Transport, decode or handshake failure.
    Error(Arc<RpcError>),
    /// No inbound data within the idle timeout.
    Timeout,
    /// The outbound queue was fully written.
    Drain,
    /// The peer closed its side of the stream.
    End,
    /// The stream is gone.
    Close {
        /// True if the stream ended because of an error.
        had_error: bool,
    },
    /// Handshake succeeded. Carries the session (server) or the reply (client).
    Auth(Value),
    /// Inbound request or notification.
    Message(Message),
    /// Client reached `Connected`.
    Connect,
    /// Client is about to retry.
    Reconnecting {
        /// Wait before the next attempt.
        delay: Duration,
        /// Consecutive failed attempts so far.
        attempts: u32,
    },
    /// Server is accepting on the endpoint.
    Listening(Endpoint),
    /// Non-fatal server-side problem, e.g. a peer failing the handshake.
    Warn(Arc<RpcError>),
}

/// How a new connection authenticates.
#[derive(Clone, Default)]
pub enum Handshake {
    /// No handshake.
    #[default]
    None,
    /// Present this token in an `auth` request.
    Prove(String),
    /// Require an `auth` request and check its token.
    Verify(Arc<dyn Authenticator>),
}

impl std::fmt::Debug for Handshake {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handshake::None => f.write_str("None"),
            Handshake::Prove(_) => f.write_str("Prove(..)"),
            Handshake::Verify(_) => f.write_str("Verify(..)"),
        }
    }
}

type Inbound = Result<Message>;

/// State shared by every stream incarnation of one logical session.
pub(crate) struct Link {
    pub(crate) config: ConnectionConfig,
    pub(crate) pending: Arc<PendingTable>,
    pub(crate) queue: OutboundQueue,
    events: broadcast::Sender<Event>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<Inbound>>>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Inbound>>>,
    attached: AtomicBool,
    /// Keep pending requests and queued frames when the stream drops.
    retain: bool,
    shut: AtomicBool,
    /// Id of the handshake request in flight, if any.
    auth_id: Mutex<Option<String>>,
    request_count: AtomicU64,
    notification_count: AtomicU64,
}

impl Link {
    pub(crate) fn new(config: ConnectionConfig, retain: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            pending: PendingTable::new(config.request_timeout),
            queue: OutboundQueue::new(config.high_water_mark),
            config,
            events,
            inbound_tx: Mutex::new(Some(tx)),
            inbound_rx: Mutex::new(Some(rx)),
            attached: AtomicBool::new(false),
            retain,
            shut: AtomicBool::new(false),
            auth_id: Mutex::new(None),
            request_count: AtomicU64::new(0),
            notification_count: AtomicU64::new(0),
        })
    }

    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub(crate) fn encode(&self, message: &Message) -> Result<Bytes> {
        let payload = self.config.codec.encode(message)?;
        let limit = self.config.max_frame_size.min(self.config.framer.max_payload());
        check_frame_size(payload.len(), limit)?;
        Ok(self.config.framer.encode(&payload))
    }

    pub(crate) fn send(&self, message: &Message) -> Result<()> {
        let frame = self.encode(message)?;
        self.queue.push(frame)
    }

    pub(crate) fn request(&self, method: &str, params: Value) -> Result<PendingRequest> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        if self.is_shutdown() {
            return Err(RpcError::ConnectionClosed);
        }
        let request = self
            .pending
            .create(method, non_null(params), |m| self.encode(m))?;
        if let Err(e) = self.queue.push(request.frame().clone()) {
            self.pending.cancel(request.id());
            return Err(e);
        }
        Ok(request)
    }

    pub(crate) fn notification(&self, method: &str, params: Value) -> Result<()> {
        self.notification_count.fetch_add(1, Ordering::Relaxed);
        self.send(&Message::notification(method, non_null(params)))
    }

    fn publish(&self, message: Message) {
        if let Some(tx) = self.inbound_tx.lock().as_ref() {
            let _ = tx.send(Ok(message.clone()));
        }
        self.emit(Event::Message(message));
    }

    pub(crate) fn incoming(&self) -> Result<Incoming> {
        let rx = self
            .inbound_rx
            .lock()
            .take()
            .ok_or(RpcError::IncomingAttached)?;
        self.attached.store(true, Ordering::Release);
        Ok(Incoming { rx })
    }

    /// Re-enqueue the cached frames of every pending request, ahead of
    /// anything already queued. The handshake request is skipped.
    pub(crate) fn replay_pending(&self) -> Result<usize> {
        let auth_id = self.auth_id.lock().clone();
        let frames: Vec<Bytes> = self
            .pending
            .frames()
            .into_iter()
            .filter(|(id, _)| Some(id) != auth_id.as_ref())
            .map(|(_, frame)| frame)
            .collect();
        let count = frames.len();
        for frame in frames.into_iter().rev() {
            self.queue.push_front(frame)?;
        }
        Ok(count)
    }

    /// Fail pending requests, stop the queue after a final flush, and end
    /// the inbound stream. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.shut.swap(true, Ordering::AcqRel) {
            return;
        }
        // Close the queue first so a racing request either fails to push
        // or is already in the table when it is failed.
        self.queue.close();
        self.pending.fail_all();
        if let Some(tx) = self.inbound_tx.lock().take() {
            if self.attached.load(Ordering::Acquire) {
                let _ = tx.send(Err(RpcError::ConnectionReset));
            }
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shut.load(Ordering::Acquire)
    }

    fn retains(&self) -> bool {
        self.retain
    }
}

fn non_null(params: Value) -> Option<Value> {
    if params.is_null() {
        None
    } else {
        Some(params)
    }
}

/// Pull-based consumer of inbound requests and notifications.
///
/// Yields messages in arrival order. When the connection closes while the
/// consumer is attached it yields one `ConnectionReset` error, then `None`.
#[derive(Debug)]
pub struct Incoming {
    rx: mpsc::UnboundedReceiver<Inbound>,
}

impl Incoming {
    /// Wait for the next inbound message.
    pub async fn next(&mut self) -> Option<Result<Message>> {
        self.rx.recv().await
    }
}

struct ConnectionInner {
    sid: u64,
    link: Arc<Link>,
    state: watch::Sender<ConnectionState>,
    session: OnceLock<Value>,
    /// First error reported on this stream.
    failure: Mutex<Option<Arc<RpcError>>>,
    closed: AtomicBool,
    reader_cancel: CancellationToken,
    writer_cancel: CancellationToken,
    local_addr: Option<String>,
    peer_addr: Option<String>,
}

/// Handle to a live connection. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        self.inner.sid == other.inner.sid
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("sid", &self.inner.sid)
            .field("state", &self.state())
            .field("peer_addr", &self.inner.peer_addr)
            .field("pending", &self.pending_requests())
            .field("queued", &self.queued_frames())
            .finish()
    }
}

impl Connection {
    /// Run a connection over an arbitrary byte stream.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open<S>(stream: S, config: ConnectionConfig, handshake: Handshake) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::attach(stream, Link::new(config, false), handshake, None, None)
    }

    /// Run a connection over a transport stream, recording its addresses.
    pub fn from_stream(stream: Stream, config: ConnectionConfig, handshake: Handshake) -> Connection {
        let local = stream.local_addr();
        let peer = stream.peer_addr();
        Self::attach(stream, Link::new(config, false), handshake, local, peer)
    }

    pub(crate) fn attach<S>(
        stream: S,
        link: Arc<Link>,
        handshake: Handshake,
        local_addr: Option<String>,
        peer_addr: Option<String>,
    ) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (state, _) = watch::channel(ConnectionState::Initializing);
        let conn = Connection {
            inner: Arc::new(ConnectionInner {
                sid: NEXT_SID.fetch_add(1, Ordering::Relaxed),
                link,
                state,
                session: OnceLock::new(),
                failure: Mutex::new(None),
                closed: AtomicBool::new(false),
                reader_cancel: CancellationToken::new(),
                writer_cancel: CancellationToken::new(),
                local_addr,
                peer_addr,
            }),
        };
        debug!(sid = conn.inner.sid, handshake = ?handshake, "attaching stream");

        let mut preface = None;
        let mut verifier = None;
        match handshake {
            Handshake::None => {
                conn.set_state(ConnectionState::Connected);
            }
            Handshake::Prove(token) => {
                conn.set_state(ConnectionState::Authenticating);
                match conn.start_auth(token) {
                    Ok(frame) => preface = Some(frame),
                    Err(e) => {
                        conn.report(e);
                        conn.destroy();
                    }
                }
            }
            Handshake::Verify(authenticator) => {
                conn.set_state(ConnectionState::Authenticating);
                verifier = Some(authenticator);
            }
        }

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(conn.clone().read_loop(reader, verifier));
        tokio::spawn(conn.clone().write_loop(writer, preface));
        conn
    }

    /// Send the auth request; its reply decides the handshake.
    fn start_auth(&self, token: String) -> Result<Bytes> {
        let link = &self.inner.link;
        let request = link
            .pending
            .create(AUTH_METHOD, Some(json!([token])), |m| link.encode(m))?;
        *link.auth_id.lock() = Some(request.id().to_string());
        let frame = request.frame().clone();

        let conn = self.clone();
        tokio::spawn(async move {
            let result = request.await;
            conn.inner.link.auth_id.lock().take();
            match result {
                Ok(_) if conn.is_closed() => {}
                Err(e) if e.is_reset() && conn.is_closed() => {}
                Ok(reply) => {
                    if conn.set_state(ConnectionState::Connected) {
                        debug!(sid = conn.inner.sid, "authenticated");
                        conn.inner.link.emit(Event::Auth(reply));
                    }
                }
                Err(e) => {
                    let unauthorized = e.is_unauthorized();
                    warn!(sid = conn.inner.sid, error = %e, "handshake failed");
                    conn.report(e);
                    if unauthorized {
                        conn.destroy();
                    } else {
                        conn.drop_stream(true);
                    }
                }
            }
        });
        Ok(frame)
    }

    async fn read_loop<R>(self, mut reader: R, mut verifier: Option<Arc<dyn Authenticator>>)
    where
        R: AsyncRead + Unpin,
    {
        let link = self.inner.link.clone();
        let cancel = self.inner.reader_cancel.clone();
        let idle = link.config.idle_timeout;
        let mut frames =
            FrameBuffer::with_framer(link.config.framer.clone(), link.config.max_frame_size);
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let had_error = loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                read = read_some(&mut reader, &mut buf, idle) => read,
            };
            let n = match read {
                None => {
                    link.emit(Event::Timeout);
                    continue;
                }
                Some(Ok(0)) => {
                    debug!(sid = self.inner.sid, "stream ended");
                    link.emit(Event::End);
                    break false;
                }
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    debug!(sid = self.inner.sid, error = %e, "read failed");
                    self.report(RpcError::Io(e));
                    break true;
                }
            };

            let payloads = match frames.push(&buf[..n]) {
                Ok(payloads) => payloads,
                Err(e) => {
                    warn!(sid = self.inner.sid, error = %e, "bad frame");
                    self.report(e);
                    break true;
                }
            };

            for payload in payloads {
                if let Some(authenticator) = verifier.take() {
                    if !self.verify_handshake(&payload, authenticator.as_ref()) {
                        return;
                    }
                    continue;
                }
                self.dispatch(payload);
            }
        };

        self.drop_stream(had_error);
    }

    async fn write_loop<W>(self, mut writer: W, preface: Option<Bytes>)
    where
        W: AsyncWrite + Unpin,
    {
        let link = self.inner.link.clone();
        let cancel = self.inner.writer_cancel.clone();
        let destroyed = self.inner.reader_cancel.clone();

        let run = async {
            if let Some(frame) = preface {
                write_frames(&mut writer, &[frame]).await?;
            }
            writer_loop(&link.queue, &mut writer, cancel, || link.emit(Event::Drain)).await
        };
        let grace = async {
            destroyed.cancelled().await;
            tokio::time::sleep(CLOSE_FLUSH_TIMEOUT).await;
        };

        let result = tokio::select! {
            res = run => res,
            _ = grace => {
                debug!(sid = self.inner.sid, "flush on close timed out");
                return;
            }
        };

        if let Err(e) = result {
            if !self.is_closed() {
                debug!(sid = self.inner.sid, error = %e, "write failed");
                self.report(e);
                self.drop_stream(true);
            }
        }
    }

    fn dispatch(&self, payload: Bytes) {
        let link = &self.inner.link;
        let message = match link.config.codec.decode(&payload) {
            Ok(message) => message,
            Err(e) => {
                debug!(sid = self.inner.sid, error = %e, "undecodable message");
                self.report(e);
                return;
            }
        };

        let message = match message {
            Message::Success {
                id: Id::Str(id),
                result,
            } if link.pending.contains(&id) => {
                link.pending.complete(&id, Ok(result));
                return;
            }
            Message::Error {
                id: Id::Str(id),
                error,
            } if link.pending.contains(&id) => {
                if link.auth_id.lock().as_deref() == Some(id.as_str()) {
                    // Seen by authenticated() even if the stream ends first.
                    self.record(Arc::new(RpcError::Remote(error.clone())));
                }
                link.pending.complete(&id, Err(RpcError::Remote(error)));
                return;
            }
            other => other,
        };

        if message.is_response() {
            debug!(sid = self.inner.sid, id = ?message.id(), "unmatched response");
        }
        link.publish(message);
    }

    /// Check the first inbound frame. Returns false if the connection was
    /// rejected.
    fn verify_handshake(&self, payload: &[u8], authenticator: &dyn Authenticator) -> bool {
        let link = &self.inner.link;
        let (id, token) = match parse_auth_request(link.config.codec.decode(payload)) {
            Ok(request) => request,
            Err((id, detail)) => {
                let data = format!("Invalid data: {}", detail);
                self.reject(id, data.clone(), RpcError::ProtocolViolation(data));
                return false;
            }
        };

        match authenticator.authenticate(&token) {
            Ok(session) => {
                let _ = self.inner.session.set(session.clone());
                if let Err(e) = link.send(&Message::success(id, json!("OK"))) {
                    self.report(e);
                }
                self.set_state(ConnectionState::Connected);
                debug!(sid = self.inner.sid, "peer authenticated");
                link.emit(Event::Auth(session));
                true
            }
            Err(e) => {
                self.reject(id, e.to_string(), RpcError::Auth(e));
                false
            }
        }
    }

    fn reject(&self, id: Id, data: String, err: RpcError) {
        warn!(sid = self.inner.sid, reason = %data, "rejecting handshake");
        let _ = self
            .inner
            .link
            .send(&Message::error(id, ErrorObject::unauthorized(data)));
        self.report(err);
        self.destroy();
    }

    /// Record and broadcast an error.
    fn report(&self, err: RpcError) {
        let err = Arc::new(err);
        self.record(err.clone());
        self.inner.link.emit(Event::Error(err));
    }

    /// Keep the first failure only.
    fn record(&self, err: Arc<RpcError>) {
        let mut failure = self.inner.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    fn set_state(&self, next: ConnectionState) -> bool {
        self.inner.state.send_if_modified(|state| {
            if *state < next {
                *state = next;
                true
            } else {
                false
            }
        })
    }

    /// The stream went away (or failed). A retaining link keeps its
    /// pending requests and queued frames for the next stream.
    fn drop_stream(&self, had_error: bool) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.writer_cancel.cancel();
        self.inner.reader_cancel.cancel();

        let link = &self.inner.link;
        if let Some(id) = link.auth_id.lock().take() {
            link.pending.cancel(&id);
        }
        if !link.retains() {
            link.shutdown();
        }
        self.finish_close(had_error);
    }

    /// Close the connection for good. Idempotent.
    ///
    /// Queued frames get one last flush, pending requests fail with
    /// `ConnectionReset`, and an attached [`Incoming`] yields the same error
    /// before ending.
    pub fn destroy(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.reader_cancel.cancel();
        self.inner.link.shutdown();
        self.finish_close(false);
    }

    fn finish_close(&self, had_error: bool) {
        self.set_state(ConnectionState::Closed);
        debug!(sid = self.inner.sid, had_error, "connection closed");
        self.inner.link.emit(Event::Close { had_error });
    }

    /// Issue a request and wait for its result.
    ///
    /// `Value::Null` params are omitted from the message.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.start_request(method, params)?.await
    }

    /// Issue a request, returning a handle to await later.
    pub fn start_request(&self, method: &str, params: Value) -> Result<PendingRequest> {
        if self.is_closed() {
            self.inner
                .link
                .request_count
                .fetch_add(1, Ordering::Relaxed);
            return Err(RpcError::ConnectionClosed);
        }
        self.inner.link.request(method, params)
    }

    /// Send a notification.
    pub fn notification(&self, method: &str, params: Value) -> Result<()> {
        self.inner.link.notification(method, params)
    }

    /// Answer a request successfully.
    pub fn success(&self, id: impl Into<Id>, result: Value) -> Result<()> {
        self.inner.link.send(&Message::success(id, result))
    }

    /// Answer a request with an error.
    pub fn error(&self, id: impl Into<Id>, error: impl Into<ErrorObject>) -> Result<()> {
        self.inner.link.send(&Message::error(id, error.into()))
    }

    /// Run `handler` for one inbound message and answer it.
    ///
    /// For a request the handler's value is sent with `success` (and
    /// returned), its error with `error`. A notification gets no answer, so
    /// a handler error is returned to the caller instead.
    pub async fn handle_request<F, Fut, E>(&self, message: Message, handler: F) -> Result<Value>
    where
        F: FnOnce(Message) -> Fut,
        Fut: Future<Output = std::result::Result<Value, E>>,
        E: Into<ErrorObject>,
    {
        match &message {
            Message::Request { id, .. } => {
                let id = id.clone();
                match handler(message).await {
                    Ok(result) => {
                        self.success(id, result.clone())?;
                        Ok(result)
                    }
                    Err(e) => {
                        let error = e.into();
                        self.error(id, error.clone())?;
                        Err(RpcError::Remote(error))
                    }
                }
            }
            Message::Notification { .. } => handler(message)
                .await
                .map_err(|e| RpcError::Remote(e.into())),
            _ => Err(RpcError::Remote(ErrorObject::invalid_request(Some(
                message.to_value(),
            )))),
        }
    }

    /// Attach the pull consumer. Only one may ever be attached.
    pub fn incoming(&self) -> Result<Incoming> {
        self.inner.link.incoming()
    }

    /// Subscribe to this connection's events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.link.subscribe()
    }

    /// Wait until the connection is `Connected`.
    ///
    /// Fails with the error that closed the connection before it got there.
    pub async fn authenticated(&self) -> std::result::Result<(), Arc<RpcError>> {
        let mut rx = self.inner.state.subscribe();
        let reached = rx
            .wait_for(|s| *s >= ConnectionState::Connected)
            .await
            .map(|s| *s);
        match reached {
            Ok(ConnectionState::Connected) => Ok(()),
            _ => Err(self
                .inner
                .failure
                .lock()
                .clone()
                .unwrap_or_else(|| Arc::new(RpcError::ConnectionClosed))),
        }
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Wait until every queued frame has been written.
    pub async fn drained(&self) {
        self.inner.link.queue.drained().await;
    }

    /// Sequence number, unique within the process.
    pub fn id(&self) -> u64 {
        self.inner.sid
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// True once closed.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Session value from a successful handshake (server side).
    pub fn session(&self) -> Option<&Value> {
        self.inner.session.get()
    }

    /// Frames waiting to be written.
    pub fn queued_frames(&self) -> usize {
        self.inner.link.queue.len()
    }

    /// True while the outbound queue holds more than one write's worth.
    pub fn is_saturated(&self) -> bool {
        self.inner.link.queue.is_saturated()
    }

    /// Requests awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.inner.link.pending.len()
    }

    /// Requests issued through this connection's link.
    pub fn request_count(&self) -> u64 {
        self.inner.link.request_count.load(Ordering::Relaxed)
    }

    /// Notifications sent through this connection's link.
    pub fn notification_count(&self) -> u64 {
        self.inner.link.notification_count.load(Ordering::Relaxed)
    }

    /// Local socket address, when the transport has one.
    pub fn local_addr(&self) -> Option<&str> {
        self.inner.local_addr.as_deref()
    }

    /// Remote socket address, when the transport has one.
    pub fn peer_addr(&self) -> Option<&str> {
        self.inner.peer_addr.as_deref()
    }
}

async fn read_some<R>(reader: &mut R, buf: &mut [u8], idle: Option<Duration>) -> Option<io::Result<usize>>
where
    R: AsyncRead + Unpin,
{
    match idle {
        Some(idle) => tokio::time::timeout(idle, reader.read(buf)).await.ok(),
        None => Some(reader.read(buf).await),
    }
}

/// Extract `(id, token)` from a handshake frame, or `(id, reason)` on failure.
fn parse_auth_request(decoded: Result<Message>) -> std::result::Result<(Id, String), (Id, String)> {
    match decoded {
        Err(e) => Err((Id::Null, e.to_string())),
        Ok(Message::Request { id, method, params }) if method == AUTH_METHOD => match params {
            Some(Value::Array(mut items)) if items.len() == 1 => match items.pop() {
                Some(Value::String(token)) => Ok((id, token)),
                other => Err((
                    id,
                    format!("auth token must be a string, got {}", other.unwrap_or(Value::Null)),
                )),
            },
            other => Err((
                id,
                format!("auth params must be [token], got {}", other.unwrap_or(Value::Null)),
            )),
        },
        Ok(other) => Err((other.id().cloned().unwrap_or(Id::Null), other.to_value().to_string())),
    }
}
