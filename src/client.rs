//! Reconnecting client.
//!
//! The [`ClientBuilder`] collects settings and [`ClientBuilder::connect`]
//! starts a supervisor task that owns the connection lifecycle:
//!
//! 1. Open a stream to the endpoint
//! 2. Attach a [`Connection`] (sending the `auth` frame if a signer is set)
//! 3. Wait for the handshake, then for the stream to close
//! 4. Back off and go to 1, until `max_attempts` consecutive failures
//!
//! Requests, queued frames and the inbound consumer live on a link shared by
//! every connection the client makes, so calls made while disconnected are
//! written once a new stream is up, and a request issued before a drop can
//! still be answered after the reconnect.
//!
//! # Example
//!
//! ```no_run
//! use rpcwire::{Client, Endpoint};
//! use serde_json::json;
//!
//! # async fn run() -> rpcwire::Result<()> {
//! let client = Client::builder()
//!     .max_attempts(10)
//!     .connect(Endpoint::tcp("127.0.0.1:7000"));
//!
//! let sum = client.request("add", json!([1, 2])).await?;
//! client.notification("log", json!(["done", sum]))?;
//! client.close();
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::{AuthError, Signer};
use crate::codec::SharedCodec;
use crate::config::{ConnectionConfig, RetryPolicy, StreamOptions};
use crate::connection::{Connection, Event, Handshake, Incoming, Link};
use crate::error::{Result, RpcError};
use crate::message::{ErrorObject, Id, Message};
use crate::pending::PendingRequest;
use crate::protocol::SharedFramer;
use crate::transport::{self, Endpoint};

/// Client lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    /// Between connection attempts.
    Disconnected,
    /// Opening a stream or running the handshake.
    Connecting,
    /// Handshake done; frames flow.
    Connected,
    /// Closed by the caller, by a 401, or after too many failed attempts.
    Closed,
}

/// Builder for a [`Client`].
pub struct ClientBuilder {
    config: ConnectionConfig,
    options: StreamOptions,
    retry: RetryPolicy,
    signer: Option<Arc<dyn Signer>>,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self {
            config: ConnectionConfig::default(),
            options: StreamOptions::default(),
            retry: RetryPolicy::default(),
            signer: None,
        }
    }

    /// Replace the whole connection configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Initial reconnect delay.
    ///
    /// Default: 500 ms
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry.retry_delay = delay;
        self
    }

    /// Upper bound for the reconnect delay.
    ///
    /// Default: 10 seconds
    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.retry.max_retry_delay = delay;
        self
    }

    /// Consecutive failed attempts before the client closes for good.
    ///
    /// Default: 50
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_attempts = attempts;
        self
    }

    /// Deadline for each request.
    ///
    /// Default: 2 minutes
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Emit [`Event::Timeout`] after this long without inbound data.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Coalescing limit for one write.
    ///
    /// Default: 16 KiB
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.config.high_water_mark = bytes;
        self
    }

    /// Set `TCP_NODELAY` on new streams.
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.options.no_delay = enabled;
        self
    }

    /// Enable TCP keepalive on new streams.
    pub fn keep_alive(mut self, enabled: bool) -> Self {
        self.options.keep_alive = enabled;
        self
    }

    /// Authenticate every new stream with a token from `signer`.
    pub fn signer(mut self, signer: impl Signer) -> Self {
        self.signer = Some(Arc::new(signer));
        self
    }

    /// Message encoding.
    pub fn codec(mut self, codec: SharedCodec) -> Self {
        self.config.codec = codec;
        self
    }

    /// Wire framing.
    pub fn framer(mut self, framer: SharedFramer) -> Self {
        self.config.framer = framer;
        self
    }

    /// Start the client. Must be called from within a tokio runtime.
    ///
    /// Returns immediately; the first stream is opened in the background.
    /// Use [`Client::connected`] to wait for it.
    pub fn connect(self, endpoint: Endpoint) -> Client {
        let (state, _) = watch::channel(ClientState::Disconnected);
        let inner = Arc::new(ClientInner {
            endpoint,
            link: Link::new(self.config, true),
            state,
            current: Mutex::new(None),
            closing: CancellationToken::new(),
            attempts: AtomicU32::new(0),
        });
        tokio::spawn(
            inner
                .clone()
                .supervise(self.options, self.retry, self.signer),
        );
        Client { inner }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInner {
    endpoint: Endpoint,
    link: Arc<Link>,
    state: watch::Sender<ClientState>,
    current: Mutex<Option<Connection>>,
    closing: CancellationToken,
    attempts: AtomicU32,
}

impl ClientInner {
    fn set_state(&self, next: ClientState) {
        self.state.send_if_modified(|state| {
            if *state == ClientState::Closed || *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
    }

    fn handshake(&self, signer: Option<&Arc<dyn Signer>>) -> std::result::Result<Handshake, AuthError> {
        match signer {
            Some(signer) => Ok(Handshake::Prove(signer.signature()?)),
            None => Ok(Handshake::None),
        }
    }

    async fn supervise(
        self: Arc<Self>,
        options: StreamOptions,
        retry: RetryPolicy,
        signer: Option<Arc<dyn Signer>>,
    ) {
        let closing = self.closing.clone();
        let mut attempts: u32 = 0;

        loop {
            self.set_state(ClientState::Connecting);
            let opened = tokio::select! {
                biased;
                _ = closing.cancelled() => break,
                res = transport::connect(&self.endpoint, options) => res,
            };

            match opened {
                Ok(stream) => {
                    let handshake = match self.handshake(signer.as_ref()) {
                        Ok(handshake) => handshake,
                        Err(e) => {
                            warn!(error = %e, "cannot produce auth token");
                            self.link.emit(Event::Error(Arc::new(RpcError::Auth(e))));
                            break;
                        }
                    };
                    let local = stream.local_addr();
                    let peer = stream.peer_addr();
                    let conn = Connection::attach(stream, self.link.clone(), handshake, local, peer);
                    *self.current.lock() = Some(conn.clone());

                    let auth = tokio::select! {
                        biased;
                        _ = closing.cancelled() => break,
                        res = conn.authenticated() => res,
                    };
                    match auth {
                        Ok(()) => {
                            attempts = 0;
                            self.attempts.store(0, Ordering::Relaxed);
                            self.set_state(ClientState::Connected);
                            info!(endpoint = %self.endpoint, sid = conn.id(), "connected");
                            self.link.emit(Event::Connect);

                            tokio::select! {
                                biased;
                                _ = closing.cancelled() => break,
                                _ = conn.closed() => {}
                            }
                        }
                        Err(e) if e.is_unauthorized() => {
                            warn!(endpoint = %self.endpoint, error = %e, "rejected by server");
                            break;
                        }
                        Err(e) => {
                            debug!(endpoint = %self.endpoint, error = %e, "handshake failed");
                        }
                    }
                    self.current.lock().take();
                }
                Err(e) => {
                    debug!(endpoint = %self.endpoint, error = %e, "connect failed");
                    self.link.emit(Event::Error(Arc::new(e)));
                }
            }

            if closing.is_cancelled() || self.link.is_shutdown() {
                break;
            }
            self.set_state(ClientState::Disconnected);

            attempts += 1;
            self.attempts.store(attempts, Ordering::Relaxed);
            if attempts > retry.max_attempts {
                warn!(endpoint = %self.endpoint, attempts, "giving up");
                break;
            }

            let delay = retry.delay_for(attempts);
            debug!(
                endpoint = %self.endpoint,
                attempts,
                delay_ms = delay.as_millis() as u64,
                "reconnecting"
            );
            self.link.emit(Event::Reconnecting { delay, attempts });

            tokio::select! {
                biased;
                _ = closing.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.terminate();
    }

    fn terminate(&self) {
        let current = self.current.lock().take();
        match current {
            Some(conn) if !conn.is_closed() => conn.destroy(),
            Some(_) => self.link.shutdown(),
            None => {
                self.link.shutdown();
                self.link.emit(Event::Close { had_error: false });
            }
        }
        self.set_state(ClientState::Closed);
        debug!(endpoint = %self.endpoint, "client closed");
    }
}

/// A client connection that re-establishes itself after drops.
///
/// Dropping the client closes it.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .field("attempts", &self.attempts())
            .finish()
    }
}

impl Client {
    /// Create a new client builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Issue a request and wait for its result.
    ///
    /// While disconnected the request is queued and written on the next
    /// stream. Fails with `ConnectionClosed` once the client is closed.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.start_request(method, params)?.await
    }

    /// Issue a request, returning a handle to await later.
    pub fn start_request(&self, method: &str, params: Value) -> Result<PendingRequest> {
        self.inner.link.request(method, params)
    }

    /// Send a notification.
    pub fn notification(&self, method: &str, params: Value) -> Result<()> {
        self.inner.link.notification(method, params)
    }

    /// Answer an inbound request successfully.
    pub fn success(&self, id: impl Into<Id>, result: Value) -> Result<()> {
        self.inner.link.send(&Message::success(id, result))
    }

    /// Answer an inbound request with an error.
    pub fn error(&self, id: impl Into<Id>, error: impl Into<ErrorObject>) -> Result<()> {
        self.inner.link.send(&Message::error(id, error.into()))
    }

    /// Attach the pull consumer. It spans reconnects and ends when the
    /// client closes.
    pub fn incoming(&self) -> Result<Incoming> {
        self.inner.link.incoming()
    }

    /// Subscribe to events from every connection this client makes.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.link.subscribe()
    }

    /// Re-send every still-pending request on the current stream.
    ///
    /// Requests are not replayed automatically after a reconnect; call this
    /// from an [`Event::Connect`] handler to opt in. A peer may see a request
    /// twice if its earlier copy did arrive.
    pub fn replay_pending(&self) -> Result<usize> {
        let count = self.inner.link.replay_pending()?;
        debug!(count, "replaying pending requests");
        Ok(count)
    }

    /// Stop reconnecting and close the current stream.
    ///
    /// Pending requests fail with `ConnectionReset`. Idempotent.
    pub fn close(&self) {
        self.inner.closing.cancel();
    }

    /// Wait until the client is closed.
    pub async fn closed(&self) {
        let mut rx = self.inner.state.subscribe();
        let _ = rx.wait_for(|s| *s == ClientState::Closed).await;
    }

    /// Wait until the client is connected. Fails if it closes first.
    pub async fn connected(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| matches!(s, ClientState::Connected | ClientState::Closed))
            .await
            .map(|s| *s);
        match state {
            Ok(ClientState::Connected) => Ok(()),
            _ => Err(RpcError::ConnectionClosed),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Consecutive failed attempts since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Relaxed)
    }

    /// The current connection, if a stream is attached.
    ///
    /// It shares this client's pending requests and queue, so destroying it
    /// closes the client as well.
    pub fn connection(&self) -> Option<Connection> {
        self.inner.current.lock().clone()
    }

    /// Endpoint this client connects to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.endpoint
    }

    /// Requests awaiting a response, across reconnects.
    pub fn pending_requests(&self) -> usize {
        self.inner.link.pending.len()
    }

    /// Frames waiting for a stream.
    pub fn queued_frames(&self) -> usize {
        self.inner.link.queue.len()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.closing.cancel();
    }
}
