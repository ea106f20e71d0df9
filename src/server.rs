//! Listening side.
//!
//! A [`Server`] accepts streams, wraps each in a [`Connection`] and, once the
//! connection is authenticated (or immediately when no authenticator is
//! configured), hands it to the application's [`ConnectionHandler`]. Live
//! connections are kept in a [`RingPool`] and evicted when they close.
//!
//! # Example
//!
//! ```no_run
//! use rpcwire::{Connection, Endpoint, Server};
//!
//! # async fn run() -> rpcwire::Result<()> {
//! let server = Server::builder()
//!     .bind(&Endpoint::tcp("127.0.0.1:7000"), |conn: Connection| async move {
//!         let Ok(mut inbound) = conn.incoming() else { return };
//!         while let Some(Ok(msg)) = inbound.next().await {
//!             let _ = conn
//!                 .handle_request(msg, |m| async move {
//!                     Ok::<_, rpcwire::ErrorObject>(m.params().cloned().unwrap_or_default())
//!                 })
//!                 .await;
//!         }
//!     })
//!     .await?;
//! # server.close().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authenticator;
use crate::codec::SharedCodec;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, Event, Handshake, Link};
use crate::error::{Result, RpcError};
use crate::pool::RingPool;
use crate::protocol::SharedFramer;
use crate::transport::{Endpoint, Listener};

/// Boxed future returned by connection handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Application callback run once per accepted, authenticated connection.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Serve `conn`. The connection stays in the pool until it closes,
    /// independent of when this future finishes.
    fn call(&self, conn: Connection) -> BoxFuture<'static, ()>;
}

impl<F, Fut> ConnectionHandler for F
where
    F: Fn(Connection) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, conn: Connection) -> BoxFuture<'static, ()> {
        Box::pin(self(conn))
    }
}

/// Builder for a [`Server`].
#[derive(Default)]
pub struct ServerBuilder {
    config: ConnectionConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
}

impl ServerBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole per-connection configuration.
    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// Require every client to pass an `auth` handshake checked by
    /// `authenticator`.
    pub fn authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Some(Arc::new(authenticator));
        self
    }

    /// Deadline for requests the server issues.
    pub fn request_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Emit [`Event::Timeout`] after this long without inbound data.
    pub fn idle_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.idle_timeout = Some(timeout);
        self
    }

    /// Coalescing limit for one write.
    pub fn high_water_mark(mut self, bytes: usize) -> Self {
        self.config.high_water_mark = bytes;
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

    /// Build a server that is not listening yet.
    pub fn build(self, handler: impl ConnectionHandler) -> Server {
        let (events, _) = broadcast::channel(self.config.event_capacity.max(1));
        Server {
            inner: Arc::new(ServerInner {
                config: self.config,
                authenticator: self.authenticator,
                handler: Arc::new(handler),
                pool: Mutex::new(RingPool::new()),
                events,
                shutdown: CancellationToken::new(),
                accept_task: Mutex::new(None),
                endpoint: Mutex::new(None),
            }),
        }
    }

    /// Build a server and start listening on `endpoint`.
    pub async fn bind(self, endpoint: &Endpoint, handler: impl ConnectionHandler) -> Result<Server> {
        let server = self.build(handler);
        server.listen(endpoint).await?;
        Ok(server)
    }
}

struct ServerInner {
    config: ConnectionConfig,
    authenticator: Option<Arc<dyn Authenticator>>,
    handler: Arc<dyn ConnectionHandler>,
    pool: Mutex<RingPool<Connection>>,
    events: broadcast::Sender<Event>,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    endpoint: Mutex<Option<Endpoint>>,
}

impl ServerInner {
    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                res = listener.accept() => res,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = ?peer, "accepted");
                    self.clone().admit(stream, peer);
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                    self.emit(Event::Error(Arc::new(e)));
                }
            }
        }
        debug!("accept loop stopped");
    }

    fn admit(self: Arc<Self>, stream: crate::transport::Stream, peer: Option<String>) {
        let handshake = match &self.authenticator {
            Some(authenticator) => Handshake::Verify(authenticator.clone()),
            None => Handshake::None,
        };
        let local = stream.local_addr();
        let link = Link::new(self.config.clone(), false);
        let conn = Connection::attach(stream, link, handshake, local, peer);
        {
            // `close` drains the pool under this lock after cancelling.
            let mut pool = self.pool.lock();
            if self.shutdown.is_cancelled() {
                drop(pool);
                debug!(sid = conn.id(), peer = ?conn.peer_addr(), "server closed, dropping stream");
                conn.destroy();
                return;
            }
            pool.add(conn.clone());
        }

        tokio::spawn(async move {
            if let Err(e) = conn.authenticated().await {
                conn.destroy();
                if !matches!(*e, RpcError::ConnectionClosed) {
                    warn!(sid = conn.id(), peer = ?conn.peer_addr(), error = %e, "rejected connection");
                    self.emit(Event::Warn(e));
                }
            } else {
                tokio::spawn(self.handler.call(conn.clone()));
            }

            conn.closed().await;
            let left = self.pool.lock().remove(&conn);
            debug!(sid = conn.id(), connections = left, "connection evicted");
        });
    }
}

/// A listening RPC server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoint", &*self.inner.endpoint.lock())
            .field("connections", &self.connection_count())
            .field("auth", &self.inner.authenticator.is_some())
            .finish()
    }
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind `endpoint` and start accepting. Returns the bound endpoint
    /// (with the actual port when binding port 0).
    pub async fn listen(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        if self.inner.shutdown.is_cancelled() {
            return Err(RpcError::ConnectionClosed);
        }
        let listener = Listener::bind(endpoint).await?;
        let bound = listener.local_endpoint()?;
        *self.inner.endpoint.lock() = Some(bound.clone());

        info!(endpoint = %bound, "listening");
        self.inner.emit(Event::Listening(bound.clone()));

        let task = tokio::spawn(self.inner.clone().accept_loop(listener));
        if let Some(previous) = self.inner.accept_task.lock().replace(task) {
            previous.abort();
        }
        Ok(bound)
    }

    /// Stop accepting and destroy every live connection.
    pub async fn close(&self) {
        self.inner.shutdown.cancel();
        let task = self.inner.accept_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let connections = {
            let mut pool = self.inner.pool.lock();
            let connections = pool.drain();
            pool.reset();
            connections
        };
        for conn in &connections {
            conn.destroy();
        }
        debug!(destroyed = connections.len(), "server closed");
        self.inner.emit(Event::Close { had_error: false });
    }

    /// Live connections, in accept order.
    pub fn connections(&self) -> Vec<Connection> {
        self.inner.pool.lock().iter().cloned().collect()
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.pool.lock().len()
    }

    /// Next live connection in round-robin order.
    pub fn next_connection(&self) -> Option<Connection> {
        self.inner.pool.lock().next().cloned()
    }

    /// The endpoint bound by [`listen`](Self::listen).
    pub fn local_endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.lock().clone()
    }

    /// Subscribe to server events (`Listening`, `Warn`, `Error`, `Close`).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use crate::config::StreamOptions;
    use crate::transport::connect;
    use std::time::Duration;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn wait_for_count(server: &Server, expected: usize) {
        for _ in 0..200 {
            if server.connection_count() == expected {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        panic!("expected {} connections, have {}", expected, server.connection_count());
    }

    #[tokio::test]
    async fn test_pool_tracks_connections() {
        let server = Server::builder()
            .bind(&Endpoint::tcp("127.0.0.1:0"), |_conn: Connection| async {})
            .await
            .unwrap();
        let endpoint = server.local_endpoint().unwrap();

        let a = connect(&endpoint, StreamOptions::default()).await.unwrap();
        let b = connect(&endpoint, StreamOptions::default()).await.unwrap();
        let a = Connection::from_stream(a, ConnectionConfig::default(), Handshake::None);
        let _b = Connection::from_stream(b, ConnectionConfig::default(), Handshake::None);
        wait_for_count(&server, 2).await;

        let first = server.next_connection().unwrap();
        let second = server.next_connection().unwrap();
        assert_ne!(first, second);
        assert_eq!(server.next_connection().unwrap(), first);

        a.destroy();
        wait_for_count(&server, 1).await;

        server.close().await;
        assert_eq!(server.connection_count(), 0);
        assert!(server.listen(&endpoint).await.is_err());
    }

    #[tokio::test]
    async fn test_handler_runs_after_auth() {
        let auth = Auth::new("s3cret").unwrap();
        let token = auth.sign(&json!({"user": "ada"})).unwrap();

        let server = Server::builder()
            .authenticator(auth)
            .bind(&Endpoint::tcp("127.0.0.1:0"), |conn: Connection| async move {
                let user = conn.session().cloned().unwrap_or(Value::Null);
                let _ = conn.notification("welcome", user["user"].clone());
            })
            .await
            .unwrap();
        let endpoint = server.local_endpoint().unwrap();

        let stream = connect(&endpoint, StreamOptions::default()).await.unwrap();
        let client = Connection::from_stream(stream, ConnectionConfig::default(), Handshake::Prove(token));
        let mut inbound = client.incoming().unwrap();

        client.authenticated().await.unwrap();
        let welcome = inbound.next().await.unwrap().unwrap();
        assert_eq!(welcome.method(), Some("welcome"));
        assert_eq!(welcome.params(), Some(&json!("ada")));

        server.close().await;
    }

    #[tokio::test]
    async fn test_rejected_peer_emits_warn() {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        let server = Server::builder()
            .authenticator(Auth::new("s3cret").unwrap())
            .bind(&Endpoint::tcp("127.0.0.1:0"), move |_conn: Connection| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            })
            .await
            .unwrap();
        let mut events = server.subscribe();
        let endpoint = server.local_endpoint().unwrap();

        let stream = connect(&endpoint, StreamOptions::default()).await.unwrap();
        let client = Connection::from_stream(
            stream,
            ConnectionConfig::default(),
            Handshake::Prove("bogus".to_string()),
        );
        assert!(client.authenticated().await.unwrap_err().is_unauthorized());

        loop {
            if let Event::Warn(e) = events.recv().await.unwrap() {
                assert!(matches!(*e, RpcError::Auth(_)));
                break;
            }
        }
        wait_for_count(&server, 0).await;
        assert_eq!(served.load(Ordering::SeqCst), 0);
        server.close().await;
    }

    #[tokio::test]
    async fn test_stream_admitted_after_close_is_dropped() {
        let served = Arc::new(AtomicUsize::new(0));
        let counter = served.clone();
        let server = Server::builder()
            .bind(&Endpoint::tcp("127.0.0.1:0"), move |_conn: Connection| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {}
            })
            .await
            .unwrap();
        server.close().await;

        let listener = Listener::bind(&Endpoint::tcp("127.0.0.1:0")).await.unwrap();
        let endpoint = listener.local_endpoint().unwrap();
        let (dialed, accepted) = tokio::join!(
            connect(&endpoint, StreamOptions::default()),
            listener.accept()
        );
        let client = Connection::from_stream(dialed.unwrap(), ConnectionConfig::default(), Handshake::None);
        let (stream, peer) = accepted.unwrap();

        // Same path the accept loop takes for a stream accepted during close.
        server.inner.clone().admit(stream, peer);
        assert_eq!(server.connection_count(), 0);

        tokio::time::timeout(Duration::from_secs(2), client.closed())
            .await
            .expect("late stream was left open");
        assert_eq!(server.connection_count(), 0);
        assert_eq!(served.load(Ordering::SeqCst), 0);
    }
}
