//! # rpcwire
//!
//! Bidirectional JSON-RPC over one persistent stream (TCP or Unix socket).
//!
//! Either end of a [`Connection`] can send notifications, issue requests and
//! answer them. On top of that:
//!
//! - [`Client`] reconnects with exponential backoff and keeps pending
//!   requests and queued frames across drops
//! - [`Server`] accepts connections, authenticates them and tracks the live
//!   ones in a round-robin pool
//!
//! ## Architecture
//!
//! - **Framing**: RESP bulk strings (`$<len>\r\n<payload>\r\n`) by default,
//!   or a 4-byte big-endian length prefix
//! - **Encoding**: JSON by default, MessagePack optional
//! - **Handshake**: optional `auth([token])` request as the first frame,
//!   answered with `"OK"` or a `401 Unauthorized` error
//! - **Backpressure**: outbound frames are queued and coalesced into
//!   vectored writes; [`Event::Drain`] fires when the queue empties
//!
//! ## Example
//!
//! ```no_run
//! use rpcwire::{Client, Connection, Endpoint, Server};
//! use serde_json::json;
//!
//! # async fn run() -> rpcwire::Result<()> {
//! let server = Server::builder()
//!     .bind(&Endpoint::tcp("127.0.0.1:0"), |conn: Connection| async move {
//!         let Ok(mut inbound) = conn.incoming() else { return };
//!         while let Some(Ok(msg)) = inbound.next().await {
//!             let _ = conn
//!                 .handle_request(msg, |m| async move {
//!                     Ok::<_, rpcwire::ErrorObject>(json!({ "echo": m.params() }))
//!                 })
//!                 .await;
//!         }
//!     })
//!     .await?;
//!
//! let endpoint = server.local_endpoint().expect("bound");
//! let client = Client::builder().connect(endpoint);
//! let reply = client.request("ping", json!([1])).await?;
//! assert_eq!(reply, json!({ "echo": [1] }));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod outbound;
pub mod pending;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod transport;

pub use auth::{Auth, AuthError, Authenticator, ClaimsSigner, Signer};
pub use client::{Client, ClientBuilder, ClientState};
pub use config::{ConnectionConfig, RetryPolicy, StreamOptions};
pub use connection::{Connection, ConnectionState, Event, Handshake, Incoming};
pub use error::{Result, RpcError};
pub use message::{create_error, ErrorObject, Id, Message};
pub use pending::PendingRequest;
pub use pool::RingPool;
pub use server::{ConnectionHandler, Server, ServerBuilder};
pub use transport::Endpoint;
