//! Transport module - stream sockets.
//!
//! Provides the raw byte streams connections run over:
//! - TCP (all platforms)
//! - Unix Domain Sockets (Linux/macOS)
//!
//! [`Endpoint`] names where to connect or listen, [`connect`] opens a client
//! stream with [`StreamOptions`](crate::config::StreamOptions) applied, and
//! [`Listener`] accepts server streams.

mod stream;

pub use stream::{connect, Endpoint, Listener, Stream};
