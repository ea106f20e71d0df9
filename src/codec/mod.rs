//! Codec module - message encoding strategies.
//!
//! A [`MessageCodec`] turns a [`Message`](crate::message::Message) into the
//! bytes carried inside one frame, and back:
//!
//! - [`JsonCodec`] - UTF-8 JSON text (default)
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`)
//!
//! The codec is chosen once, when a connection, client or server is built,
//! and shared by every message on it.
//!
//! # Example
//!
//! ```
//! use rpcwire::codec::{JsonCodec, MessageCodec, MsgPackCodec};
//! use rpcwire::message::Message;
//! use serde_json::json;
//!
//! let msg = Message::notification("hello", Some(json!([1])));
//!
//! let codecs: [&dyn MessageCodec; 2] = [&JsonCodec, &MsgPackCodec];
//! for codec in codecs {
//!     let bytes = codec.encode(&msg).unwrap();
//!     assert_eq!(codec.decode(&bytes).unwrap(), msg);
//! }
//! ```

mod json;
mod msgpack;

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::message::Message;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

/// Encoding strategy for JSON-RPC messages.
pub trait MessageCodec: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Encode a message to frame payload bytes.
    fn encode(&self, message: &Message) -> Result<Bytes>;

    /// Decode frame payload bytes into a message.
    fn decode(&self, bytes: &[u8]) -> Result<Message>;
}

/// Shared codec handle.
pub type SharedCodec = Arc<dyn MessageCodec>;

/// The default codec ([`JsonCodec`]).
pub fn default_codec() -> SharedCodec {
    Arc::new(JsonCodec)
}
