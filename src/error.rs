//! Error types for rpcwire.

use bytes::Bytes;
use thiserror::Error;

use crate::auth::AuthError;
use crate::message::ErrorObject;

/// Main error type for all rpcwire operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Malformed frame or handshake.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Structured JSON-RPC error returned by the peer.
    #[error("{0}")]
    Remote(ErrorObject),

    /// No response arrived before the request deadline.
    ///
    /// `frame` holds the encoded request for diagnostics.
    #[error("Request timed out: {id}")]
    Timeout {
        /// Correlation id of the request.
        id: String,
        /// Encoded request frame.
        frame: Bytes,
    },

    /// The connection went away while the request was pending.
    #[error("socket hang up")]
    ConnectionReset,

    /// The connection (or client) is already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The inbound message stream can only be attached once.
    #[error("Inbound message stream already attached")]
    IncomingAttached,

    /// Token signing or verification failed locally.
    #[error("Auth error: {0}")]
    Auth(#[from] AuthError),
}

impl RpcError {
    /// Numeric error code, when the error carries one.
    pub fn code(&self) -> Option<i64> {
        match self {
            RpcError::Remote(obj) => Some(obj.code),
            RpcError::Auth(_) => Some(ErrorObject::UNAUTHORIZED),
            _ => None,
        }
    }

    /// True for a 401 `Unauthorized` handshake rejection.
    pub fn is_unauthorized(&self) -> bool {
        self.code() == Some(ErrorObject::UNAUTHORIZED)
    }

    /// True when the request was failed by connection teardown.
    pub fn is_reset(&self) -> bool {
        matches!(self, RpcError::ConnectionReset)
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;
