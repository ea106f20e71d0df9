//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` so extracted payloads are zero-copy slices of the
//! read buffer. The framer decides where one frame ends; the buffer only
//! keeps the leftover bytes until the next read arrives.
//!
//! # Example
//!
//! ```
//! use rpcwire::protocol::{BulkFramer, Framer, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! let wire = BulkFramer.encode(br#"{"jsonrpc":"2.0","method":"ping"}"#);
//!
//! // Data arrives in chunks from the socket
//! assert!(buffer.push(&wire[..6]).unwrap().is_empty());
//! let frames = buffer.push(&wire[6..]).unwrap();
//! assert_eq!(frames.len(), 1);
//! ```

use bytes::{Bytes, BytesMut};

use super::framer::{default_framer, SharedFramer, DEFAULT_MAX_FRAME_SIZE};
use crate::error::Result;

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    framer: SharedFramer,
    /// Maximum allowed payload size.
    max_frame_size: usize,
}

impl FrameBuffer {
    /// Create a frame buffer with the default framer.
    ///
    /// Default capacity: 64KB, max payload: 64MB.
    pub fn new() -> Self {
        Self::with_framer(default_framer(), DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a frame buffer with a custom framer and max payload size.
    pub fn with_framer(framer: SharedFramer, max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            framer,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frame payloads.
    ///
    /// Partial data stays buffered for the next push.
    ///
    /// # Errors
    ///
    /// Returns a protocol violation if the framer rejects the stream, e.g. a
    /// frame announcing more than `max_frame_size` bytes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Bytes>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(payload) = self.framer.decode(&mut self.buffer, self.max_frame_size)? {
            frames.push(payload);
        }

        Ok(frames)
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Drop any buffered partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
