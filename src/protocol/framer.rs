//! Frame encoders/decoders.
//!
//! Two framings are provided:
//!
//! ```text
//! BulkFramer    $<decimal length>\r\n<payload>\r\n
//! PrefixFramer  ┌──────────────┬─────────┐
//!               │ Length (u32) │ Payload │
//!               │ 4 bytes BE   │ N bytes │
//!               └──────────────┴─────────┘
//! ```
//!
//! Both ends of a connection must use the same framer.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};

/// Default maximum frame payload size (64 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Length prefix size for [`PrefixFramer`].
pub const PREFIX_SIZE: usize = 4;

/// Longest accepted bulk header line, `$` + digits, before the CRLF.
const MAX_BULK_HEADER: usize = 21;

/// Wire framing strategy.
pub trait Framer: Send + Sync + 'static {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Largest payload this framing can represent.
    fn max_payload(&self) -> usize {
        usize::MAX
    }

    /// Wrap a payload into one frame.
    ///
    /// Callers keep `payload` within [`max_payload`](Framer::max_payload).
    fn encode(&self, payload: &[u8]) -> Bytes;

    /// Try to split one complete frame off the front of `buf`.
    ///
    /// Returns:
    /// - `Ok(Some(payload))` if a complete frame was consumed
    /// - `Ok(None)` if more data is needed (nothing is consumed)
    /// - `Err(...)` on a malformed or oversized frame
    fn decode(&self, buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>>;
}

/// Reject a payload length above `max_frame_size`.
pub fn check_frame_size(len: usize, max_frame_size: usize) -> Result<()> {
    if len > max_frame_size {
        return Err(RpcError::ProtocolViolation(format!(
            "Frame size {} exceeds maximum {}",
            len, max_frame_size
        )));
    }
    Ok(())
}

/// Shared framer handle.
pub type SharedFramer = Arc<dyn Framer>;

/// The default framer ([`BulkFramer`]).
pub fn default_framer() -> SharedFramer {
    Arc::new(BulkFramer)
}

/// RESP bulk-string framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkFramer;

impl Framer for BulkFramer {
    fn name(&self) -> &'static str {
        "bulk"
    }

    fn encode(&self, payload: &[u8]) -> Bytes {
        let len = payload.len().to_string();
        let mut buf = BytesMut::with_capacity(1 + len.len() + 2 + payload.len() + 2);
        buf.put_u8(b'$');
        buf.put_slice(len.as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(payload);
        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    fn decode(&self, buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>> {
        if buf.is_empty() {
            return Ok(None);
        }
        if buf[0] != b'$' {
            return Err(RpcError::ProtocolViolation(format!(
                "Expected bulk string marker '$', got 0x{:02X}",
                buf[0]
            )));
        }

        let scan = &buf[..buf.len().min(MAX_BULK_HEADER + 2)];
        let line_end = match scan.windows(2).position(|w| w == b"\r\n") {
            Some(pos) => pos,
            None if buf.len() > MAX_BULK_HEADER + 1 => {
                return Err(RpcError::ProtocolViolation(
                    "Bulk string header too long".to_string(),
                ));
            }
            None => return Ok(None),
        };

        let digits = std::str::from_utf8(&buf[1..line_end])
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| {
                RpcError::ProtocolViolation(format!(
                    "Invalid bulk string length: {:?}",
                    String::from_utf8_lossy(&buf[1..line_end])
                ))
            })?;

        check_frame_size(digits, max_frame_size)?;

        let header_len = line_end + 2;
        let total = header_len + digits + 2;
        if buf.len() < total {
            return Ok(None);
        }
        if &buf[header_len + digits..total] != b"\r\n" {
            return Err(RpcError::ProtocolViolation(
                "Bulk string missing trailing CRLF".to_string(),
            ));
        }

        buf.advance(header_len);
        let payload = buf.split_to(digits).freeze();
        buf.advance(2);
        Ok(Some(payload))
    }
}

/// Big-endian `u32` length-prefix framing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrefixFramer;

impl Framer for PrefixFramer {
    fn name(&self) -> &'static str {
        "prefix"
    }

    fn max_payload(&self) -> usize {
        u32::MAX as usize
    }

    fn encode(&self, payload: &[u8]) -> Bytes {
        debug_assert!(payload.len() <= self.max_payload());
        let mut buf = BytesMut::with_capacity(PREFIX_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_slice(payload);
        buf.freeze()
    }

    fn decode(&self, buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>> {
        if buf.len() < PREFIX_SIZE {
            return Ok(None);
        }

        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        check_frame_size(len, max_frame_size)?;

        if buf.len() < PREFIX_SIZE + len {
            return Ok(None);
        }

        buf.advance(PREFIX_SIZE);
        Ok(Some(buf.split_to(len).freeze()))
    }
}
