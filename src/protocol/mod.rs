//! Protocol module - wire framing.
//!
//! Every encoded message travels inside one length-prefixed frame:
//! - [`Framer`] - pluggable frame encoder/decoder
//! - [`BulkFramer`] - RESP bulk strings, `$<len>\r\n<payload>\r\n` (default)
//! - [`PrefixFramer`] - 4-byte big-endian length prefix
//! - [`FrameBuffer`] - accumulates partial reads and yields complete frames

mod frame_buffer;
mod framer;

pub use frame_buffer::FrameBuffer;
pub use framer::{
    check_frame_size, default_framer, BulkFramer, Framer, PrefixFramer, SharedFramer, DEFAULT_MAX_FRAME_SIZE,
    PREFIX_SIZE,
};
