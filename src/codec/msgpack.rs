//! MsgPack codec using `rmp-serde`.
//!
//! Messages are carried as a MsgPack encoding of the same value tree the
//! JSON codec writes, so both sides only need to agree on the codec name.

use bytes::Bytes;
use serde_json::Value;

use super::MessageCodec;
use crate::error::Result;
use crate::message::Message;

/// MessagePack codec for JSON-RPC messages.
///
/// JSON objects become MsgPack maps keyed by field name, so a message decodes
/// to the same value tree on either side.
#[derive(Debug, Clone, Copy, Default)]
pub struct MsgPackCodec;

impl MessageCodec for MsgPackCodec {
    fn name(&self) -> &'static str {
        "msgpack"
    }

    #[inline]
    fn encode(&self, message: &Message) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(&message.to_value())?))
    }

    #[inline]
    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let value: Value = rmp_serde::from_slice(bytes)?;
        Message::from_value(value)
    }
}
