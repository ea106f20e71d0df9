//! JSON text codec.

use bytes::Bytes;
use serde_json::Value;

use super::MessageCodec;
use crate::error::Result;
use crate::message::Message;

/// UTF-8 JSON text codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl MessageCodec for JsonCodec {
    fn name(&self) -> &'static str {
        "json"
    }

    fn encode(&self, message: &Message) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(&message.to_value())?))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Message> {
        let value: Value = serde_json::from_slice(bytes)?;
        Message::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;
    use serde_json::json;

    #[test]
    fn test_encode_is_json_text() {
        let msg = Message::success("a:1", json!("OK"));
        let bytes = JsonCodec.encode(&msg).unwrap();
        let text = std::str::from_utf8(&bytes).unwrap();
        assert!(text.contains("\"result\":\"OK\""));
        assert!(text.contains("\"jsonrpc\":\"2.0\""));
    }

    #[test]
    fn test_decode_invalid_json() {
        let result = JsonCodec.decode(b"{not json");
        assert!(matches!(result, Err(RpcError::Json(_))));
    }

    #[test]
    fn test_decode_invalid_message() {
        let result = JsonCodec.decode(br#"{"jsonrpc":"2.0"}"#);
        assert!(matches!(result, Err(RpcError::ProtocolViolation(_))));
    }
}
