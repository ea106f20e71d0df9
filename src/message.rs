//! JSON-RPC 2.0 message grammar.
//!
//! Four message shapes travel over a connection:
//!
//! ```text
//! request       {"jsonrpc":"2.0","id":..,"method":..,"params":..}
//! notification  {"jsonrpc":"2.0","method":..,"params":..}
//! success       {"jsonrpc":"2.0","id":..,"result":..}
//! error         {"jsonrpc":"2.0","id":..,"error":{"code":..,"message":..,"data":..}}
//! ```
//!
//! Messages are built and parsed through [`serde_json::Value`] so that any
//! [`MessageCodec`](crate::codec::MessageCodec) able to carry a JSON value
//! tree (JSON text, MsgPack) can be plugged in.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, RpcError};

/// Protocol version tag carried by every message.
pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC message id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    /// Numeric id.
    Num(i64),
    /// String id (correlation ids issued by this crate are always strings).
    Str(String),
    /// `null`, only valid on error responses to unparseable requests.
    Null,
}

impl Id {
    /// String form of the id, if it is a string id.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Id::Str(s) => Some(s),
            _ => None,
        }
    }

    fn from_value(value: &Value) -> Option<Id> {
        match value {
            Value::String(s) => Some(Id::Str(s.clone())),
            Value::Number(n) => n.as_i64().map(Id::Num),
            Value::Null => Some(Id::Null),
            _ => None,
        }
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Id::Num(n) => write!(f, "{}", n),
            Id::Str(s) => f.write_str(s),
            Id::Null => f.write_str("null"),
        }
    }
}

impl From<String> for Id {
    fn from(s: String) -> Self {
        Id::Str(s)
    }
}

impl From<&str> for Id {
    fn from(s: &str) -> Self {
        Id::Str(s.to_string())
    }
}

impl From<i64> for Id {
    fn from(n: i64) -> Self {
        Id::Num(n)
    }
}

/// Structured JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Error code.
    pub code: i64,
    /// Short description.
    pub message: String,
    /// Optional diagnostic data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorObject {
    /// Handshake rejected.
    pub const UNAUTHORIZED: i64 = 401;
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i64 = -32700;
    /// The JSON sent is not a valid request object.
    pub const INVALID_REQUEST: i64 = -32600;
    /// The method does not exist.
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i64 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i64 = -32603;

    /// Create an error object without data.
    pub fn new(message: impl Into<String>, code: i64) -> Self {
        let message = message.into();
        Self {
            code,
            message: if message.is_empty() {
                "Unknown error".to_string()
            } else {
                message
            },
            data: None,
        }
    }

    /// Attach diagnostic data.
    pub fn with_data(mut self, data: impl Into<Value>) -> Self {
        self.data = Some(data.into());
        self
    }

    /// Replace the code.
    pub fn with_code(mut self, code: i64) -> Self {
        self.code = code;
        self
    }

    /// `401 Unauthorized` with a diagnostic string.
    pub fn unauthorized(data: impl Into<String>) -> Self {
        Self::new("Unauthorized", Self::UNAUTHORIZED).with_data(data.into())
    }

    /// `-32700 Parse error`.
    pub fn parse_error(data: Option<Value>) -> Self {
        Self::standard("Parse error", Self::PARSE_ERROR, data)
    }

    /// `-32600 Invalid request`.
    pub fn invalid_request(data: Option<Value>) -> Self {
        Self::standard("Invalid request", Self::INVALID_REQUEST, data)
    }

    /// `-32601 Method not found`.
    pub fn method_not_found(data: Option<Value>) -> Self {
        Self::standard("Method not found", Self::METHOD_NOT_FOUND, data)
    }

    /// `-32602 Invalid params`.
    pub fn invalid_params(data: Option<Value>) -> Self {
        Self::standard("Invalid params", Self::INVALID_PARAMS, data)
    }

    /// `-32603 Internal error`.
    pub fn internal_error(data: Option<Value>) -> Self {
        Self::standard("Internal error", Self::INTERNAL_ERROR, data)
    }

    /// Build an error from a bare numeric code.
    ///
    /// Standard JSON-RPC codes map to their canonical messages; any other
    /// code yields `"Unknown error"`.
    pub fn from_code(code: i64, data: Option<Value>) -> Self {
        match code {
            Self::INVALID_REQUEST => Self::invalid_request(data),
            Self::METHOD_NOT_FOUND => Self::method_not_found(data),
            Self::INVALID_PARAMS => Self::invalid_params(data),
            Self::INTERNAL_ERROR => Self::internal_error(data),
            Self::PARSE_ERROR => Self::parse_error(data),
            _ => Self::standard("Unknown error", code, data),
        }
    }

    fn standard(message: &str, code: i64, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.to_string(),
            data,
        }
    }
}

impl fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

impl std::error::Error for ErrorObject {}

impl From<i64> for ErrorObject {
    fn from(code: i64) -> Self {
        ErrorObject::from_code(code, None)
    }
}

impl From<(i64, Value)> for ErrorObject {
    fn from((code, data): (i64, Value)) -> Self {
        ErrorObject::from_code(code, Some(data))
    }
}

impl From<&str> for ErrorObject {
    fn from(message: &str) -> Self {
        ErrorObject::new(message, 0)
    }
}

impl From<String> for ErrorObject {
    fn from(message: String) -> Self {
        ErrorObject::new(message, 0)
    }
}

impl From<&RpcError> for ErrorObject {
    fn from(err: &RpcError) -> Self {
        match err {
            RpcError::Remote(obj) => obj.clone(),
            RpcError::Auth(e) => ErrorObject::unauthorized(e.to_string()),
            RpcError::Timeout { frame, .. } => {
                ErrorObject::new(err.to_string(), ErrorObject::INTERNAL_ERROR)
                    .with_data(String::from_utf8_lossy(frame).into_owned())
            }
            RpcError::Json(_) | RpcError::MsgPackDecode(_) => {
                ErrorObject::parse_error(Some(Value::String(err.to_string())))
            }
            RpcError::ProtocolViolation(_) => {
                ErrorObject::invalid_request(Some(Value::String(err.to_string())))
            }
            _ => ErrorObject::new(err.to_string(), ErrorObject::INTERNAL_ERROR),
        }
    }
}

impl From<RpcError> for ErrorObject {
    fn from(err: RpcError) -> Self {
        ErrorObject::from(&err)
    }
}

/// Normalize an arbitrary error value into a structured error object.
///
/// Accepts an existing [`ErrorObject`], any [`RpcError`], a numeric code,
/// a `(code, data)` pair, or a plain message.
pub fn create_error(err: impl Into<ErrorObject>) -> ErrorObject {
    err.into()
}

/// A decoded JSON-RPC message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Call expecting a response.
    Request {
        id: Id,
        method: String,
        params: Option<Value>,
    },
    /// One-way call.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// Successful response.
    Success { id: Id, result: Value },
    /// Error response.
    Error { id: Id, error: ErrorObject },
}

impl Message {
    /// Request; a `null` params value is dropped.
    pub fn request(id: impl Into<Id>, method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Request {
            id: id.into(),
            method: method.into(),
            params: non_null(params),
        }
    }

    /// Notification; a `null` params value is dropped.
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Message::Notification {
            method: method.into(),
            params: non_null(params),
        }
    }

    /// Success response carrying `result`.
    pub fn success(id: impl Into<Id>, result: Value) -> Self {
        Message::Success {
            id: id.into(),
            result,
        }
    }

    /// Error response carrying `error`.
    pub fn error(id: impl Into<Id>, error: ErrorObject) -> Self {
        Message::Error {
            id: id.into(),
            error,
        }
    }

    /// Id of requests and responses.
    pub fn id(&self) -> Option<&Id> {
        match self {
            Message::Request { id, .. } | Message::Success { id, .. } | Message::Error { id, .. } => {
                Some(id)
            }
            Message::Notification { .. } => None,
        }
    }

    /// Method name of requests and notifications.
    pub fn method(&self) -> Option<&str> {
        match self {
            Message::Request { method, .. } | Message::Notification { method, .. } => Some(method),
            _ => None,
        }
    }

    /// Params of requests and notifications, if present.
    pub fn params(&self) -> Option<&Value> {
        match self {
            Message::Request { params, .. } | Message::Notification { params, .. } => {
                params.as_ref()
            }
            _ => None,
        }
    }

    /// True for requests.
    #[inline]
    pub fn is_request(&self) -> bool {
        matches!(self, Message::Request { .. })
    }

    /// True for notifications.
    #[inline]
    pub fn is_notification(&self) -> bool {
        matches!(self, Message::Notification { .. })
    }

    /// True for success and error responses.
    #[inline]
    pub fn is_response(&self) -> bool {
        matches!(self, Message::Success { .. } | Message::Error { .. })
    }

    /// Build the JSON value tree for this message.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::with_capacity(4);
        obj.insert("jsonrpc".into(), Value::String(JSONRPC_VERSION.into()));
        match self {
            Message::Request { id, method, params } => {
                obj.insert("id".into(), id_value(id));
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(p) = params {
                    obj.insert("params".into(), p.clone());
                }
            }
            Message::Notification { method, params } => {
                obj.insert("method".into(), Value::String(method.clone()));
                if let Some(p) = params {
                    obj.insert("params".into(), p.clone());
                }
            }
            Message::Success { id, result } => {
                obj.insert("id".into(), id_value(id));
                obj.insert("result".into(), result.clone());
            }
            Message::Error { id, error } => {
                obj.insert("id".into(), id_value(id));
                // ErrorObject only holds JSON-native fields
                obj.insert(
                    "error".into(),
                    serde_json::to_value(error).unwrap_or(Value::Null),
                );
            }
        }
        Value::Object(obj)
    }

    /// Parse a JSON value tree into a message.
    ///
    /// Returns [`RpcError::ProtocolViolation`] when the value is not a valid
    /// JSON-RPC 2.0 message.
    pub fn from_value(value: Value) -> Result<Message> {
        let mut obj = match value {
            Value::Object(obj) => obj,
            other => return Err(invalid("not an object", &other)),
        };

        if obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(invalid("missing or wrong \"jsonrpc\" version", &Value::Object(obj)));
        }

        let id = match obj.get("id").map(Id::from_value) {
            Some(Some(id)) => Some(id),
            Some(None) => return Err(invalid("invalid \"id\"", &Value::Object(obj))),
            None => None,
        };

        let method = obj
            .get("method")
            .map(|m| m.as_str().map(str::to_string));
        if let Some(method) = method {
            let method = match method {
                Some(m) => m,
                None => return Err(invalid("invalid \"method\"", &Value::Object(obj))),
            };
            let params = obj.remove("params");
            if let Some(p) = &params {
                if !(p.is_array() || p.is_object() || p.is_null()) {
                    return Err(invalid("invalid \"params\"", p));
                }
            }
            return Ok(match id {
                Some(id) if id != Id::Null => Message::Request {
                    id,
                    method,
                    params: non_null(params),
                },
                _ => Message::Notification {
                    method,
                    params: non_null(params),
                },
            });
        }

        if let Some(result) = obj.remove("result") {
            return match id {
                Some(id) if id != Id::Null => Ok(Message::Success { id, result }),
                _ => Err(invalid("success without \"id\"", &result)),
            };
        }

        if let Some(error) = obj.remove("error") {
            let error: ErrorObject = serde_json::from_value(error)
                .map_err(|e| RpcError::ProtocolViolation(format!("invalid \"error\": {}", e)))?;
            return Ok(Message::Error {
                id: id.unwrap_or(Id::Null),
                error,
            });
        }

        Err(invalid("unrecognized message", &Value::Object(obj)))
    }
}

impl Serialize for Message {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

fn id_value(id: &Id) -> Value {
    match id {
        Id::Num(n) => Value::from(*n),
        Id::Str(s) => Value::String(s.clone()),
        Id::Null => Value::Null,
    }
}

fn non_null(params: Option<Value>) -> Option<Value> {
    params.filter(|p| !p.is_null())
}

fn invalid(reason: &str, value: &Value) -> RpcError {
    RpcError::ProtocolViolation(format!("invalid message ({}): {}", reason, value))
}
