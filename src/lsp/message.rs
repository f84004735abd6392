//! JSON-RPC 2.0 envelope types.
//!
//! [`Message`] is the shape that travels on the wire. [`Incoming`] is what
//! the dispatcher hands to the client once a message has been classified,
//! so callers never have to look at raw `id`/`method`/`result` members.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Number, Value};

/// The only protocol version this client speaks.
pub const JSONRPC_VERSION: &str = "2.0";

/// Identifier the client assigns to each outgoing request.
///
/// Ids start at 1 and are never reused for the lifetime of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl RequestId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<RequestId> for MessageId {
    fn from(id: RequestId) -> Self {
        MessageId::Number(id.0)
    }
}

/// An `id` member as it appears on the wire.
///
/// JSON-RPC allows numbers and strings. We only ever issue non-negative
/// integers, but a peer may still send strings (on its own requests, or by
/// mistake) or numbers we could never have issued, such as `-1` or `1.0`.
/// Those land in `Other` so the message still decodes and routing can name
/// the id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageId {
    Number(u64),
    String(String),
    Other(Number),
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MessageId::Number(n) => write!(f, "{}", n),
            MessageId::String(s) => write!(f, "{:?}", s),
            MessageId::Other(n) => write!(f, "{}", n),
        }
    }
}

/// JSON-RPC error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A JSON-RPC message exactly as framed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Defaults to "2.0" when the peer leaves it out.
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub params: Option<Value>,
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// Keep an explicit `null` as `Some(Value::Null)`; only a missing member is `None`.
///
/// `"result": null` is the normal success reply to `shutdown`.
fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl Message {
    /// Build an outgoing request.
    pub fn request(id: RequestId, method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id.into()),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a notification (no id field).
    pub fn notification(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
            error: None,
        }
    }

    /// Build a successful response.
    pub fn response(id: MessageId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
            error: None,
        }
    }

    /// Build a failed response.
    pub fn error_response(id: MessageId, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: None,
            error: Some(error),
        }
    }
}

/// A response correlated to one of our requests.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub payload: Result<Value, ResponseError>,
}

impl Response {
    pub fn is_error(&self) -> bool {
        self.payload.is_err()
    }

    /// Convert back into the wire envelope, e.g. for printing.
    pub fn to_message(&self) -> Message {
        match &self.payload {
            Ok(result) => Message::response(self.id.into(), result.clone()),
            Err(error) => Message::error_response(self.id.into(), error.clone()),
        }
    }
}

/// An unsolicited message from the peer.
///
/// `id` is only set when the peer sent a request of its own; the minimal
/// client never answers those, it just delivers them.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
    pub id: Option<MessageId>,
}

impl Notification {
    pub fn to_message(&self) -> Message {
        Message {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: self.id.clone(),
            method: Some(self.method.clone()),
            params: Some(self.params.clone()),
            result: None,
            error: None,
        }
    }
}

/// A classified incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    Response(Response),
    Notification(Notification),
}
