//! Wire envelope for the shared RPC/event socket.
//!
//! Requests go out as `{"type": <command>, "id": <id>, "data": <payload>}`.
//! Inbound frames share one shape for responses and push events:
//! `{ type | event: string, id?: string | number, data: object, error?: string }`.
//! Whether an inbound frame is a response is decided by the correlation
//! table, not by a field on the wire.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Fields that may carry the topic, in priority order.
///
/// `event` wins over `type` because some servers send `{"type": "event",
/// "event": "<name>"}`.
const TOPIC_FIELDS: [&str; 4] = ["event", "topic", "type", "command"];

/// Correlation id linking a request to its response.
///
/// Numeric ids on the wire are normalized to their decimal text, so a
/// response carrying `1` matches a request sent as `"1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Borrow the id text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self(s.clone())),
            Value::Number(n) => Some(Self(n.to_string())),
            _ => None,
        }
    }
}

impl From<u64> for CorrelationId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What an envelope represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    /// Outbound command awaiting a response.
    Request,
    /// Inbound frame carrying an id; a response if the id is pending.
    Response,
    /// Server push with no correlation id.
    Event,
}

/// One message unit on the shared socket.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Request, response or event.
    pub kind: EnvelopeKind,
    /// Correlation id (absent on events).
    pub id: Option<CorrelationId>,
    /// Command name for requests, event name otherwise.
    pub topic: String,
    /// Opaque structured data.
    pub payload: Value,
    /// Error text on failed responses.
    pub error: Option<String>,
}

impl Envelope {
    /// Build a request envelope.
    pub fn request(id: CorrelationId, command: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: EnvelopeKind::Request,
            id: Some(id),
            topic: command.into(),
            payload,
            error: None,
        }
    }

    /// Serialize to the wire shape.
    pub fn to_wire(&self) -> Value {
        let mut map = Map::new();
        map.insert("type".to_string(), Value::String(self.topic.clone()));
        if let Some(id) = &self.id {
            map.insert("id".to_string(), Value::String(id.0.clone()));
        }
        map.insert("data".to_string(), self.payload.clone());
        if let Some(error) = &self.error {
            map.insert("error".to_string(), Value::String(error.clone()));
        }
        Value::Object(map)
    }

    /// Interpret an inbound JSON frame.
    ///
    /// The payload is read from `data` (or `payload`), defaulting to `null`.
    /// A frame is malformed when it is not an object, names no topic and
    /// carries no id, or has an id of the wrong type.
    pub fn from_wire(value: Value) -> Result<Self> {
        let Value::Object(mut map) = value else {
            return Err(Error::MalformedFrame("frame is not a JSON object".into()));
        };

        let id = match map.get("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(CorrelationId::from_value(raw).ok_or_else(|| {
                Error::MalformedFrame(format!("id must be a string or number, got {raw}"))
            })?),
        };

        let topic = TOPIC_FIELDS
            .iter()
            .find_map(|field| map.get(*field).and_then(Value::as_str))
            .map(str::to_string);

        let topic = match (topic, &id) {
            (Some(topic), _) => topic,
            (None, Some(_)) => String::new(),
            (None, None) => {
                return Err(Error::MalformedFrame("frame has neither topic nor id".into()));
            }
        };

        let error = match map.get("error") {
            None | Some(Value::Null | Value::Bool(false)) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Object(obj)) => Some(
                obj.get("message")
                    .and_then(Value::as_str)
                    .map_or_else(|| Value::Object(obj.clone()).to_string(), str::to_string),
            ),
            Some(other) => Some(other.to_string()),
        };

        let payload = map
            .remove("data")
            .or_else(|| map.remove("payload"))
            .unwrap_or(Value::Null);

        Ok(Self {
            kind: if id.is_some() {
                EnvelopeKind::Response
            } else {
                EnvelopeKind::Event
            },
            id,
            topic,
            payload,
            error,
        })
    }
}
