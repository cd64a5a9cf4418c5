//! Two-layer JSON envelope and message property types
//!
//! On the wire every message is a JSON object with exactly two keys:
//!
//! ```json
//! {"payload": "<payload serialized as a JSON string>", "properties": {...}}
//! ```
//!
//! The payload is serialized on its own first and then embedded as a string,
//! so decoding has to undo both layers.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Well-known property keys
pub const TYPE_KEY: &str = "type";
pub const METHOD_KEY: &str = "method";
pub const LABEL_KEY: &str = "label";
pub const CORRELATION_DATA_KEY: &str = "correlation_data";
pub const RESPONSE_TOPIC_KEY: &str = "response_topic";
pub const STATUS_KEY: &str = "status";

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Value of the `type` property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    Response,
    Event,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Event => "event",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "request" => Some(MessageType::Request),
            "response" => Some(MessageType::Response),
            "event" => Some(MessageType::Event),
            _ => None,
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open property map attached to every message.
///
/// Keys listed at the top of this module have typed accessors; anything else
/// is carried through untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(Map<String, Value>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// String value of `key`, `None` when absent or not a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Overwrite entries with those from `other`
    pub fn merge(&mut self, other: Properties) {
        self.0.extend(other.0);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn kind(&self) -> Option<MessageType> {
        self.get_str(TYPE_KEY).and_then(MessageType::parse)
    }

    pub fn set_kind(&mut self, kind: MessageType) {
        self.insert(TYPE_KEY, kind.as_str());
    }

    pub fn method(&self) -> Option<&str> {
        self.get_str(METHOD_KEY)
    }

    pub fn label(&self) -> Option<&str> {
        self.get_str(LABEL_KEY)
    }

    pub fn correlation_data(&self) -> Option<&str> {
        self.get_str(CORRELATION_DATA_KEY)
    }

    pub fn response_topic(&self) -> Option<&str> {
        self.get_str(RESPONSE_TOPIC_KEY)
    }

    /// Status as text; numeric statuses are rendered with `to_string`
    pub fn status(&self) -> Option<String> {
        match self.get(STATUS_KEY)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// True for a response carrying exactly `token`
    pub fn is_response_to(&self, token: &str) -> bool {
        self.kind() == Some(MessageType::Response) && self.correlation_data() == Some(token)
    }
}

impl From<Map<String, Value>> for Properties {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<Properties> for Value {
    fn from(properties: Properties) -> Self {
        Value::Object(properties.0)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    payload: String,
    properties: &'a Properties,
}

#[derive(Deserialize)]
struct RawEnvelope {
    payload: String,
    #[serde(default)]
    properties: Option<Properties>,
}

/// Serialize `payload` on its own, then wrap it with `properties`
pub fn encode<P: Serialize + ?Sized>(
    payload: &P,
    properties: &Properties,
) -> Result<Vec<u8>, EnvelopeError> {
    let payload = serde_json::to_string(payload).map_err(EnvelopeError::Encode)?;
    serde_json::to_vec(&OutgoingEnvelope {
        payload,
        properties,
    })
    .map_err(EnvelopeError::Encode)
}

/// Unwrap both envelope layers
pub fn decode(bytes: &[u8]) -> Result<(Value, Properties), EnvelopeError> {
    let raw: RawEnvelope = serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)?;
    let payload = serde_json::from_str(&raw.payload).map_err(EnvelopeError::Decode)?;
    Ok((payload, raw.properties.unwrap_or_default()))
}

/// A decoded message as handed to callers of `receive`
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub topic: String,
    pub payload: Value,
    pub properties: Properties,
}

impl IncomingMessage {
    pub fn from_bytes(topic: impl Into<String>, bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let (payload, properties) = decode(bytes)?;
        Ok(Self {
            topic: topic.into(),
            payload,
            properties,
        })
    }

    /// Shortcut for a field of an object payload
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    /// Deserialize the payload into a concrete type
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, EnvelopeError> {
        T::deserialize(&self.payload).map_err(EnvelopeError::Decode)
    }

    pub fn kind(&self) -> Option<MessageType> {
        self.properties.kind()
    }

    pub fn correlation_data(&self) -> Option<&str> {
        self.properties.correlation_data()
    }

    pub fn status(&self) -> Option<String> {
        self.properties.status()
    }

    /// Caller-level check on the `status` property
    pub fn ensure_status(&self, expected: &str) -> crate::error::ClientResult<()> {
        match self.status() {
            Some(status) if status == expected => Ok(()),
            other => Err(crate::error::ClientError::AssertionFailed(format!(
                "expected status {expected}, got {}",
                other.as_deref().unwrap_or("none")
            ))),
        }
    }
}
