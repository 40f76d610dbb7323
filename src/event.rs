//! Event model: tagged values and the updates flowing from the feed to the sink

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::json;

/// Identifies a watch inside the group that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatchId(pub u64);

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// A value pushed by the feed.
///
/// JSON encoding: null, booleans, numbers and strings map to their native JSON
/// forms. Timestamps encode as `{"time": <epoch-millis>}` and bytes as
/// `{"bytes": [..]}` so they survive a round trip through the sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Time(i64),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Epoch millis embedded in a timestamp value; zero for every other kind.
    pub fn time_component(&self) -> i64 {
        match self {
            Value::Time(ms) => *ms,
            _ => 0,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Time(_) => "time",
            Value::Bytes(_) => "bytes",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Time(ms) => json!({ "time": ms }),
            Value::Bytes(bytes) => json!({ "bytes": bytes }),
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::Number).unwrap_or(Value::Null),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Object(map) if map.len() == 1 => {
                if let Some(ms) = map.get("time").and_then(|t| t.as_i64()) {
                    return Value::Time(ms);
                }
                if let Some(bytes) = map.get("bytes").and_then(decode_bytes) {
                    return Value::Bytes(bytes);
                }
                Value::String(json.to_string())
            }
            other => Value::String(other.to_string()),
        }
    }

    /// Decode a JSON-encoded value as stored by the query service.
    ///
    /// Text that is not valid JSON is kept as a plain string.
    pub fn from_encoded(encoded: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(encoded) {
            Ok(json) => Value::from_json(&json),
            Err(_) => Value::String(encoded.to_string()),
        }
    }
}

fn decode_bytes(json: &serde_json::Value) -> Option<Vec<u8>> {
    json.as_array()?
        .iter()
        .map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
        .collect()
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::String(s) => write!(f, "{}", s),
            Value::Time(ms) => write!(f, "{}", crate::timestamp::encode_millis(*ms)),
            Value::Bytes(bytes) => write!(f, "<{} bytes>", bytes.len()),
        }
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

/// One update delivered for a watch. Never mutated after creation.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub watch_id: WatchId,
    pub path: String,
    pub value: Value,
    pub timestamp_millis: i64,
}

impl UpdateEvent {
    pub fn new(watch_id: WatchId, path: impl Into<String>, value: Value, timestamp_millis: i64) -> Self {
        Self {
            watch_id,
            path: path.into(),
            value,
            timestamp_millis,
        }
    }
}
