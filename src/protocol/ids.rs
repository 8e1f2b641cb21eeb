//! Correlation identifiers carried by relay requests.
//!
//! The relay tags every request with an id that may be a JSON string or a
//! JSON number. The client never interprets it; it only echoes it back on the
//! matching response, in the same JSON type and with the same digits it
//! arrived with.

use serde::de::{self, Deserializer};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

/// Identifier pairing an inbound request with its response
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationId {
    Text(String),
    /// Number token exactly as it appeared on the wire
    Number(String),
}

impl Serialize for CorrelationId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            CorrelationId::Text(s) => serializer.serialize_str(s),
            CorrelationId::Number(raw) => RawValue::from_string(raw.clone())
                .map_err(ser::Error::custom)?
                .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for CorrelationId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        let token = raw.get().trim();

        match token.as_bytes().first() {
            Some(b'"') => serde_json::from_str(token)
                .map(CorrelationId::Text)
                .map_err(de::Error::custom),
            Some(b'-' | b'0'..=b'9') => Ok(CorrelationId::Number(token.to_string())),
            _ => Err(de::Error::invalid_type(
                de::Unexpected::Other(token),
                &"a string or number id",
            )),
        }
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CorrelationId::Text(s) => write!(f, "{}", s),
            CorrelationId::Number(n) => write!(f, "{}", n),
        }
    }
}

impl From<String> for CorrelationId {
    fn from(s: String) -> Self {
        CorrelationId::Text(s)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        CorrelationId::Text(s.to_string())
    }
}

impl From<u64> for CorrelationId {
    fn from(n: u64) -> Self {
        CorrelationId::Number(n.to_string())
    }
}
