use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::CorrelationId;
use crate::error::{Result, TunnelError};

/// User id sent on registration when no token is stored
pub const ANONYMOUS_USER: &str = "anonymous";

/// Registration request sent as the first message on every connection
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "register", rename_all = "camelCase")]
pub struct Registration {
    pub user_id: String,
    pub port: u16,
}

/// Outgoing message types (Client -> Relay)
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    Register(Registration),
    Response(TunnelResponse),
}

/// Incoming message types (Relay -> Client)
#[derive(Debug, Clone)]
pub enum IncomingMessage {
    /// The relay accepted the registration and assigned a public alias
    Registered { alias: String },
    /// An HTTP request to replay against the local service
    Request(TunnelRequest),
}

/// Just enough of a relay message to tell the two kinds apart
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: Option<Value>,
}

#[derive(Deserialize)]
struct RegistrationAck {
    alias: String,
}

/// A serialized HTTP request received from the relay
#[derive(Debug, Clone, Deserialize)]
pub struct TunnelRequest {
    pub id: CorrelationId,
    pub method: String,
    /// Path including the query string, used verbatim
    pub path: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<FileUpload>,
}

/// A file attached to a multipart upload
#[derive(Debug, Clone, Deserialize)]
pub struct FileUpload {
    pub fieldname: String,
    pub originalname: String,
    #[serde(default)]
    pub mimetype: String,
    #[serde(deserialize_with = "buffer_bytes")]
    pub buffer: Vec<u8>,
}

/// The response shipped back to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunnelResponse {
    pub id: CorrelationId,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: ResponseBody,
}

/// Response body as it appears on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    /// `{"type": "binary", "data": "<base64>"}`
    Binary(BinaryBody),
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinaryBody {
    #[serde(rename = "type")]
    pub kind: BinaryKind,
    pub data: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BinaryKind {
    Binary,
}

impl OutgoingMessage {
    pub fn register(token: Option<&str>, port: u16) -> Self {
        OutgoingMessage::Register(Registration {
            user_id: token.unwrap_or(ANONYMOUS_USER).to_string(),
            port,
        })
    }

    pub fn to_json(&self) -> std::result::Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl IncomingMessage {
    pub fn from_json(json: &str) -> Result<Self> {
        Self::from_slice(json.as_bytes())
    }

    /// Decode a relay message.
    ///
    /// Anything carrying `"type": "registered"` must be a registration
    /// acknowledgment; everything else must be a replay request.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        // Requests are decoded straight from the bytes so numeric ids keep
        // their exact digits
        let envelope: Envelope =
            serde_json::from_slice(bytes).map_err(TunnelError::MalformedMessage)?;

        if envelope.kind.as_ref().and_then(Value::as_str) == Some("registered") {
            let ack: RegistrationAck =
                serde_json::from_slice(bytes).map_err(TunnelError::MalformedMessage)?;
            return Ok(IncomingMessage::Registered { alias: ack.alias });
        }

        serde_json::from_slice(bytes)
            .map(IncomingMessage::Request)
            .map_err(TunnelError::MalformedMessage)
    }
}

impl TunnelRequest {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    /// True when the request must be rebuilt as a multipart form
    pub fn is_multipart_upload(&self) -> bool {
        !self.files.is_empty()
            && self
                .content_type()
                .map(|ct| ct.to_ascii_lowercase().contains("multipart/form-data"))
                .unwrap_or(false)
    }
}

impl TunnelResponse {
    /// Generic 500 sent when the local call could not be completed
    pub fn internal_error(id: CorrelationId) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());

        TunnelResponse {
            id,
            status: 500,
            headers,
            body: ResponseBody::Json(serde_json::json!({ "error": "Internal server error" })),
        }
    }
}

impl ResponseBody {
    pub fn binary(data: &[u8]) -> Self {
        ResponseBody::Binary(BinaryBody {
            kind: BinaryKind::Binary,
            data: base64::engine::general_purpose::STANDARD.encode(data),
        })
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Raw file bytes, either a Node `Buffer` JSON array or a base64 string
#[derive(Deserialize)]
#[serde(untagged)]
enum RawBytes {
    Array(Vec<u8>),
    Base64(String),
}

#[derive(Deserialize)]
struct BufferData {
    data: RawBytes,
}

fn buffer_bytes<'de, D>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error>
where
    D: Deserializer<'de>,
{
    match BufferData::deserialize(deserializer)?.data {
        RawBytes::Array(bytes) => Ok(bytes),
        RawBytes::Base64(encoded) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom),
    }
}
