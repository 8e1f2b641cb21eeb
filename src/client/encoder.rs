//! Serialization of local HTTP responses into relay responses.

use std::collections::BTreeMap;

use crate::protocol::{CorrelationId, ResponseBody, TunnelResponse};

/// A completed response from the local service, fully buffered
#[derive(Debug, Clone)]
pub struct LocalResponse {
    pub status: u16,
    /// Header pairs in the order the transport yielded them
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// How a response body travels over the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyClass {
    Binary,
    Json,
    Text,
}

impl BodyClass {
    pub fn from_content_type(content_type: Option<&str>) -> Self {
        let ct = content_type.unwrap_or_default().to_ascii_lowercase();

        if ct.starts_with("image/")
            || ct.starts_with("video/")
            || ct.starts_with("audio/")
            || ct.contains("application/octet-stream")
            || ct.contains("application/pdf")
        {
            BodyClass::Binary
        } else if ct.contains("application/json") {
            BodyClass::Json
        } else {
            BodyClass::Text
        }
    }
}

/// Flatten headers to one lower-cased name each; the first value wins.
pub fn flatten_headers(headers: &[(String, String)]) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    for (name, value) in headers {
        flat.entry(name.to_ascii_lowercase())
            .or_insert_with(|| value.clone());
    }
    flat
}

/// Build the relay response for a completed local call.
pub fn encode_response(id: CorrelationId, response: LocalResponse) -> TunnelResponse {
    let headers = flatten_headers(&response.headers);
    let class = BodyClass::from_content_type(headers.get("content-type").map(String::as_str));

    let body = match class {
        BodyClass::Binary => ResponseBody::binary(&response.body),
        BodyClass::Json => match serde_json::from_slice(&response.body) {
            Ok(value) => ResponseBody::Json(value),
            Err(_) => ResponseBody::Text(String::from_utf8_lossy(&response.body).into_owned()),
        },
        BodyClass::Text => ResponseBody::Text(String::from_utf8_lossy(&response.body).into_owned()),
    };

    TunnelResponse {
        id,
        status: response.status,
        headers,
        body,
    }
}
