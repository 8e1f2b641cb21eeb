use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method};
use serde_json::Value;
use std::str::FromStr;
use tracing::{debug, error};

use super::encoder::{encode_response, LocalResponse};
use crate::error::{Result, TunnelError};
use crate::protocol::{FileUpload, TunnelRequest, TunnelResponse};

/// Request headers never copied onto the local request. Hop-by-hop headers
/// belong to the relay leg; host and content-length are derived from the
/// rebuilt request.
const SKIPPED_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Replay a relay request against the local service.
///
/// Always yields a response for the relay: local failures become a generic
/// 500.
pub async fn replay(local_port: u16, request: TunnelRequest) -> TunnelResponse {
    let id = request.id.clone();

    match forward_http_request(local_port, &request).await {
        Ok(response) => {
            debug!(
                "{} {} -> {} {}",
                request.method,
                request.path,
                response.status,
                response.body.len()
            );
            encode_response(id, response)
        }
        Err(e) => {
            error!("Proxy error: {}", e);
            TunnelResponse::internal_error(id)
        }
    }
}

/// Forward an HTTP request to the local service
pub async fn forward_http_request(
    local_port: u16,
    request: &TunnelRequest,
) -> Result<LocalResponse> {
    // One client per request; no timeout beyond the local service's own
    let client = Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()?;

    if !request.path.starts_with('/') {
        return Err(TunnelError::InvalidPath(request.path.clone()));
    }
    let url = format!("http://localhost:{}{}", local_port, request.path);

    let method = Method::from_bytes(request.method.as_bytes())
        .map_err(|_| TunnelError::InvalidMethod(request.method.clone()))?;

    let multipart = request.is_multipart_upload();

    let mut header_map = HeaderMap::with_capacity(request.headers.len());
    for (name, value) in &request.headers {
        let name_lower = name.to_ascii_lowercase();

        if SKIPPED_HEADERS.contains(&name_lower.as_str()) {
            continue;
        }

        // The generated boundary supersedes the declared content type
        if multipart && name_lower == "content-type" {
            continue;
        }

        match (HeaderName::from_str(name), HeaderValue::from_str(value)) {
            (Ok(header_name), Ok(header_value)) => {
                header_map.insert(header_name, header_value);
            }
            _ => debug!("Skipping invalid header: {}", name),
        }
    }

    let mut builder = client.request(method, &url).headers(header_map);

    if multipart {
        builder = builder.multipart(build_form(request));
    } else if let Some(body) = &request.body {
        builder = builder.body(serde_json::to_vec(body)?);
    }

    let response = builder.send().await?;

    let status = response.status().as_u16();
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect();
    let body = response.bytes().await?.to_vec();

    Ok(LocalResponse {
        status,
        headers,
        body,
    })
}

/// Rebuild a multipart body: plain fields from the body object first, then
/// one file part per attachment.
fn build_form(request: &TunnelRequest) -> Form {
    let mut form = Form::new();

    if let Some(Value::Object(fields)) = &request.body {
        for (key, value) in fields {
            form = form.text(key.clone(), form_field_value(value));
        }
    }

    for file in &request.files {
        form = form.part(file.fieldname.clone(), file_part(file));
    }

    form
}

fn form_field_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn file_part(file: &FileUpload) -> Part {
    let part = || Part::bytes(file.buffer.clone()).file_name(file.originalname.clone());

    if file.mimetype.is_empty() {
        return part();
    }

    part().mime_str(&file.mimetype).unwrap_or_else(|_| part())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_support::{serve, unused_port};
    use crate::protocol::{CorrelationId, ResponseBody};
    use axum::body::Bytes;
    use axum::extract::Multipart;
    use axum::http::{header, HeaderMap as AxumHeaderMap, Method as AxumMethod, Uri};
    use axum::response::{IntoResponse, Redirect};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    fn request(method: &str, path: &str) -> TunnelRequest {
        TunnelRequest {
            id: CorrelationId::from("req-1"),
            method: method.to_string(),
            path: path.to_string(),
            headers: HashMap::new(),
            body: None,
            files: Vec::new(),
        }
    }

    async fn echo(
        method: AxumMethod,
        uri: Uri,
        headers: AxumHeaderMap,
        body: Bytes,
    ) -> Json<Value> {
        let value_of = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Json(json!({
            "method": method.as_str(),
            "uri": uri.to_string(),
            "content_type": value_of("content-type"),
            "x_trace": value_of("x-trace"),
            "body": String::from_utf8_lossy(&body),
        }))
    }

    async fn upload(mut multipart: Multipart) -> Json<Value> {
        let mut fields = Vec::new();
        let mut files = Vec::new();

        while let Some(field) = multipart.next_field().await.unwrap() {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().map(str::to_string);
            let content_type = field.content_type().map(str::to_string);
            let data = field.bytes().await.unwrap();

            match file_name {
                Some(file_name) => files.push(json!({
                    "name": name,
                    "file_name": file_name,
                    "content_type": content_type,
                    "data": data.to_vec(),
                })),
                None => fields.push(json!({
                    "name": name,
                    "value": String::from_utf8_lossy(&data),
                })),
            }
        }

        Json(json!({ "fields": fields, "files": files }))
    }

    #[tokio::test]
    async fn test_forward_request_not_running() {
        // This should fail since there's no server running
        let port = unused_port().await;
        let result = forward_http_request(port, &request("GET", "/test")).await;
        assert!(matches!(result, Err(TunnelError::LocalDispatch(_))));

        let response = replay(port, request("GET", "/test")).await;
        assert_eq!(response.status, 500);
        assert_eq!(response.id, CorrelationId::from("req-1"));
        assert_eq!(
            response.body,
            ResponseBody::Json(json!({"error": "Internal server error"}))
        );
    }

    #[tokio::test]
    async fn test_invalid_method() {
        let port = unused_port().await;
        let result = forward_http_request(port, &request("NOT A METHOD", "/")).await;
        assert!(matches!(result, Err(TunnelError::InvalidMethod(_))));

        let response = replay(port, request("NOT A METHOD", "/")).await;
        assert_eq!(response.status, 500);
    }

    #[tokio::test]
    async fn test_path_without_leading_slash_rejected() {
        let port = serve(Router::new().fallback(echo)).await;

        for path in ["@evil.example/", "evil.example/steal", ""] {
            let result = forward_http_request(port, &request("GET", path)).await;
            assert!(
                matches!(result, Err(TunnelError::InvalidPath(_))),
                "{:?} should be rejected",
                path
            );

            let response = replay(port, request("GET", path)).await;
            assert_eq!(response.status, 500);
            assert_eq!(
                response.body,
                ResponseBody::Json(json!({"error": "Internal server error"}))
            );
        }
    }

    #[tokio::test]
    async fn test_json_body_and_headers_forwarded() {
        let port = serve(Router::new().fallback(echo)).await;

        let mut req = request("PUT", "/items/7?expand=owner&sort=-created");
        req.headers
            .insert("Content-Type".to_string(), "application/json".to_string());
        req.headers.insert("X-Trace".to_string(), "abc123".to_string());
        req.headers
            .insert("Host".to_string(), "brave-otter.comzy.io".to_string());
        req.body = Some(json!({"name": "widget", "qty": 2}));

        let local = forward_http_request(port, &req).await.unwrap();
        assert_eq!(local.status, 200);

        let echoed: Value = serde_json::from_slice(&local.body).unwrap();
        assert_eq!(echoed["method"], "PUT");
        assert_eq!(echoed["uri"], "/items/7?expand=owner&sort=-created");
        assert_eq!(echoed["content_type"], "application/json");
        assert_eq!(echoed["x_trace"], "abc123");
        let body: Value = serde_json::from_str(echoed["body"].as_str().unwrap()).unwrap();
        assert_eq!(body, json!({"name": "widget", "qty": 2}));
    }

    #[tokio::test]
    async fn test_multipart_rebuilt_with_fields_and_files() {
        let port = serve(Router::new().route("/upload", post(upload))).await;

        let raw = json!({
            "id": 9,
            "method": "POST",
            "path": "/upload",
            "headers": {"content-type": "multipart/form-data; boundary=----relayboundary"},
            "body": {"title": "Holiday", "count": 3},
            "files": [
                {
                    "fieldname": "photo",
                    "originalname": "beach.png",
                    "mimetype": "image/png",
                    "buffer": {"type": "Buffer", "data": [137, 80, 78, 71, 0, 255]}
                },
                {
                    "fieldname": "notes",
                    "originalname": "notes.txt",
                    "mimetype": "text/plain",
                    "buffer": {"data": "c3VubnkgZGF5"}
                }
            ]
        });
        let req: TunnelRequest = serde_json::from_str(&raw.to_string()).unwrap();
        assert!(req.is_multipart_upload());

        let local = forward_http_request(port, &req).await.unwrap();
        assert_eq!(local.status, 200);

        let parsed: Value = serde_json::from_slice(&local.body).unwrap();
        let fields = parsed["fields"].as_array().unwrap();
        let files = parsed["files"].as_array().unwrap();
        assert_eq!(fields.len(), 2);
        assert_eq!(files.len(), 2);

        assert!(fields.contains(&json!({"name": "title", "value": "Holiday"})));
        assert!(fields.contains(&json!({"name": "count", "value": "3"})));

        assert_eq!(files[0]["name"], "photo");
        assert_eq!(files[0]["file_name"], "beach.png");
        assert_eq!(files[0]["content_type"], "image/png");
        assert_eq!(files[0]["data"], json!([137, 80, 78, 71, 0, 255]));
        assert_eq!(files[1]["name"], "notes");
        assert_eq!(files[1]["file_name"], "notes.txt");
        assert_eq!(files[1]["data"], json!(b"sunny day".to_vec()));
    }

    #[tokio::test]
    async fn test_binary_response_replayed() {
        async fn logo() -> impl IntoResponse {
            ([(header::CONTENT_TYPE, "image/png")], vec![0x89u8, 0x50, 0x4e, 0x47])
        }
        let port = serve(Router::new().route("/logo.png", get(logo))).await;

        let response = replay(port, request("GET", "/logo.png")).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.headers["content-type"], "image/png");
        assert_eq!(response.body, ResponseBody::binary(&[0x89, 0x50, 0x4e, 0x47]));
    }

    #[tokio::test]
    async fn test_redirects_are_passed_through() {
        async fn moved() -> Redirect {
            Redirect::to("/new-home")
        }
        let port = serve(Router::new().route("/old", get(moved))).await;

        let response = replay(port, request("GET", "/old")).await;
        assert_eq!(response.status, 303);
        assert_eq!(response.headers["location"], "/new-home");
    }
}
