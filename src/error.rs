use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    /// A relay message that matches neither the registration acknowledgment
    /// nor the inbound request shape.
    #[error("malformed message: {0}")]
    MalformedMessage(#[source] serde_json::Error),

    #[error("local dispatch failed: {0}")]
    LocalDispatch(#[from] reqwest::Error),

    #[error("invalid HTTP method: {0}")]
    InvalidMethod(String),

    /// Request paths must be origin-form so they cannot change the target host
    #[error("invalid request path: {0}")]
    InvalidPath(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("configuration error: {0}")]
    FatalConfiguration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
