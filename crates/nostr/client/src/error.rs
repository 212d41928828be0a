//! Client error types.

use thiserror::Error;

/// Client error type.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("callback error: {0}")]
    Callback(String),
}

/// Client result type.
pub type Result<T> = std::result::Result<T, ClientError>;
