use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

use crate::model::ErrorBody;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<i64> },
    #[error("Upstream timed out after {0:?}")]
    UpstreamTimeout(Duration),
    #[error("Upstream error: {0}")]
    Upstream(UpstreamError),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::InvalidUrl(_) | ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::UpstreamTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing `{ error, details? }` body. `details` is advisory only.
    pub fn body(&self) -> ErrorBody {
        match self {
            ProxyError::InvalidUrl(details) => ErrorBody::new("Invalid URL", Some(details.clone())),
            ProxyError::InvalidRequest(details) => {
                ErrorBody::new("Invalid request", Some(details.clone()))
            }
            ProxyError::RateLimited { retry_after } => ErrorBody::new(
                "Rate limit exceeded",
                retry_after.map(|secs| format!("Try again in {} seconds", secs)),
            ),
            ProxyError::UpstreamTimeout(timeout) => ErrorBody::new(
                "Request timeout",
                Some(format!("Upstream did not respond within {} seconds", timeout.as_secs())),
            ),
            other => ErrorBody::new("Failed to proxy request", Some(other.to_string())),
        }
    }
}

impl From<UpstreamError> for ProxyError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout(timeout) => ProxyError::UpstreamTimeout(timeout),
            other => ProxyError::Upstream(other),
        }
    }
}

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("network failure: {0}")]
    Network(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Connection error: {0}")]
    Connect(String),
    #[error("Store command timed out after {0:?}")]
    Timeout(Duration),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Value at {0} is not an integer")]
    NotAnInteger(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
