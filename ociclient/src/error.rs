use reqwest::StatusCode;
use thiserror::Error;

use crate::digest::DigestError;
use crate::reference::ImageReferenceError;

/// Error type for registry client operations
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Registry returned {status} for {url}")]
    Status { status: StatusCode, url: String },

    #[error("Registry rate limited the request to {0}")]
    RateLimited(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Missing response header: {0}")]
    MissingHeader(&'static str),

    #[error("Malformed response payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Digest(#[from] DigestError),

    #[error(transparent)]
    Reference(#[from] ImageReferenceError),
}

impl ClientError {
    /// Whether the operation is worth retrying with backoff.
    ///
    /// Transient transport errors and 5xx responses retry; 4xx responses are
    /// final, except 408 and 429.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Http(err) => err.is_timeout() || err.is_connect() || err.is_request(),
            ClientError::Status { status, .. } => {
                status.is_server_error()
                    || *status == StatusCode::REQUEST_TIMEOUT
                    || *status == StatusCode::TOO_MANY_REQUESTS
            }
            ClientError::RateLimited(_) => true,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
