use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use config::ConfigError;
use thiserror::Error;

use crate::api::API_VERSION_HEADER;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Repository not found: {0}")]
    RepositoryNotFound(String),

    #[error("Invalid repository name: {0}")]
    RepositoryInvalid(String),

    #[error("Manifest not found: {0}")]
    ManifestNotFound(String),

    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("blob unknown to registry: {0}")]
    BlobInvalid(String),

    #[error("Upload not found: {0}")]
    UploadNotFound(String),

    #[error("Invalid digest: {0}")]
    DigestInvalid(String),

    #[error("Invalid tag name: {0}")]
    TagInvalid(String),

    #[error("Requested range does not continue the upload at offset {offset}")]
    RangeInvalid { offset: u64 },

    #[error("signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Unauthorized: {message}")]
    Unauthorized {
        message: String,
        challenge: Option<String>,
    },

    #[error("Denied: {0}")]
    Denied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Too many requests")]
    TooManyRequests,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Upstream registry failed: {0}")]
    Upstream(String),

    #[error("Upstream registry did not respond in time")]
    UpstreamTimeout,

    #[error("Storage error: {0}")]
    Storage(#[from] opendal::Error),

    #[error("Json error: {0}")]
    Json(#[from] serde_json::error::Error),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        AppError::Unauthorized {
            message: message.into(),
            challenge: None,
        }
    }

    pub fn unauthorized_with_challenge(message: impl Into<String>, challenge: String) -> Self {
        AppError::Unauthorized {
            message: message.into(),
            challenge: Some(challenge),
        }
    }

    /// Distribution v2 error code for the envelope.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::RepositoryNotFound(_) => "NAME_UNKNOWN",
            AppError::RepositoryInvalid(_) => "NAME_INVALID",
            AppError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            AppError::ManifestInvalid(_) => "MANIFEST_INVALID",
            AppError::BlobNotFound(_) | AppError::BlobInvalid(_) => "BLOB_UNKNOWN",
            AppError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            AppError::DigestInvalid(_) => "DIGEST_INVALID",
            AppError::TagInvalid(_) => "TAG_INVALID",
            AppError::RangeInvalid { .. } => "RANGE_INVALID",
            AppError::SignatureInvalid(_) => "SIGNATURE_INVALID",
            AppError::Unauthorized { .. } => "UNAUTHORIZED",
            AppError::Denied(_) => "DENIED",
            AppError::Conflict(_) => "CONFLICT",
            AppError::Unsupported(_) => "UNSUPPORTED",
            AppError::TooManyRequests => "TOOMANYREQUESTS",
            AppError::BadRequest(_) => "INVALID_REQUEST",
            AppError::Upstream(_) | AppError::UpstreamTimeout => "UNAVAILABLE",
            AppError::Storage(_)
            | AppError::Json(_)
            | AppError::Internal(_)
            | AppError::Config(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::RepositoryNotFound(_)
            | AppError::ManifestNotFound(_)
            | AppError::BlobNotFound(_)
            | AppError::UploadNotFound(_) => StatusCode::NOT_FOUND,
            AppError::RepositoryInvalid(_)
            | AppError::ManifestInvalid(_)
            | AppError::BlobInvalid(_)
            | AppError::DigestInvalid(_)
            | AppError::TagInvalid(_)
            | AppError::SignatureInvalid(_)
            | AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RangeInvalid { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AppError::Denied(_) => StatusCode::FORBIDDEN,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            AppError::TooManyRequests => StatusCode::TOO_MANY_REQUESTS,
            AppError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AppError::UpstreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Storage(_)
            | AppError::Json(_)
            | AppError::Internal(_)
            | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "errors": [{
                "code": self.code(),
                "message": self.to_string(),
                "detail": {},
            }]
        });

        let challenge = match &self {
            AppError::Unauthorized { challenge, .. } => challenge.clone(),
            _ => None,
        };

        let mut response = (self.status(), axum::Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(API_VERSION_HEADER, "registry/2.0".parse().unwrap());
        if let Some(challenge) = challenge {
            // Clients probe the signature extension on the 401 challenge,
            // before they hold a token.
            headers.insert(crate::api::SIGNATURES_HEADER, "1".parse().unwrap());
            if let Ok(value) = challenge.parse() {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }
        response
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<ociclient::DigestError> for AppError {
    fn from(err: ociclient::DigestError) -> Self {
        AppError::DigestInvalid(err.to_string())
    }
}

impl From<ociclient::ClientError> for AppError {
    fn from(err: ociclient::ClientError) -> Self {
        use ociclient::ClientError;
        match err {
            ClientError::NotFound(url) => AppError::ManifestNotFound(url),
            ClientError::RateLimited(_) => AppError::TooManyRequests,
            ClientError::Http(e) if e.is_timeout() || e.is_connect() => AppError::UpstreamTimeout,
            other => AppError::Upstream(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_registry_spec() {
        assert_eq!(
            AppError::ManifestNotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::RangeInvalid { offset: 50 }.status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            AppError::unauthorized("no token").status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AppError::Denied("scope".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(
            AppError::Unsupported("push".into()).status(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            AppError::TooManyRequests.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[test]
    fn codes_match_variants() {
        assert_eq!(AppError::BlobInvalid("d".into()).code(), "BLOB_UNKNOWN");
        assert_eq!(AppError::RangeInvalid { offset: 0 }.code(), "RANGE_INVALID");
        assert_eq!(AppError::TagInvalid("!".into()).code(), "TAG_INVALID");
    }
}
