//! Upload-coordinator error types.
//!
//! Every variant carries a stable error code and maps to an HTTP status.
//! The enum implements [`axum::response::IntoResponse`] so handlers can
//! simply return `Err(UploadError::InvalidChunk { .. })`.  Variants are
//! split along the retryable/fatal axis the coordinator relies on:
//! transient store and gateway failures tell the client to resubmit,
//! fatal gateway failures end the session.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Generate a 16-character hex request ID.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Errors surfaced by the upload coordinator and its HTTP surface.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The ephemeral session store is unreachable. Retryable.
    #[error("The upload session store is temporarily unavailable: {message}")]
    StoreUnavailable { message: String },

    /// A transient object-store failure survived the bounded retry loop.
    /// The client may resubmit the same chunk later.
    #[error("The object store did not accept the chunk after retries: {message}")]
    GatewayTransient { message: String },

    /// A non-retryable object-store failure (bad credentials, unknown
    /// upload session). The session is marked failed.
    #[error("The object store rejected the request: {message}")]
    GatewayFatal { message: String },

    /// The chunk is inconsistent with its upload session (index out of
    /// range, or a declared total that disagrees with earlier chunks).
    #[error("{message}")]
    InvalidChunk { message: String },

    /// No file record exists for the given content hash.
    #[error("No upload is known for content hash {content_hash}")]
    FileNotFound { content_hash: String },

    /// A request argument is missing or malformed.
    #[error("{message}")]
    InvalidRequest { message: String },

    /// Catch-all for unexpected internal errors.
    #[error("We encountered an internal error, please try again.")]
    Internal(#[from] anyhow::Error),
}

impl UploadError {
    /// Return the stable error code string used in JSON responses.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::StoreUnavailable { .. } => "StoreUnavailable",
            UploadError::GatewayTransient { .. } => "ObjectStoreTransient",
            UploadError::GatewayFatal { .. } => "ObjectStoreFatal",
            UploadError::InvalidChunk { .. } => "InvalidChunk",
            UploadError::FileNotFound { .. } => "FileNotFound",
            UploadError::InvalidRequest { .. } => "InvalidRequest",
            UploadError::Internal(_) => "InternalError",
        }
    }

    /// Whether the client should retry the same request unchanged.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            UploadError::StoreUnavailable { .. } | UploadError::GatewayTransient { .. }
        )
    }

    /// Return the appropriate HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::StoreUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            UploadError::GatewayTransient { .. } => StatusCode::BAD_GATEWAY,
            UploadError::GatewayFatal { .. } => StatusCode::BAD_GATEWAY,
            UploadError::InvalidChunk { .. } => StatusCode::BAD_REQUEST,
            UploadError::FileNotFound { .. } => StatusCode::NOT_FOUND,
            UploadError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            UploadError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();
        let date = httpdate::fmt_http_date(std::time::SystemTime::now());

        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
                "retryable": self.retryable(),
                "request_id": request_id,
            }
        });

        (
            status,
            [
                ("content-type", "application/json".to_string()),
                ("x-request-id", request_id),
                ("date", date),
                ("server", "ChunkFlow".to_string()),
            ],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_format() {
        let id = generate_request_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, id.to_uppercase());
    }

    #[test]
    fn test_retryable_classification() {
        assert!(UploadError::StoreUnavailable {
            message: "down".into()
        }
        .retryable());
        assert!(UploadError::GatewayTransient {
            message: "throttled".into()
        }
        .retryable());
        assert!(!UploadError::GatewayFatal {
            message: "denied".into()
        }
        .retryable());
        assert!(!UploadError::InvalidChunk {
            message: "bad".into()
        }
        .retryable());
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(
            UploadError::StoreUnavailable {
                message: String::new()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            UploadError::FileNotFound {
                content_hash: "h".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            UploadError::InvalidChunk {
                message: String::new()
            }
            .status_code(),
            StatusCode::BAD_REQUEST
        );
    }
}
