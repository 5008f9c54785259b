//! Client-visible error types.
//!
//! Every variant maps to a status code and a fixed plain-text message.
//! The enum implements [`axum::response::IntoResponse`] so handlers can
//! simply return `Err(GatewayError::BadForm)`.  Storage failure detail is
//! logged, never sent to the client.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::error;

use crate::metrics::record_storage_error;
use crate::storage::backend::StorageError;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The multipart form is malformed or has no `file` part.
    #[error("bad form file")]
    BadForm,

    /// The blob name was rejected.
    #[error("invalid file uri")]
    InvalidBlobName,

    /// No blob at the requested path.
    #[error("404 page not found")]
    NotFound,

    /// Only GET and POST are served.
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Catch-all for storage backend failures.
    #[error("storage error")]
    Storage(#[from] anyhow::Error),
}

impl GatewayError {
    /// Return the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::BadForm => StatusCode::BAD_REQUEST,
            GatewayError::InvalidBlobName => StatusCode::BAD_REQUEST,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(_) => GatewayError::NotFound,
            StorageError::InvalidName(_) => GatewayError::InvalidBlobName,
            StorageError::Other(e) => GatewayError::Storage(e),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        if let GatewayError::Storage(ref e) = self {
            error!("storage error: {:#}", e);
            record_storage_error();
        }
        (
            self.status_code(),
            [
                ("content-type", "text/plain; charset=utf-8"),
                ("x-content-type-options", "nosniff"),
            ],
            format!("{}\n", self),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(GatewayError::BadForm.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            GatewayError::InvalidBlobName.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            GatewayError::MethodNotAllowed.status_code(),
            StatusCode::METHOD_NOT_ALLOWED
        );
        assert_eq!(
            GatewayError::Storage(anyhow::anyhow!("boom")).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_storage_error_mapping() {
        assert!(matches!(
            GatewayError::from(StorageError::NotFound("k".into())),
            GatewayError::NotFound
        ));
        assert!(matches!(
            GatewayError::from(StorageError::InvalidName("k".into())),
            GatewayError::InvalidBlobName
        ));
        assert!(matches!(
            GatewayError::from(StorageError::Other(anyhow::anyhow!("x"))),
            GatewayError::Storage(_)
        ));
    }

    #[tokio::test]
    async fn test_storage_error_body_is_generic() {
        let err = GatewayError::Storage(anyhow::anyhow!("Azure download: HTTP 403 secret detail"));
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"storage error\n");
    }
}
