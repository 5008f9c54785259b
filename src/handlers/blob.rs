//! Blob download and upload handlers.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::Multipart;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::{StreamExt, TryStreamExt};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::errors::GatewayError;
use crate::metrics::{record_bytes_downloaded, record_bytes_uploaded};
use crate::paths;
use crate::storage::backend::StorageError;
use crate::AppState;

/// Multipart field carrying the uploaded file.
const FILE_FIELD: &str = "file";

/// Body returned for a successful upload.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    /// Public URL of the stored blob.
    pub url: String,
}

/// `GET /{key}` -- Stream a blob back to the client.
///
/// The stored content type is forwarded when the store reports one; the
/// gateway never picks one itself.
pub async fn get_blob(state: Arc<AppState>, uri: &Uri) -> Result<Response, GatewayError> {
    let key = paths::download_key(uri.path());
    if key.is_empty() {
        return Err(GatewayError::InvalidBlobName);
    }

    let download = state.storage.download(&key).await?;

    let mut response = Body::from_stream(
        download
            .body
            .inspect_ok(|chunk| record_bytes_downloaded(chunk.len() as u64)),
    )
    .into_response();
    *response.status_mut() = StatusCode::OK;

    let headers = response.headers_mut();
    if let Some(content_type) = download
        .content_type
        .as_deref()
        .and_then(|v| HeaderValue::from_str(v).ok())
    {
        headers.insert(CONTENT_TYPE, content_type);
    }
    if let Some(len) = download.content_length {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }

    Ok(response)
}

/// `POST /{path}` -- Store the `file` part of a multipart form under
/// `{prefix}/{path}/{uuid}/{filename}` and return its public URL.
///
/// Parts other than `file`, and a `file` part without a filename, are
/// skipped.  The part body is streamed to storage as it arrives.
pub async fn put_blob(
    state: Arc<AppState>,
    uri: &Uri,
    mut form: Multipart,
) -> Result<Response, GatewayError> {
    while let Some(field) = form.next_field().await.map_err(|e| {
        debug!("Malformed multipart form: {}", e);
        GatewayError::BadForm
    })? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let Some(raw_filename) = field.file_name() else {
            continue;
        };
        let filename = paths::base_filename(raw_filename)
            .ok_or(GatewayError::BadForm)?
            .to_string();
        let content_type = field.content_type().map(str::to_string);

        let request_path = paths::decode_request_path(uri.path());
        let id = Uuid::new_v4().to_string();
        let key = paths::upload_key(&state.config.azure.prefix, &request_path, &id, &filename);
        info!("uploading to blob {}", key);

        let body = field
            .map_err(|e| anyhow::Error::new(e).context("reading upload body"))
            .boxed();
        let size = state
            .storage
            .upload(&key, content_type.as_deref(), body)
            .await
            .map_err(upload_error)?;
        record_bytes_uploaded(size);
        info!("uploaded blob {} ({} bytes)", key, size);

        let url = paths::public_url(&state.config.base_url, &key);
        return Ok(Json(UploadResponse { url }).into_response());
    }

    Err(GatewayError::BadForm)
}

/// Upload failure to response.  A multipart error anywhere in the chain
/// means the form broke off mid-part.
fn upload_error(err: StorageError) -> GatewayError {
    match err {
        StorageError::Other(e) if e.chain().any(|cause| cause.is::<MultipartError>()) => {
            debug!("Upload form broke off mid-part: {:#}", e);
            GatewayError::BadForm
        }
        other => GatewayError::Storage(other.into()),
    }
}
