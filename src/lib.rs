//! azupload library -- HTTP upload/download gateway for Azure Blob Storage.
//!
//! `POST /{path}` stores the `file` part of a multipart form as a blob and
//! returns its public URL; `GET /{key}` streams a blob back.  Bodies are
//! streamed in both directions and never buffered whole.

use std::sync::Arc;

pub mod config;
pub mod errors;
pub mod handlers;
pub mod metrics;
pub mod paths;
pub mod server;
pub mod storage;

use crate::config::Config;
use crate::storage::backend::BlobStore;

/// Shared application state passed to all handlers.
pub struct AppState {
    /// Gateway configuration.
    pub config: Config,
    /// Blob store (Azure container or in-memory).
    pub storage: Arc<dyn BlobStore>,
}
