//! Abstract blob store trait.
//!
//! Every storage backend must implement [`BlobStore`].  Uploads and
//! downloads are expressed as byte streams so a blob never has to be held
//! in memory in full.

use bytes::Bytes;
use futures::stream::BoxStream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Stream of blob bytes flowing out of a store.
pub type BlobStream = BoxStream<'static, anyhow::Result<Bytes>>;

/// Stream of upload bytes borrowed from the incoming request.
pub type UploadStream<'a> = BoxStream<'a, anyhow::Result<Bytes>>;

/// Failure categories the HTTP layer distinguishes.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The blob or its container does not exist.
    #[error("blob not found: {0}")]
    NotFound(String),

    /// The blob name was rejected by the store.
    #[error("invalid blob name: {0}")]
    InvalidName(String),

    /// Anything else: transport, auth, throttling, server faults.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// An open download.
pub struct BlobDownload {
    /// Content type recorded with the blob, if any.
    pub content_type: Option<String>,
    /// Total length in bytes, if the store reported it.
    pub content_length: Option<u64>,
    /// The blob bytes.
    pub body: BlobStream,
}

/// Chunking parameters for streamed uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadOptions {
    /// Bytes per staged block.
    pub buffer_size: usize,
    /// Maximum blocks in flight at once.
    pub max_buffers: usize,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            buffer_size: 1 << 20,
            max_buffers: 100,
        }
    }
}

/// Async blob storage contract.
pub trait BlobStore: Send + Sync + 'static {
    /// Open `key` for streaming.
    fn download(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<BlobDownload, StorageError>> + Send + '_>>;

    /// Stream `body` into `key`, creating or replacing the blob.
    /// Returns the number of bytes written.
    fn upload<'a>(
        &'a self,
        key: &'a str,
        content_type: Option<&'a str>,
        body: UploadStream<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StorageError>> + Send + 'a>>;
}
