//! In-memory blob store.
//!
//! Blobs are held in a `tokio::sync::RwLock<HashMap<...>>`.  Uploads go
//! through the same [`rechunk`](super::chunk::rechunk) path as the Azure
//! client so block accounting can be observed without a network.  Nothing
//! survives a restart.

use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::backend::{BlobDownload, BlobStore, StorageError, UploadOptions, UploadStream};
use super::chunk::rechunk;

/// A stored blob and its content type.
#[derive(Debug, Clone)]
struct StoredBlob {
    data: Bytes,
    content_type: Option<String>,
}

/// In-memory [`BlobStore`].
pub struct MemoryBlobStore {
    blobs: tokio::sync::RwLock<HashMap<String, StoredBlob>>,
    options: UploadOptions,
    /// Total blocks produced across all uploads.
    blocks_staged: AtomicUsize,
    /// Chunk size of each stream handed out by `download`.
    read_chunk: usize,
}

impl MemoryBlobStore {
    pub fn new(options: UploadOptions) -> Self {
        Self {
            blobs: tokio::sync::RwLock::new(HashMap::new()),
            options,
            blocks_staged: AtomicUsize::new(0),
            read_chunk: 64 * 1024,
        }
    }

    /// Number of blobs currently stored.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Stored keys, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.blobs.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Total blocks staged by all uploads so far.
    pub fn blocks_staged(&self) -> usize {
        self.blocks_staged.load(Ordering::Relaxed)
    }

    /// Insert a blob directly, bypassing the upload path.
    pub async fn insert(&self, key: &str, data: impl Into<Bytes>, content_type: Option<&str>) {
        self.blobs.write().await.insert(
            key.to_string(),
            StoredBlob {
                data: data.into(),
                content_type: content_type.map(str::to_string),
            },
        );
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new(UploadOptions::default())
    }
}

impl BlobStore for MemoryBlobStore {
    fn download(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<BlobDownload, StorageError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            if key.is_empty() {
                return Err(StorageError::InvalidName(key));
            }
            let blob = self
                .blobs
                .read()
                .await
                .get(&key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(key.clone()))?;

            let chunk = self.read_chunk;
            let data = blob.data;
            let len = data.len();
            let pieces: Vec<anyhow::Result<Bytes>> = (0..len)
                .step_by(chunk)
                .map(|start| Ok(data.slice(start..(start + chunk).min(len))))
                .collect();

            Ok(BlobDownload {
                content_type: blob.content_type,
                content_length: Some(len as u64),
                body: stream::iter(pieces).boxed(),
            })
        })
    }

    fn upload<'a>(
        &'a self,
        key: &'a str,
        content_type: Option<&'a str>,
        body: UploadStream<'a>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, StorageError>> + Send + 'a>> {
        Box::pin(async move {
            if key.is_empty() {
                return Err(StorageError::InvalidName(key.to_string()));
            }
            let blocks: Vec<Bytes> = rechunk(body, self.options.buffer_size)
                .try_collect()
                .await?;
            self.blocks_staged.fetch_add(blocks.len(), Ordering::Relaxed);

            let mut data = BytesMut::new();
            for block in &blocks {
                data.extend_from_slice(block);
            }
            let size = data.len() as u64;
            self.insert(key, data.freeze(), content_type).await;
            tracing::debug!("Memory upload: key={} size={} blocks={}", key, size, blocks.len());
            Ok(size)
        })
    }
}
