//! Blob storage backends.
//!
//! The [`backend::BlobStore`] trait abstracts over where blobs live.
//! [`azure::AzureBlobContainer`] talks to Azure Blob Storage;
//! [`memory::MemoryBlobStore`] keeps everything in process.

pub mod azure;
pub mod backend;
pub mod chunk;
pub mod memory;
