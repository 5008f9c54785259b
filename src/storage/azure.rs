//! Azure Blob Storage client.
//!
//! Talks to a single container through the Blob REST API using `reqwest`
//! and Shared Key authentication.
//!
//! Uploads:
//!   - a body that fits in one buffer  -> Put Blob
//!   - anything larger                 -> Put Block per buffer (at most
//!     `max_buffers` in flight), then Put Block List to commit
//!
//! Block IDs: `base64(format!("block-{index:06}"))` -- fixed width, as Azure
//! requires every block ID of a blob to have the same length.
//!
//! Downloads stream the Get Blob response body.  If the body breaks off
//! mid-transfer the reader re-issues the request from the last delivered
//! byte (`x-ms-range`), pinned to the original ETag (`If-Match`), up to
//! `max_read_retries` times.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use reqwest::{Method, StatusCode};
use sha2::Sha256;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::backend::{
    BlobDownload, BlobStore, BlobStream, StorageError, UploadOptions, UploadStream,
};
use super::chunk::rechunk;
use crate::config::Config;

/// Azure REST API version used for all requests.
const AZURE_API_VERSION: &str = "2023-11-03";

/// Upper bound on committed blocks per blob.
const MAX_BLOCKS: usize = 50_000;

/// Error codes that mean the blob (or its container) is missing.
const NOT_FOUND_CODES: &[&str] = &["BlobNotFound", "ContainerNotFound", "ResourceNotFound"];

/// Error codes that mean the blob name itself was rejected.
const INVALID_NAME_CODES: &[&str] = &["InvalidUri", "InvalidResourceName", "OutOfRangeInput"];

/// Percent-encoding set for Azure blob names: encode everything except
/// unreserved characters and '/'.
const AZURE_BLOB_ENCODE_SET: percent_encoding::AsciiSet = percent_encoding::NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Client for one Azure Blob container.
///
/// Cheap to clone; clones share the HTTP connection pool.
#[derive(Clone)]
pub struct AzureBlobContainer {
    /// HTTP client for Azure Blob REST API calls.
    client: reqwest::Client,
    /// Azure storage account name.
    account: String,
    /// Decoded account key.
    key: Arc<Vec<u8>>,
    /// The remote Azure container name.
    container: String,
    /// Blob service endpoint without trailing '/'.
    endpoint: String,
    /// Path component of the endpoint ("" for the public cloud,
    /// "/devstoreaccount1" for path-style emulators).
    endpoint_path: String,
    /// Upload buffering.
    options: UploadOptions,
    /// How many times a broken download is resumed.
    max_read_retries: u32,
}

impl AzureBlobContainer {
    /// Create a client from the gateway configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::new(
            &config.azure.account_name,
            &config.azure.account_key,
            &config.azure.container,
            &config.blob_endpoint(),
            UploadOptions {
                buffer_size: config.transfer.upload_buffer_size,
                max_buffers: config.transfer.upload_max_buffers,
            },
            config.transfer.download_max_retries,
            Duration::from_secs(config.transfer.storage_timeout_secs),
        )
    }

    /// Create a client for `container` in `account`.
    ///
    /// `account_key` is the base64 shared key as shown in the Azure portal.
    /// `timeout` bounds connecting and each idle read, not a whole transfer.
    pub fn new(
        account: &str,
        account_key: &str,
        container: &str,
        endpoint: &str,
        options: UploadOptions,
        max_read_retries: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let key = BASE64_STANDARD
            .decode(account_key)
            .map_err(|e| anyhow::anyhow!("Invalid account key (not valid base64): {}", e))?;

        // No whole-request deadline: a download lives as long as its
        // consumer keeps reading.
        let client = reqwest::Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {}", e))?;

        let endpoint = endpoint.trim_end_matches('/').to_string();
        let endpoint_path = endpoint_path(&endpoint)?;

        info!(
            "Azure blob client initialized: account={} container={} endpoint={}",
            account, container, endpoint
        );

        Ok(Self {
            client,
            account: account.to_string(),
            key: Arc::new(key),
            container: container.to_string(),
            endpoint,
            endpoint_path,
            options,
            max_read_retries,
        })
    }

    /// Percent-encode a blob name for use in a URL path.
    fn encode_blob_name(blob_name: &str) -> String {
        percent_encoding::utf8_percent_encode(blob_name, &AZURE_BLOB_ENCODE_SET).to_string()
    }

    /// Build the full URL for a blob operation.
    fn blob_url(&self, blob_name: &str, query: &[(&str, &str)]) -> String {
        let mut url = format!(
            "{}/{}/{}",
            self.endpoint,
            self.container,
            Self::encode_blob_name(blob_name)
        );
        if !query.is_empty() {
            let qs = query
                .iter()
                .map(|(k, v)| {
                    format!(
                        "{}={}",
                        k,
                        percent_encoding::utf8_percent_encode(v, percent_encoding::NON_ALPHANUMERIC)
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            url.push('?');
            url.push_str(&qs);
        }
        url
    }

    /// Shared Key canonicalized resource: account, URL path, then the
    /// query parameters sorted by name.
    fn canonical_resource(&self, blob_name: &str, query: &[(&str, &str)]) -> String {
        let mut resource = format!(
            "/{}{}/{}/{}",
            self.account,
            self.endpoint_path,
            self.container,
            Self::encode_blob_name(blob_name)
        );
        let mut sorted = query.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0));
        for (k, v) in sorted {
            resource.push_str(&format!("\n{}:{}", k.to_lowercase(), v));
        }
        resource
    }

    /// HMAC-SHA256 the string-to-sign and format the Authorization value.
    fn sign(&self, string_to_sign: &str) -> anyhow::Result<String> {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| anyhow::anyhow!("HMAC key error: {}", e))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64_STANDARD.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKey {}:{}", self.account, signature))
    }

    /// Build a signed request.
    ///
    /// `headers` are lowercase names; `x-ms-date` and `x-ms-version` are
    /// added here.
    fn signed_request(
        &self,
        method: Method,
        blob_name: &str,
        query: &[(&str, &str)],
        headers: Vec<(&'static str, String)>,
        body: Option<Bytes>,
    ) -> anyhow::Result<reqwest::RequestBuilder> {
        let mut headers = headers;
        headers.push(("x-ms-date", rfc1123_date()));
        headers.push(("x-ms-version", AZURE_API_VERSION.to_string()));

        let string_to_sign = string_to_sign(
            method.as_str(),
            body.as_ref().map(|b| b.len()),
            &headers,
            &self.canonical_resource(blob_name, query),
        );
        let authorization = self.sign(&string_to_sign)?;

        let mut req = self
            .client
            .request(method, self.blob_url(blob_name, query))
            .header("Authorization", authorization);
        for (name, value) in &headers {
            req = req.header(*name, value.as_str());
        }
        if let Some(body) = body {
            req = req.body(body);
        }
        Ok(req)
    }

    /// Pass successful responses through, classify failures.
    async fn check(
        resp: reqwest::Response,
        context: &str,
        blob_name: &str,
    ) -> Result<reqwest::Response, StorageError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let code = resp
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.text().await.unwrap_or_default();
        Err(classify_error(
            context,
            blob_name,
            status,
            code.as_deref(),
            &body,
        ))
    }

    // -- Azure Blob REST API operations ----------------------------------------

    /// Get Blob, optionally from `offset` onwards and only if the blob
    /// still carries `etag`.
    async fn azure_get(
        &self,
        blob_name: &str,
        offset: u64,
        etag: Option<&str>,
    ) -> Result<reqwest::Response, StorageError> {
        let mut headers = Vec::new();
        if offset > 0 {
            headers.push(("x-ms-range", format!("bytes={}-", offset)));
        }
        if let Some(etag) = etag {
            headers.push(("if-match", etag.to_string()));
        }

        let resp = self
            .signed_request(Method::GET, blob_name, &[], headers, None)?
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure download request failed: {}", e))?;

        Self::check(resp, "download", blob_name).await
    }

    /// Upload a whole blob in one request (Put Blob).
    async fn azure_put_blob(
        &self,
        blob_name: &str,
        content_type: Option<&str>,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let headers = vec![
            ("x-ms-blob-type", "BlockBlob".to_string()),
            (
                "content-type",
                content_type
                    .unwrap_or("application/octet-stream")
                    .to_string(),
            ),
        ];

        let resp = self
            .signed_request(Method::PUT, blob_name, &[], headers, Some(data))?
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure upload request failed: {}", e))?;

        Self::check(resp, "upload", blob_name).await?;
        Ok(())
    }

    /// Stage one block on a blob (Put Block).
    async fn azure_put_block(
        &self,
        blob_name: &str,
        block_id: &str,
        data: Bytes,
    ) -> Result<(), StorageError> {
        let headers = vec![
            ("content-md5", content_md5(&data)),
            ("content-type", "application/octet-stream".to_string()),
        ];
        let query = [("comp", "block"), ("blockid", block_id)];

        let resp = self
            .signed_request(Method::PUT, blob_name, &query, headers, Some(data))?
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure put_block request failed: {}", e))?;

        Self::check(resp, "put_block", blob_name).await?;
        Ok(())
    }

    /// Commit staged blocks, in order, as the blob content (Put Block List).
    async fn azure_put_block_list(
        &self,
        blob_name: &str,
        content_type: Option<&str>,
        block_ids: &[String],
    ) -> Result<(), StorageError> {
        let mut headers = vec![("content-type", "application/xml".to_string())];
        if let Some(content_type) = content_type {
            headers.push(("x-ms-blob-content-type", content_type.to_string()));
        }
        let body = Bytes::from(block_list_xml(block_ids));

        let resp = self
            .signed_request(
                Method::PUT,
                blob_name,
                &[("comp", "blocklist")],
                headers,
                Some(body),
            )?
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Azure put_block_list request failed: {}", e))?;

        Self::check(resp, "put_block_list", blob_name).await?;
        Ok(())
    }

    /// Stream an upload, picking Put Blob or staged blocks by size.
    async fn upload_stream(
        &self,
        blob_name: &str,
        content_type: Option<&str>,
        body: UploadStream<'_>,
    ) -> Result<u64, StorageError> {
        let mut chunks = Box::pin(rechunk(body, self.options.buffer_size));

        let first = match chunks.try_next().await? {
            Some(chunk) => chunk,
            None => {
                self.azure_put_blob(blob_name, content_type, Bytes::new())
                    .await?;
                return Ok(0);
            }
        };
        let second = match chunks.try_next().await? {
            Some(chunk) => chunk,
            None => {
                let size = first.len() as u64;
                self.azure_put_blob(blob_name, content_type, first).await?;
                return Ok(size);
            }
        };

        let mut staged: Vec<(usize, String, u64)> = stream::iter(vec![Ok(first), Ok(second)])
            .chain(chunks)
            .enumerate()
            .map(|(index, chunk)| async move {
                let chunk = chunk?;
                if index >= MAX_BLOCKS {
                    return Err(StorageError::Other(anyhow::anyhow!(
                        "upload of {} exceeds {} blocks",
                        blob_name,
                        MAX_BLOCKS
                    )));
                }
                let id = block_id(index);
                let len = chunk.len() as u64;
                self.azure_put_block(blob_name, &id, chunk).await?;
                Ok((index, id, len))
            })
            .buffer_unordered(self.options.max_buffers)
            .try_collect()
            .await?;

        staged.sort_by_key(|(index, _, _)| *index);
        let size: u64 = staged.iter().map(|(_, _, len)| len).sum();
        let block_ids: Vec<String> = staged.into_iter().map(|(_, id, _)| id).collect();

        debug!(
            "Azure commit: container={} blob={} blocks={} size={}",
            self.container,
            blob_name,
            block_ids.len(),
            size
        );
        self.azure_put_block_list(blob_name, content_type, &block_ids)
            .await?;
        Ok(size)
    }
}

impl BlobStore for AzureBlobContainer {
    fn download(
        &self,
        key: &str,
    ) -> Pin<Box<dyn Future<Output = Result<BlobDownload, StorageError>> + Send + '_>> {
        let key = key.to_string();
        Box::pin(async move {
            if key.is_empty() {
                return Err(StorageError::InvalidName(key));
            }

            debug!("Azure get: container={} blob={}", self.container, key);

            let resp = self.azure_get(&key, 0, None).await?;
            let headers = resp.headers();
            let content_type = header_string(headers, "content-type");
            let content_length =
                header_string(headers, "content-length").and_then(|v| v.parse::<u64>().ok());
            let etag = header_string(headers, "etag");

            let reader = RetryReader {
                container: self.clone(),
                blob_name: key,
                etag,
                total: content_length,
                offset: 0,
                retries_left: self.max_read_retries,
                current: Some(resp.bytes_stream().boxed()),
                finished: false,
            };

            Ok(BlobDownload {
                content_type,
                content_length,
                body: reader.into_stream(),
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
            debug!("Azure put: container={} blob={}", self.container, key);
            self.upload_stream(key, content_type, body).await
        })
    }
}

// -- Resumable download -------------------------------------------------------

/// Download body that resumes after transport errors.
struct RetryReader {
    container: AzureBlobContainer,
    blob_name: String,
    /// ETag of the first response; resumed reads must match it.
    etag: Option<String>,
    /// Blob length, when known.
    total: Option<u64>,
    /// Bytes delivered so far.
    offset: u64,
    retries_left: u32,
    current: Option<BoxStream<'static, reqwest::Result<Bytes>>>,
    finished: bool,
}

impl RetryReader {
    fn into_stream(self) -> BlobStream {
        stream::unfold(self, |mut reader| async move {
            let item = reader.next_chunk().await?;
            Some((item, reader))
        })
        .boxed()
    }

    async fn next_chunk(&mut self) -> Option<anyhow::Result<Bytes>> {
        loop {
            if self.finished {
                return None;
            }

            if let Some(body) = self.current.as_mut() {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        self.offset += chunk.len() as u64;
                        return Some(Ok(chunk));
                    }
                    None => {
                        self.finished = true;
                        return None;
                    }
                    Some(Err(e)) => {
                        self.current = None;
                        if self.total.is_some_and(|total| self.offset >= total) {
                            self.finished = true;
                            return None;
                        }
                        if self.retries_left == 0 {
                            self.finished = true;
                            return Some(Err(anyhow::anyhow!(
                                "Azure download of {} broke at offset {}: {}",
                                self.blob_name,
                                self.offset,
                                e
                            )));
                        }
                        self.retries_left -= 1;
                        warn!(
                            "Azure download of {} broke at offset {} ({}), resuming ({} retries left)",
                            self.blob_name, self.offset, e, self.retries_left
                        );
                    }
                }
            }

            match self
                .container
                .azure_get(&self.blob_name, self.offset, self.etag.as_deref())
                .await
            {
                Ok(resp) => self.current = Some(resp.bytes_stream().boxed()),
                Err(e) => {
                    self.finished = true;
                    return Some(Err(anyhow::anyhow!(
                        "Azure download of {} could not resume at offset {}: {}",
                        self.blob_name,
                        self.offset,
                        e
                    )));
                }
            }
        }
    }
}

// -- Helpers ------------------------------------------------------------------

/// Map a failed Azure response onto a [`StorageError`].
fn classify_error(
    context: &str,
    blob_name: &str,
    status: StatusCode,
    code: Option<&str>,
    body: &str,
) -> StorageError {
    match code {
        Some(code) if NOT_FOUND_CODES.contains(&code) => {
            StorageError::NotFound(blob_name.to_string())
        }
        Some(code) if INVALID_NAME_CODES.contains(&code) => {
            StorageError::InvalidName(blob_name.to_string())
        }
        None if status == StatusCode::NOT_FOUND => StorageError::NotFound(blob_name.to_string()),
        _ => StorageError::Other(anyhow::anyhow!(
            "Azure {}: HTTP {} {} - {}",
            context,
            status,
            code.unwrap_or(""),
            body
        )),
    }
}

/// Build the Shared Key string-to-sign.
///
/// ```text
/// VERB\n
/// Content-Encoding\n
/// Content-Language\n
/// Content-Length\n
/// Content-MD5\n
/// Content-Type\n
/// Date\n
/// If-Modified-Since\n
/// If-Match\n
/// If-None-Match\n
/// If-Unmodified-Since\n
/// Range\n
/// CanonicalizedHeaders\n
/// CanonicalizedResource
/// ```
fn string_to_sign(
    verb: &str,
    content_length: Option<usize>,
    headers: &[(&str, String)],
    canonical_resource: &str,
) -> String {
    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.as_str())
            .unwrap_or("")
    };

    // Content-Length: empty for 0 or if there is no body.
    let content_length = match content_length {
        Some(0) | None => String::new(),
        Some(len) => len.to_string(),
    };

    let mut ms_headers: Vec<(String, &str)> = headers
        .iter()
        .filter(|(k, _)| k.starts_with("x-ms-"))
        .map(|(k, v)| (k.to_lowercase(), v.trim()))
        .collect();
    ms_headers.sort_by(|a, b| a.0.cmp(&b.0));
    let canonicalized_headers = ms_headers
        .iter()
        .map(|(k, v)| format!("{}:{}", k, v))
        .collect::<Vec<_>>()
        .join("\n");

    [
        verb,
        header("content-encoding"),
        header("content-language"),
        content_length.as_str(),
        header("content-md5"),
        header("content-type"),
        header("date"),
        header("if-modified-since"),
        header("if-match"),
        header("if-none-match"),
        header("if-unmodified-since"),
        header("range"),
        canonicalized_headers.as_str(),
        canonical_resource,
    ]
    .join("\n")
}

/// Fixed-width block ID for the block at `index`.
fn block_id(index: usize) -> String {
    BASE64_STANDARD.encode(format!("block-{:06}", index))
}

/// Put Block List request body.
fn block_list_xml(block_ids: &[String]) -> String {
    let mut xml = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<BlockList>\n");
    for id in block_ids {
        xml.push_str(&format!("  <Latest>{}</Latest>\n", id));
    }
    xml.push_str("</BlockList>");
    xml
}

/// Base64 MD5 digest for the `Content-MD5` header.
fn content_md5(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    BASE64_STANDARD.encode(hasher.finalize())
}

/// Path component of the service endpoint, without trailing '/'.
fn endpoint_path(endpoint: &str) -> anyhow::Result<String> {
    let url = reqwest::Url::parse(endpoint)
        .map_err(|e| anyhow::anyhow!("Invalid blob endpoint {}: {}", endpoint, e))?;
    Ok(url.path().trim_end_matches('/').to_string())
}

/// Get the current UTC date in RFC 1123 format for Azure headers.
fn rfc1123_date() -> String {
    httpdate::fmt_http_date(std::time::SystemTime::now())
}

fn header_string(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
