//! Configuration loading and types for azupload.
//!
//! Every setting is read once at startup from the process environment
//! (optionally seeded from a `.env` file) and may be overridden by a
//! command-line flag of the same name.  The resulting [`Config`] is
//! immutable for the lifetime of the process.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use clap::{Args, Parser, ValueEnum};

/// Top-level configuration.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "azupload",
    version,
    about = "HTTP upload/download gateway for Azure Blob Storage"
)]
pub struct Config {
    /// HTTP listener port.
    #[arg(long, env = "HTTP_PORT", default_value_t = 3000)]
    pub http_port: u16,

    /// Public base URL used to build the URLs returned for uploads.
    #[arg(long, env = "BASE_URL", default_value = "")]
    pub base_url: String,

    /// Azure Blob Storage settings.
    #[command(flatten)]
    pub azure: AzureConfig,

    /// Upload/download transfer tuning.
    #[command(flatten)]
    pub transfer: TransferConfig,

    /// Which blob store implementation to run against.
    #[arg(long, env = "STORAGE_BACKEND", value_enum, default_value_t = StorageBackendKind::Azure)]
    pub storage_backend: StorageBackendKind,

    /// Logging settings.
    #[command(flatten)]
    pub logging: LoggingConfig,

    /// Port for the Prometheus `/metrics` and `/health` listener.
    /// Disabled when unset.
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,
}

/// Azure Blob Storage account and container.
#[derive(Args, Debug, Clone)]
pub struct AzureConfig {
    /// Storage account name.
    #[arg(long = "account-name", env = "AZURE_BLOB_ACCOUNT_NAME")]
    pub account_name: String,

    /// Base64 shared key of the storage account.
    #[arg(long = "account-key", env = "AZURE_BLOB_ACCOUNT_KEY", hide_env_values = true)]
    pub account_key: String,

    /// Target container.
    #[arg(long, env = "AZURE_BLOB_CONTAINER")]
    pub container: String,

    /// Key prefix prepended to every uploaded blob.
    #[arg(long, env = "AZURE_BLOB_PREFIX")]
    pub prefix: String,

    /// Blob service endpoint; defaults to `https://<account>.blob.core.windows.net`.
    #[arg(long, env = "AZURE_BLOB_ENDPOINT")]
    pub endpoint: Option<String>,
}

/// Buffering and retry knobs for blob transfers.
#[derive(Args, Debug, Clone)]
pub struct TransferConfig {
    /// Size in bytes of each staged upload block.
    #[arg(long, env = "UPLOAD_BUFFER_SIZE", default_value_t = 1 << 20)]
    pub upload_buffer_size: usize,

    /// Maximum number of blocks in flight per upload.
    #[arg(long, env = "UPLOAD_MAX_BUFFERS", default_value_t = 100)]
    pub upload_max_buffers: usize,

    /// How many times a broken download stream is resumed.
    #[arg(long, env = "DOWNLOAD_MAX_RETRIES", default_value_t = 3)]
    pub download_max_retries: u32,

    /// Connect timeout and idle read timeout, in seconds, for storage calls.
    #[arg(long, env = "STORAGE_TIMEOUT_SECS", default_value_t = 300)]
    pub storage_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Args, Debug, Clone)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set: trace, debug, info, warn, error.
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    Azure,
    Memory,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl Config {
    /// Load `.env` (if any), parse the environment and command line, then
    /// normalize and validate.
    ///
    /// A missing required variable makes clap print a usage error and exit.
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::parse().finish()
    }

    /// Normalize and validate an already parsed configuration.
    pub fn finish(mut self) -> anyhow::Result<Self> {
        self.normalize();
        self.validate()?;
        Ok(self)
    }

    /// Strip separators from the prefix and the trailing one from the base URL.
    pub fn normalize(&mut self) {
        self.azure.prefix = self.azure.prefix.trim_matches('/').to_string();
        self.base_url = self.base_url.trim_end_matches('/').to_string();
        if let Some(endpoint) = self.azure.endpoint.as_mut() {
            *endpoint = endpoint.trim_end_matches('/').to_string();
        }
    }

    /// Reject settings the gateway cannot run with.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.azure.account_name.is_empty() {
            anyhow::bail!("AZURE_BLOB_ACCOUNT_NAME must not be empty");
        }
        if self.azure.container.is_empty() {
            anyhow::bail!("AZURE_BLOB_CONTAINER must not be empty");
        }
        BASE64_STANDARD
            .decode(&self.azure.account_key)
            .map_err(|e| anyhow::anyhow!("Invalid AZURE_BLOB_ACCOUNT_KEY (not valid base64): {}", e))?;
        if self.transfer.upload_buffer_size == 0 {
            anyhow::bail!("UPLOAD_BUFFER_SIZE must be greater than zero");
        }
        if self.transfer.upload_max_buffers == 0 {
            anyhow::bail!("UPLOAD_MAX_BUFFERS must be greater than zero");
        }
        Ok(())
    }

    /// Blob service endpoint, falling back to the public Azure cloud URL.
    pub fn blob_endpoint(&self) -> String {
        self.azure
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}.blob.core.windows.net", self.azure.account_name))
    }

    /// Address the main HTTP listener binds to.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.http_port)
    }
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config::try_parse_from([
        "azupload",
        "--account-name",
        "devaccount",
        "--account-key",
        "a2V5LWJ5dGVz",
        "--container",
        "uploads",
        "--prefix",
        "/files/",
        "--base-url",
        "https://cdn.example.com/",
    ])
    .unwrap()
    .finish()
    .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &[&str]) -> anyhow::Result<Config> {
        let mut args = vec![
            "azupload",
            "--account-name",
            "acct",
            "--account-key",
            "c2VjcmV0",
            "--container",
            "box",
            "--prefix",
            "p",
        ];
        args.extend_from_slice(extra);
        Config::try_parse_from(args)?.finish()
    }

    #[test]
    fn test_prefix_and_base_url_normalized() {
        let config = test_config();
        assert_eq!(config.azure.prefix, "files");
        assert_eq!(config.base_url, "https://cdn.example.com");
    }

    #[test]
    fn test_nested_prefix_keeps_inner_separators() {
        let config = parse(&["--prefix", "//a/b//"]).unwrap();
        assert_eq!(config.azure.prefix, "a/b");
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.transfer.upload_buffer_size, 1 << 20);
        assert_eq!(config.transfer.upload_max_buffers, 100);
        assert_eq!(config.transfer.download_max_retries, 3);
        assert_eq!(config.storage_backend, StorageBackendKind::Azure);
        assert_eq!(config.logging.log_format, LogFormat::Text);
    }

    #[test]
    fn test_default_endpoint_uses_account() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.blob_endpoint(), "https://acct.blob.core.windows.net");
    }

    #[test]
    fn test_endpoint_override_trimmed() {
        let config = parse(&["--endpoint", "http://127.0.0.1:10000/devstoreaccount1/"]).unwrap();
        assert_eq!(
            config.blob_endpoint(),
            "http://127.0.0.1:10000/devstoreaccount1"
        );
    }

    #[test]
    fn test_invalid_account_key_rejected() {
        let err = parse(&["--account-key", "not base64!!"]).unwrap_err();
        assert!(err.to_string().contains("AZURE_BLOB_ACCOUNT_KEY"));
    }

    #[test]
    fn test_zero_buffer_size_rejected() {
        assert!(parse(&["--upload-buffer-size", "0"]).is_err());
        assert!(parse(&["--upload-max-buffers", "0"]).is_err());
    }

    #[test]
    fn test_listen_addr() {
        let config = parse(&["--http-port", "8080"]).unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }
}
