//! azupload -- HTTP upload/download gateway for Azure Blob Storage.
//!
//! Stateless: nothing is kept between requests besides the storage client,
//! so SIGTERM/SIGINT only stop accepting connections and let in-flight
//! transfers drain.

use std::sync::Arc;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use azupload::config::{Config, LogFormat, StorageBackendKind};
use azupload::storage::azure::AzureBlobContainer;
use azupload::storage::backend::{BlobStore, UploadOptions};
use azupload::storage::memory::MemoryBlobStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load()?;

    init_tracing(&config);

    if let Some(port) = config.metrics_port {
        azupload::metrics::init_metrics()?;
        azupload::metrics::describe_metrics();

        let metrics_addr = format!("0.0.0.0:{}", port);
        let listener = tokio::net::TcpListener::bind(&metrics_addr).await?;
        info!("Metrics listening on {}", metrics_addr);
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, azupload::metrics::metrics_router()).await {
                warn!("metrics listener stopped: {}", e);
            }
        });
    }

    let storage: Arc<dyn BlobStore> = match config.storage_backend {
        StorageBackendKind::Azure => {
            let container = AzureBlobContainer::from_config(&config)?;
            info!(
                "Azure blob store initialized: endpoint={} container={} prefix='{}'",
                config.blob_endpoint(),
                config.azure.container,
                config.azure.prefix
            );
            Arc::new(container)
        }
        StorageBackendKind::Memory => {
            warn!("Using in-memory blob store; uploads are lost on exit");
            Arc::new(MemoryBlobStore::new(UploadOptions {
                buffer_size: config.transfer.upload_buffer_size,
                max_buffers: config.transfer.upload_max_buffers,
            }))
        }
    };

    let listen_addr = config.listen_addr();
    let state = Arc::new(azupload::AppState { config, storage });
    let app = azupload::server::app(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    info!("Listening on {}", listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("azupload shut down");

    Ok(())
}

/// Install the global tracing subscriber. `RUST_LOG` wins over `LOG_LEVEL`.
fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.log_level));

    match config.logging.log_format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

/// Wait for SIGTERM or SIGINT (Ctrl+C), then return to trigger graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT, shutting down");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        },
    }
}
