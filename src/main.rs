//! walbuf - durable HTTP ingestion buffer
//!
//! Accepts JSON records over HTTP and appends them to a segmented write-ahead log.

use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use walbuf_server::config::CONFIG_ENV;
use walbuf_server::{run_metrics_server, Config, Metrics, Server, ServerConfig, ServerError};
use walbuf_wal::Wal;

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if WALBUF_CONFIG is set, then env overrides)
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            return Err(e.into());
        }
    };
    if let Ok(path) = std::env::var(CONFIG_ENV) {
        tracing::info!("Loaded config from {}", path);
    }

    tracing::info!("Starting walbuf");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Max request body: {} bytes", config.network.max_body_bytes);
    tracing::info!("  WAL directory: {}", config.storage.wal_dir.display());
    tracing::info!(
        "  Segment size: {} bytes (buffer {} bytes)",
        config.storage.segment_size_bytes,
        config.storage.buffer_size_bytes
    );

    let wal = Arc::new(Wal::open(config.storage.wal_config())?);
    tracing::info!(
        "  Resuming at offset {} in segment {}",
        wal.next_offset(),
        wal.current_segment()
    );

    let mut server_config = ServerConfig::new(config.network.bind_addr)
        .with_max_connections(config.network.max_connections)
        .with_max_body_bytes(config.network.max_body_bytes);

    let metrics = if config.metrics.enabled {
        let metrics = Arc::new(Metrics::new()?);
        server_config = server_config.with_metrics(metrics.clone());
        tracing::info!("  Metrics: enabled on {}", config.metrics.bind_addr);
        Some(metrics)
    } else {
        tracing::info!("  Metrics: disabled");
        None
    };

    let server = Arc::new(Server::new(server_config, wal.clone()));

    // Spawn metrics server
    let metrics_handle = metrics.map(|metrics| {
        let addr = config.metrics.bind_addr;
        let shutdown = server.subscribe_shutdown();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(addr, metrics, shutdown).await {
                tracing::error!("Metrics server error: {}", e);
            }
        })
    });

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown and in-flight requests drain)
    server.run().await?;

    if let Some(handle) = metrics_handle {
        let _ = handle.await;
    }

    // Flush and sync the current segment before exit
    if let Err(e) = wal.close() {
        tracing::error!("Failed to close WAL on shutdown: {}", e);
    }

    tracing::info!("Server stopped");
    Ok(())
}
