//! Server error types.

use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAL error: {0}")]
    Wal(#[from] walbuf_wal::WalError),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
