//! # walbuf-server
//!
//! HTTP ingress for walbuf.
//!
//! This crate provides:
//! - An HTTP/1.1 listener that appends JSON records to the WAL
//! - Health reporting for the underlying log
//! - Layered YAML and environment configuration
//! - Optional Prometheus metrics endpoint

pub mod config;
pub mod error;
pub mod handler;
pub mod http;
pub mod metrics;
pub mod server;

pub use config::{Config, ConfigError, MetricsConfig, NetworkConfig, StorageConfig};
pub use error::ServerError;
pub use handler::IngressHandler;
pub use metrics::{run_metrics_server, Metrics};
pub use server::{Server, ServerConfig, ServerStats};
