//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via WALBUF_CONFIG)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use walbuf_wal::{WalConfig, DEFAULT_BUFFER_SIZE, DEFAULT_SEGMENT_SIZE};

/// Environment variable naming the YAML config file.
pub const CONFIG_ENV: &str = "WALBUF_CONFIG";

/// Default cap on a request body (16 MiB).
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_ENV) {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Checks values that would otherwise fail later at startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.segment_size_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "storage.segment_size_bytes must be greater than 0".to_string(),
            ));
        }
        if self.storage.buffer_size_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "storage.buffer_size_bytes must be greater than 0".to_string(),
            ));
        }
        if self.network.max_body_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_body_bytes must be greater than 0".to_string(),
            ));
        }
        if self.network.max_connections == 0 {
            return Err(ConfigError::ValidationError(
                "network.max_connections must be greater than 0".to_string(),
            ));
        }
        if self.metrics.enabled && self.metrics.bind_addr == self.network.bind_addr {
            return Err(ConfigError::ValidationError(format!(
                "metrics.bind_addr {} collides with network.bind_addr",
                self.metrics.bind_addr
            )));
        }
        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the ingress listens on.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Largest request body accepted; bigger ones get 413.
    pub max_body_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9090)),
            max_connections: 1000,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("WALBUF_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }

        if let Ok(max) = std::env::var("WALBUF_MAX_CONNECTIONS") {
            if let Ok(n) = max.parse() {
                self.max_connections = n;
            }
        }

        if let Ok(max) = std::env::var("WALBUF_MAX_BODY") {
            if let Ok(bytes) = max.parse() {
                self.max_body_bytes = bytes;
            }
        }
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding the segment files.
    pub wal_dir: PathBuf,
    /// Size at which the current segment is rotated.
    pub segment_size_bytes: u64,
    /// Capacity of the write buffer in front of each segment.
    pub buffer_size_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            wal_dir: PathBuf::from("./wal_data"),
            segment_size_bytes: DEFAULT_SEGMENT_SIZE,
            buffer_size_bytes: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("WALBUF_WAL_DIR") {
            self.wal_dir = PathBuf::from(dir);
        }

        if let Ok(size) = std::env::var("WALBUF_SEGMENT_SIZE") {
            if let Ok(bytes) = size.parse() {
                self.segment_size_bytes = bytes;
            }
        }

        if let Ok(size) = std::env::var("WALBUF_BUFFER_SIZE") {
            if let Ok(bytes) = size.parse() {
                self.buffer_size_bytes = bytes;
            }
        }
    }

    /// Builds the engine configuration.
    pub fn wal_config(&self) -> WalConfig {
        WalConfig::new(&self.wal_dir)
            .with_segment_size(self.segment_size_bytes)
            .with_buffer_size(self.buffer_size_bytes)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 9091)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("WALBUF_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.to_lowercase() == "true";
        }
        if let Ok(addr) = std::env::var("WALBUF_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
