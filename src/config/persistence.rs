//! Persistence configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Backend type for persistence
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Fjall (local LSM-tree storage), used for single-node mode
    #[default]
    Fjall,
    /// Redis-backed remote store, used for cluster mode so session/retained
    /// state stays visible to whichever node takes over a dead node's clients
    Redis,
}

/// Persistence configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Enable persistence
    pub enabled: bool,

    /// Backend type
    pub backend: BackendType,

    /// Data directory path (for the fjall backend)
    pub path: PathBuf,

    /// Connection URL (for the redis backend), e.g. "redis://127.0.0.1:6379"
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Flush interval in milliseconds
    pub flush_interval_ms: u64,

    /// Maximum batch size before forced flush
    pub max_batch_size: usize,
}

impl PersistenceConfig {
    /// Flush interval as a Duration, derived from `flush_interval_ms`
    pub fn flush_interval_duration(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendType::Fjall,
            path: PathBuf::from("./data"),
            redis_url: default_redis_url(),
            flush_interval_ms: 100,
            max_batch_size: 100,
        }
    }
}
