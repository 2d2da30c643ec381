//! Storage configuration types.

use serde::Deserialize;

/// SQLite storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file path, or `:memory:` for an in-process database.
    pub path: String,
    /// Maximum pooled connections (file databases only).
    pub max_connections: u32,
    /// How long a writer waits on a locked database, in milliseconds.
    pub busy_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: "data/relaybox.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
        }
    }
}
