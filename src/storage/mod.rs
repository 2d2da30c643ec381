//! SQLite storage shared by the outbox, inbox, search index and watermarks.

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::StorageConfig;

pub mod helpers;
pub mod schema;

pub use helpers::{begin_immediate, finish, format_timestamp, parse_timestamp};

/// Embedded schema migrations.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("migrations/sqlite");

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid timestamp '{value}': {message}")]
    InvalidTimestamp { value: String, message: String },

    #[error("Invalid UUID: {0}")]
    InvalidUuid(#[from] uuid::Error),

    #[error("Corrupt row: {0}")]
    CorruptRow(String),
}

impl StorageError {
    /// Whether the error means the store itself could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            StorageError::Database(
                sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_)
            )
        )
    }

    /// Whether another connection held a lock the operation needed
    /// (`SQLITE_BUSY` or `SQLITE_LOCKED`, including extended codes).
    pub fn is_busy(&self) -> bool {
        let StorageError::Database(sqlx::Error::Database(db)) = self else {
            return false;
        };
        db.code()
            .and_then(|code| code.parse::<i32>().ok())
            .map(|code| matches!(code & 0xff, SQLITE_BUSY | SQLITE_LOCKED))
            .unwrap_or(false)
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        self.is_unavailable() || self.is_busy()
    }
}

const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

const MEMORY_PATH: &str = ":memory:";

/// Open (and migrate) the SQLite database described by `config`.
///
/// An in-memory database is pinned to a single long-lived connection; each new
/// connection would otherwise see its own empty database.
pub async fn connect(config: &StorageConfig) -> Result<SqlitePool> {
    let busy_timeout = Duration::from_millis(config.busy_timeout_ms);

    let pool = if config.path == MEMORY_PATH {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .busy_timeout(busy_timeout)
            .foreign_keys(true);
        SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        if let Some(parent) = std::path::Path::new(&config.path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(sqlx::Error::Io)?;
            }
        }
        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(busy_timeout)
            .foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await?
    };

    MIGRATOR.run(&pool).await?;
    info!(path = %config.path, "Storage initialized (SQLite)");

    Ok(pool)
}

/// Open a fresh in-memory database. Intended for tests and local tooling.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    connect(&StorageConfig {
        path: MEMORY_PATH.to_string(),
        ..StorageConfig::default()
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_database_is_migrated() {
        let pool = connect_in_memory().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_file_database_survives_reconnect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("relaybox.db");
        let config = StorageConfig {
            path: path.to_string_lossy().to_string(),
            ..StorageConfig::default()
        };

        let pool = connect(&config).await.unwrap();
        sqlx::query("INSERT INTO watermarks (name, observed_at) VALUES ('w', 'x')")
            .execute(&pool)
            .await
            .unwrap();
        pool.close().await;

        let pool = connect(&config).await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM watermarks")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_write_lock_conflict_is_busy() {
        let dir = tempfile::tempdir().unwrap();
        let config = StorageConfig {
            path: dir.path().join("relaybox.db").to_string_lossy().to_string(),
            busy_timeout_ms: 20,
            ..StorageConfig::default()
        };
        let pool = connect(&config).await.unwrap();
        let other = connect(&config).await.unwrap();

        let mut holder = other.acquire().await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *holder).await.unwrap();

        let Err(err) = begin_immediate(&pool).await else {
            panic!("expected the write lock to be held");
        };
        assert!(err.is_busy());
        assert!(err.is_retryable());
        assert!(!err.is_unavailable());

        sqlx::query("ROLLBACK").execute(&mut *holder).await.unwrap();
    }

    #[test]
    fn test_pool_timeout_is_unavailable() {
        assert!(StorageError::Database(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(!StorageError::Database(sqlx::Error::RowNotFound).is_unavailable());
    }
}
