//! Helpers shared by the SQLite stores.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqlitePool};
use tracing::debug;

use super::{Result, StorageError};

/// Format a timestamp in the fixed-width form stored in every table.
///
/// Fixed width (nanoseconds, `Z` suffix) keeps lexical order equal to time
/// order, which the outbox and watermark queries rely on. Full precision
/// matters: a truncated watermark sorts before the item it came from.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse a stored timestamp.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StorageError::InvalidTimestamp {
            value: value.to_string(),
            message: e.to_string(),
        })
}

/// Acquire a connection and open a write transaction on it.
///
/// BEGIN IMMEDIATE takes the write lock up front, so a read-then-write
/// transaction waits for other writers instead of failing when its snapshot
/// goes stale. Pair with [`finish`].
pub async fn begin_immediate(pool: &SqlitePool) -> Result<PoolConnection<Sqlite>> {
    let mut conn = pool.acquire().await?;
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
    Ok(conn)
}

/// Commit when `result` is `Ok`, roll back otherwise.
pub async fn finish<T>(conn: &mut PoolConnection<Sqlite>, result: Result<T>) -> Result<T> {
    match result {
        Ok(value) => {
            if let Err(e) = sqlx::query("COMMIT").execute(&mut **conn).await {
                rollback(conn).await;
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            rollback(conn).await;
            Err(e)
        }
    }
}

async fn rollback(conn: &mut PoolConnection<Sqlite>) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut **conn).await {
        debug!(error = %e, "Rollback failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_is_fixed_width() {
        let a = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let b = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 1).unwrap();
        assert_eq!(format_timestamp(&a), "2024-01-01T00:00:00.000000000Z");
        assert_eq!(format_timestamp(&a).len(), format_timestamp(&b).len());
        assert!(format_timestamp(&a) < format_timestamp(&b));
    }

    #[test]
    fn test_round_trip() {
        let ts = crate::event::now();
        assert_eq!(parse_timestamp(&format_timestamp(&ts)).unwrap(), ts);
    }

    #[test]
    fn test_sub_microsecond_precision_is_kept() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ts = base + chrono::Duration::nanoseconds(3_000_667);
        let truncated = base + chrono::Duration::nanoseconds(3_000_000);

        assert_eq!(format_timestamp(&ts), "2024-01-01T00:00:00.003000667Z");
        assert_eq!(parse_timestamp(&format_timestamp(&ts)).unwrap(), ts);
        assert!(format_timestamp(&truncated) < format_timestamp(&ts));
    }

    #[test]
    fn test_invalid_timestamp() {
        let result = parse_timestamp("yesterday");
        assert!(matches!(result, Err(StorageError::InvalidTimestamp { .. })));
    }
}
