//! Operator-visible log of dropped faults.

use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqlitePool};

use super::FaultRecord;
use crate::event::now;
use crate::storage::schema::FaultLog;
use crate::storage::{format_timestamp, parse_timestamp, Result};

/// One dropped fault.
#[derive(Debug, Clone)]
pub struct FaultLogEntry {
    pub fault_id: String,
    pub event_id: String,
    pub event_type: String,
    pub consumer_group: String,
    pub exception_kind: String,
    pub exception_message: String,
    pub payload: String,
    pub decision: String,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SqliteFaultLog {
    pool: SqlitePool,
}

impl SqliteFaultLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a dropped fault. Recording the same fault twice keeps the first row.
    pub async fn record(&self, fault: &FaultRecord, reason: &str) -> Result<()> {
        let event_type = fault
            .event_type
            .map(|t| t.as_str().to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let (sql, values) = Query::insert()
            .into_table(FaultLog::Table)
            .columns([
                FaultLog::FaultId,
                FaultLog::EventId,
                FaultLog::EventType,
                FaultLog::ConsumerGroup,
                FaultLog::ExceptionKind,
                FaultLog::ExceptionMessage,
                FaultLog::Payload,
                FaultLog::Decision,
                FaultLog::RecordedAt,
            ])
            .values_panic([
                fault.fault_id.to_string().into(),
                fault.event_id.to_string().into(),
                event_type.into(),
                fault.consumer_group.clone().into(),
                fault.exception_kind.as_str().into(),
                fault.exception_message.clone().into(),
                serde_json::to_string(&fault.payload)?.into(),
                format!("dropped: {}", reason).into(),
                format_timestamp(&now()).into(),
            ])
            .on_conflict(OnConflict::column(FaultLog::FaultId).do_nothing().to_owned())
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }

    /// All entries, oldest first.
    pub async fn list(&self) -> Result<Vec<FaultLogEntry>> {
        let (sql, values) = Query::select()
            .columns([
                FaultLog::FaultId,
                FaultLog::EventId,
                FaultLog::EventType,
                FaultLog::ConsumerGroup,
                FaultLog::ExceptionKind,
                FaultLog::ExceptionMessage,
                FaultLog::Payload,
                FaultLog::Decision,
                FaultLog::RecordedAt,
            ])
            .from(FaultLog::Table)
            .order_by(FaultLog::RecordedAt, Order::Asc)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<FaultLogEntry> {
                let recorded_at: String = row.try_get("recorded_at")?;
                Ok(FaultLogEntry {
                    fault_id: row.try_get("fault_id")?,
                    event_id: row.try_get("event_id")?,
                    event_type: row.try_get("event_type")?,
                    consumer_group: row.try_get("consumer_group")?,
                    exception_kind: row.try_get("exception_kind")?,
                    exception_message: row.try_get("exception_message")?,
                    payload: row.try_get("payload")?,
                    decision: row.try_get("decision")?,
                    recorded_at: parse_timestamp(&recorded_at)?,
                })
            })
            .collect()
    }

    pub async fn count(&self) -> Result<u64> {
        let (sql, values) = Query::select()
            .expr(Expr::col(FaultLog::FaultId).count())
            .from(FaultLog::Table)
            .build_sqlx(SqliteQueryBuilder);

        let count: i64 = sqlx::query_scalar_with(&sql, values)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
