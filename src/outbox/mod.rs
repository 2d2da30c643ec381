//! Transactional outbox.
//!
//! The owning service stages every outgoing event in the `outbox` table inside
//! the same transaction as its domain write. The relay (`relay`) later drains
//! pending records to the broker and marks them delivered. Records are never
//! deleted, so the table doubles as an audit trail of everything published.
//!
//! Ordering: pending records are read by `created_at`, ties broken by
//! insertion sequence.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::event::{now, Event, EventId, EventType};
use crate::storage::schema::Outbox;
use crate::storage::{format_timestamp, parse_timestamp, Result, StorageError};

pub mod relay;

pub use relay::{OutboxRelay, RelayReport};

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Delivered,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Pending => "pending",
            DeliveryState::Delivered => "delivered",
        }
    }
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryState {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeliveryState::Pending),
            "delivered" => Ok(DeliveryState::Delivered),
            other => Err(StorageError::CorruptRow(format!(
                "unknown outbox state '{}'",
                other
            ))),
        }
    }
}

/// A staged event and its delivery bookkeeping.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub seq: i64,
    pub event_id: EventId,
    pub event_type: EventType,
    pub entity_id: Uuid,
    /// Serialized event, exactly as it will be published.
    pub event_data: String,
    pub state: DeliveryState,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub last_error: Option<String>,
}

impl OutboxRecord {
    /// Decode the staged event.
    pub fn event(&self) -> std::result::Result<Event, serde_json::Error> {
        serde_json::from_str(&self.event_data)
    }

    fn from_row(row: &SqliteRow) -> Result<Self> {
        let event_id: String = row.try_get("event_id")?;
        let event_type: String = row.try_get("event_type")?;
        let entity_id: String = row.try_get("entity_id")?;
        let state: String = row.try_get("state")?;
        let created_at: String = row.try_get("created_at")?;
        let delivered_at: Option<String> = row.try_get("delivered_at")?;
        let attempts: i64 = row.try_get("attempts")?;

        Ok(Self {
            seq: row.try_get("seq")?,
            event_id: event_id.parse()?,
            event_type: event_type
                .parse::<EventType>()
                .map_err(|e| StorageError::CorruptRow(e.to_string()))?,
            entity_id: Uuid::parse_str(&entity_id)?,
            event_data: row.try_get("event_data")?,
            state: state.parse()?,
            created_at: parse_timestamp(&created_at)?,
            delivered_at: delivered_at.as_deref().map(parse_timestamp).transpose()?,
            attempts: attempts.max(0) as u32,
            last_error: row.try_get("last_error")?,
        })
    }
}

const COLUMNS: [Outbox; 10] = [
    Outbox::Seq,
    Outbox::EventId,
    Outbox::EventType,
    Outbox::EntityId,
    Outbox::EventData,
    Outbox::State,
    Outbox::CreatedAt,
    Outbox::DeliveredAt,
    Outbox::Attempts,
    Outbox::LastError,
];

/// SQLite-backed outbox store.
#[derive(Clone)]
pub struct SqliteOutbox {
    pool: SqlitePool,
}

impl SqliteOutbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Stage an event inside the caller's transaction.
    ///
    /// Pass the connection of an open `sqlx::Transaction` (`&mut *tx`); the
    /// record becomes visible to the relay only when that transaction commits.
    /// Staging the same event id twice fails on the unique constraint.
    pub async fn enqueue(conn: &mut SqliteConnection, event: &Event) -> Result<()> {
        let event_data = serde_json::to_string(event)?;

        let (sql, values) = Query::insert()
            .into_table(Outbox::Table)
            .columns([
                Outbox::EventId,
                Outbox::EventType,
                Outbox::EntityId,
                Outbox::EventData,
                Outbox::State,
                Outbox::CreatedAt,
            ])
            .values_panic([
                event.event_id.to_string().into(),
                event.event_type().as_str().into(),
                event.entity_id.to_string().into(),
                event_data.into(),
                DeliveryState::Pending.as_str().into(),
                format_timestamp(&now()).into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&mut *conn).await?;

        debug!(
            event_id = %event.event_id,
            event_type = %event.event_type(),
            "Event staged in outbox"
        );
        Ok(())
    }

    /// Oldest pending records, at most `limit`.
    pub async fn pending_batch(&self, limit: u32) -> Result<Vec<OutboxRecord>> {
        let (sql, values) = Query::select()
            .columns(COLUMNS)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::State).eq(DeliveryState::Pending.as_str()))
            .order_by(Outbox::CreatedAt, Order::Asc)
            .order_by(Outbox::Seq, Order::Asc)
            .limit(limit as u64)
            .build_sqlx(SqliteQueryBuilder);

        let rows = sqlx::query_with(&sql, values).fetch_all(&self.pool).await?;
        rows.iter().map(OutboxRecord::from_row).collect()
    }

    /// Move a record from pending to delivered.
    ///
    /// Returns `false` when the record was no longer pending: another relay
    /// replica got there first.
    pub async fn mark_delivered(&self, event_id: EventId) -> Result<bool> {
        let (sql, values) = Query::update()
            .table(Outbox::Table)
            .value(Outbox::State, DeliveryState::Delivered.as_str())
            .value(Outbox::DeliveredAt, format_timestamp(&now()))
            .and_where(Expr::col(Outbox::EventId).eq(event_id.to_string()))
            .and_where(Expr::col(Outbox::State).eq(DeliveryState::Pending.as_str()))
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Count a failed publish attempt. The record stays pending.
    pub async fn record_failure(&self, event_id: EventId, error: &str) -> Result<()> {
        let (sql, values) = Query::update()
            .table(Outbox::Table)
            .value(Outbox::Attempts, Expr::col(Outbox::Attempts).add(1))
            .value(Outbox::LastError, error)
            .and_where(Expr::col(Outbox::EventId).eq(event_id.to_string()))
            .and_where(Expr::col(Outbox::State).eq(DeliveryState::Pending.as_str()))
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(())
    }

    pub async fn get(&self, event_id: EventId) -> Result<Option<OutboxRecord>> {
        let (sql, values) = Query::select()
            .columns(COLUMNS)
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::EventId).eq(event_id.to_string()))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(OutboxRecord::from_row).transpose()
    }

    pub async fn count_pending(&self) -> Result<u64> {
        let (sql, values) = Query::select()
            .expr(Expr::col(Outbox::Seq).count())
            .from(Outbox::Table)
            .and_where(Expr::col(Outbox::State).eq(DeliveryState::Pending.as_str()))
            .build_sqlx(SqliteQueryBuilder);

        let count: i64 = sqlx::query_scalar_with(&sql, values)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }
}
