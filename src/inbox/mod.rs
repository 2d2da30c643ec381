//! Consumer-side duplicate suppression.
//!
//! Every consumer group keeps a ledger of the event ids it has processed
//! (`inbox` table, keyed by group and event id). Two modes:
//!
//! - Transactional: the consumer's effect lands in the same SQLite database,
//!   so the effect and the ledger row are written in one transaction. A
//!   redelivered event is either fully applied or not at all.
//! - Best effort: the effect leaves the process (a notification hub, an
//!   external API). The ledger is checked before and written after the
//!   effect; a crash between the two can repeat the effect once.

use std::sync::Arc;

use async_trait::async_trait;
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::pool::PoolConnection;
use sqlx::{Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;

use crate::event::{now, Event, EventId};
use crate::pipeline::HandlerError;
use crate::storage::schema::Inbox;
use crate::storage::{format_timestamp, Result};

/// Processed-message ledger.
#[derive(Clone)]
pub struct SqliteInbox {
    pool: SqlitePool,
}

impl SqliteInbox {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Whether `group` has already processed `event_id`.
    pub async fn contains(
        conn: &mut SqliteConnection,
        group: &str,
        event_id: EventId,
    ) -> Result<bool> {
        let (sql, values) = Query::select()
            .expr(Expr::val(1))
            .from(Inbox::Table)
            .and_where(Expr::col(Inbox::ConsumerGroup).eq(group))
            .and_where(Expr::col(Inbox::EventId).eq(event_id.to_string()))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(row.is_some())
    }

    /// Record `event_id` as processed by `group`.
    ///
    /// Returns `false` when the row already existed; that is not an error.
    pub async fn record(
        conn: &mut SqliteConnection,
        group: &str,
        event_id: EventId,
    ) -> Result<bool> {
        let (sql, values) = Query::insert()
            .into_table(Inbox::Table)
            .columns([Inbox::ConsumerGroup, Inbox::EventId, Inbox::ProcessedAt])
            .values_panic([
                group.into(),
                event_id.to_string().into(),
                format_timestamp(&now()).into(),
            ])
            .on_conflict(
                OnConflict::columns([Inbox::ConsumerGroup, Inbox::EventId])
                    .do_nothing()
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        Ok(result.rows_affected() == 1)
    }

    /// Number of events `group` has processed.
    pub async fn count(&self, group: &str) -> Result<u64> {
        let (sql, values) = Query::select()
            .expr(Expr::col(Inbox::EventId).count())
            .from(Inbox::Table)
            .and_where(Expr::col(Inbox::ConsumerGroup).eq(group))
            .build_sqlx(SqliteQueryBuilder);

        let count: i64 = sqlx::query_scalar_with(&sql, values)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn has_processed(&self, group: &str, event_id: EventId) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::contains(&mut conn, group, event_id).await
    }

    /// `record` on a pooled connection.
    pub async fn mark_processed(&self, group: &str, event_id: EventId) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Self::record(&mut conn, group, event_id).await
    }
}

/// Consistency of the inbox relative to the consumer's effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxMode {
    Transactional,
    BestEffort,
}

/// An effect applied inside the inbox transaction.
#[async_trait]
pub trait StoreProjector: Send + Sync {
    async fn project(
        &self,
        conn: &mut SqliteConnection,
        event: &Event,
    ) -> std::result::Result<(), HandlerError>;
}

/// An effect outside the local database.
#[async_trait]
pub trait SideEffect: Send + Sync {
    async fn apply(&self, event: &Event) -> std::result::Result<(), HandlerError>;
}

/// What an idempotent consumer drives.
#[derive(Clone)]
pub enum ConsumerTarget {
    Store(Arc<dyn StoreProjector>),
    External(Arc<dyn SideEffect>),
}

impl ConsumerTarget {
    pub fn mode(&self) -> InboxMode {
        match self {
            ConsumerTarget::Store(_) => InboxMode::Transactional,
            ConsumerTarget::External(_) => InboxMode::BestEffort,
        }
    }
}

/// Result of processing one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Applied,
    Duplicate,
}

/// A consumer group's effect guarded by its inbox.
pub struct IdempotentConsumer {
    group: String,
    pool: SqlitePool,
    target: ConsumerTarget,
}

impl IdempotentConsumer {
    pub fn new(group: impl Into<String>, pool: SqlitePool, target: ConsumerTarget) -> Self {
        Self {
            group: group.into(),
            pool,
            target,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn mode(&self) -> InboxMode {
        self.target.mode()
    }

    /// Apply `event` unless this group has already processed it.
    pub async fn process(&self, event: &Event) -> std::result::Result<ConsumeOutcome, HandlerError> {
        let outcome = match &self.target {
            ConsumerTarget::Store(projector) => self.process_in_store(projector.as_ref(), event).await?,
            ConsumerTarget::External(effect) => self.process_external(effect.as_ref(), event).await?,
        };

        if outcome == ConsumeOutcome::Duplicate {
            debug!(group = %self.group, event_id = %event.event_id, "Duplicate delivery skipped");
        }
        Ok(outcome)
    }

    async fn process_in_store(
        &self,
        projector: &dyn StoreProjector,
        event: &Event,
    ) -> std::result::Result<ConsumeOutcome, HandlerError> {
        // BEGIN IMMEDIATE takes the write lock up front so two deliveries of the
        // same event serialize on the inbox check instead of failing on upgrade.
        let mut conn = self.pool.acquire().await?;
        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        match self.project_once(&mut conn, projector, event).await {
            Ok(ConsumeOutcome::Applied) => {
                if let Err(e) = sqlx::query("COMMIT").execute(&mut *conn).await {
                    rollback(&mut conn).await;
                    return Err(e.into());
                }
                Ok(ConsumeOutcome::Applied)
            }
            Ok(ConsumeOutcome::Duplicate) => {
                rollback(&mut conn).await;
                Ok(ConsumeOutcome::Duplicate)
            }
            Err(e) => {
                rollback(&mut conn).await;
                Err(e)
            }
        }
    }

    async fn project_once(
        &self,
        conn: &mut SqliteConnection,
        projector: &dyn StoreProjector,
        event: &Event,
    ) -> std::result::Result<ConsumeOutcome, HandlerError> {
        if SqliteInbox::contains(conn, &self.group, event.event_id).await? {
            return Ok(ConsumeOutcome::Duplicate);
        }
        projector.project(conn, event).await?;
        if !SqliteInbox::record(conn, &self.group, event.event_id).await? {
            return Ok(ConsumeOutcome::Duplicate);
        }
        Ok(ConsumeOutcome::Applied)
    }

    async fn process_external(
        &self,
        effect: &dyn SideEffect,
        event: &Event,
    ) -> std::result::Result<ConsumeOutcome, HandlerError> {
        {
            let mut conn = self.pool.acquire().await?;
            if SqliteInbox::contains(&mut conn, &self.group, event.event_id).await? {
                return Ok(ConsumeOutcome::Duplicate);
            }
        }

        effect.apply(event).await?;

        let mut conn = self.pool.acquire().await?;
        SqliteInbox::record(&mut conn, &self.group, event.event_id).await?;
        Ok(ConsumeOutcome::Applied)
    }
}

async fn rollback(conn: &mut PoolConnection<Sqlite>) {
    if let Err(e) = sqlx::query("ROLLBACK").execute(&mut **conn).await {
        debug!(error = %e, "Rollback failed");
    }
}
