//! Search index projection of item events.
//!
//! Events for one item can arrive in any order and more than once, so every
//! write is decided by comparing `updated_at`:
//! - a full document replaces a stored one only when it is newer;
//! - an update for an unknown item leaves a `partial` placeholder that the
//!   later `Created` completes;
//! - a removal leaves a tombstone so a late `Created` cannot resurrect it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_query::{Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::event::{Event, EventBody, ItemPatch, ItemPayload, ITEM_SCHEMA_VERSION};
use crate::inbox::StoreProjector;
use crate::pipeline::HandlerError;
use crate::storage::schema::SearchItems;
use crate::storage::{begin_immediate, finish, format_timestamp, parse_timestamp, Result};

/// A stored search row.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRow {
    pub document: ItemPayload,
    pub updated_at: DateTime<Utc>,
    /// Only the fields of an update are known; the `Created` is still due.
    pub partial: bool,
    pub removed: bool,
}

/// Items as seen by the search service.
#[derive(Clone)]
pub struct SearchIndex {
    pool: SqlitePool,
}

impl SearchIndex {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or replace a full document. Returns whether anything changed.
    pub async fn upsert(&self, conn: &mut SqliteConnection, item: &ItemPayload) -> Result<bool> {
        let document = match Self::row_in(conn, item.id).await? {
            None => item.clone(),
            Some(row) if row.removed => return Ok(false),
            Some(row) if row.partial => {
                // The placeholder carries a newer update; keep its fields.
                let mut merged = item.clone();
                if row.updated_at > item.updated_at {
                    merged.apply_patch(&ItemPatch::from_payload(&row.document));
                }
                merged
            }
            Some(row) if item.updated_at > row.updated_at => item.clone(),
            Some(_) => return Ok(false),
        };

        Self::put(conn, &document, false, false).await?;
        Ok(true)
    }

    /// Apply an update. Unknown items get a partial placeholder.
    pub async fn apply_patch(&self, conn: &mut SqliteConnection, patch: &ItemPatch) -> Result<bool> {
        match Self::row_in(conn, patch.id).await? {
            None => {
                Self::put(conn, &ItemPayload::from_patch(patch), true, false).await?;
                Ok(true)
            }
            Some(row) if row.removed || patch.updated_at <= row.updated_at => Ok(false),
            Some(mut row) => {
                row.document.apply_patch(patch);
                Self::put(conn, &row.document, row.partial, false).await?;
                Ok(true)
            }
        }
    }

    /// Tombstone an item. Returns `false` if it was already removed.
    pub async fn remove(
        &self,
        conn: &mut SqliteConnection,
        id: Uuid,
        removed_at: DateTime<Utc>,
    ) -> Result<bool> {
        let document = match Self::row_in(conn, id).await? {
            Some(row) if row.removed => return Ok(false),
            Some(row) => row.document,
            None => ItemPayload {
                schema_version: ITEM_SCHEMA_VERSION,
                id,
                updated_at: removed_at,
                ..Default::default()
            },
        };

        Self::put(conn, &document, false, true).await?;
        Ok(true)
    }

    /// Upsert a batch of full documents in one transaction.
    ///
    /// Returns the number of rows that changed. Replaying the same batch
    /// changes nothing.
    pub async fn upsert_many(&self, items: &[ItemPayload]) -> Result<usize> {
        let mut conn = begin_immediate(&self.pool).await?;
        let result: Result<usize> = async {
            let mut changed = 0;
            for item in items {
                if self.upsert(&mut conn, item).await? {
                    changed += 1;
                }
            }
            Ok(changed)
        }
        .await;
        finish(&mut conn, result).await
    }

    /// A live, complete document.
    pub async fn get(&self, id: Uuid) -> Result<Option<ItemPayload>> {
        Ok(self
            .row(id)
            .await?
            .filter(|row| !row.removed && !row.partial)
            .map(|row| row.document))
    }

    /// The stored row, including placeholders and tombstones.
    pub async fn row(&self, id: Uuid) -> Result<Option<SearchRow>> {
        let mut conn = self.pool.acquire().await?;
        Self::row_in(&mut conn, id).await
    }

    /// Number of live, complete documents.
    pub async fn count(&self) -> Result<u64> {
        let (sql, values) = Query::select()
            .expr(Expr::col(SearchItems::Id).count())
            .from(SearchItems::Table)
            .and_where(Expr::col(SearchItems::Removed).eq(false))
            .and_where(Expr::col(SearchItems::Partial).eq(false))
            .build_sqlx(SqliteQueryBuilder);

        let count: i64 = sqlx::query_scalar_with(&sql, values)
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Newest `updated_at` among stored rows.
    pub async fn latest_update(&self) -> Result<Option<DateTime<Utc>>> {
        let (sql, values) = Query::select()
            .expr(Expr::col(SearchItems::UpdatedAt).max())
            .from(SearchItems::Table)
            .build_sqlx(SqliteQueryBuilder);

        let latest: Option<String> = sqlx::query_scalar_with(&sql, values)
            .fetch_one(&self.pool)
            .await?;
        latest.as_deref().map(parse_timestamp).transpose()
    }

    async fn row_in(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<SearchRow>> {
        let (sql, values) = Query::select()
            .columns([
                SearchItems::Document,
                SearchItems::UpdatedAt,
                SearchItems::Partial,
                SearchItems::Removed,
            ])
            .from(SearchItems::Table)
            .and_where(Expr::col(SearchItems::Id).eq(id.to_string()))
            .build_sqlx(SqliteQueryBuilder);

        let Some(row) = sqlx::query_with(&sql, values)
            .fetch_optional(&mut *conn)
            .await?
        else {
            return Ok(None);
        };

        let document: String = row.try_get("document")?;
        let updated_at: String = row.try_get("updated_at")?;
        Ok(Some(SearchRow {
            document: serde_json::from_str(&document)?,
            updated_at: parse_timestamp(&updated_at)?,
            partial: row.try_get("partial")?,
            removed: row.try_get("removed")?,
        }))
    }

    async fn put(
        conn: &mut SqliteConnection,
        document: &ItemPayload,
        partial: bool,
        removed: bool,
    ) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(SearchItems::Table)
            .columns([
                SearchItems::Id,
                SearchItems::Document,
                SearchItems::UpdatedAt,
                SearchItems::Partial,
                SearchItems::Removed,
            ])
            .values_panic([
                document.id.to_string().into(),
                serde_json::to_string(document)?.into(),
                format_timestamp(&document.updated_at).into(),
                partial.into(),
                removed.into(),
            ])
            .on_conflict(
                OnConflict::column(SearchItems::Id)
                    .update_columns([
                        SearchItems::Document,
                        SearchItems::UpdatedAt,
                        SearchItems::Partial,
                        SearchItems::Removed,
                    ])
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        Ok(())
    }
}

/// Projects item events into the search index.
pub struct SearchProjector {
    index: SearchIndex,
    rejected_model: Option<String>,
}

impl SearchProjector {
    pub fn new(index: SearchIndex) -> Self {
        Self {
            index,
            rejected_model: None,
        }
    }

    /// Reject `Created` events carrying this model as a validation failure.
    pub fn rejecting_model(mut self, model: impl Into<String>) -> Self {
        self.rejected_model = Some(model.into());
        self
    }

    fn validate(&self, item: &ItemPayload) -> std::result::Result<(), HandlerError> {
        if item.schema_version > ITEM_SCHEMA_VERSION {
            return Err(HandlerError::contract(format!(
                "unsupported item schema version {}",
                item.schema_version
            )));
        }
        if self.rejected_model.as_deref() == Some(item.model.as_str()) {
            return Err(HandlerError::validation(format!(
                "model '{}' is not accepted by the search index",
                item.model
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl StoreProjector for SearchProjector {
    async fn project(
        &self,
        conn: &mut SqliteConnection,
        event: &Event,
    ) -> std::result::Result<(), HandlerError> {
        let changed = match &event.body {
            EventBody::Created(item) => {
                self.validate(item)?;
                self.index.upsert(conn, item).await?
            }
            EventBody::Updated(patch) => self.index.apply_patch(conn, patch).await?,
            EventBody::Removed { id } => self.index.remove(conn, *id, event.occurred_at).await?,
        };

        debug!(
            event_id = %event.event_id,
            entity_id = %event.entity_id,
            event_type = %event.event_type(),
            changed,
            "Search index projected"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests;
