//! The owning service's item table.
//!
//! Every write stages its event in the outbox on the same transaction, so an
//! item change and its event commit or roll back together.

use chrono::{DateTime, Utc};
use sea_query::{Expr, Order, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::event::{now, Event, ItemPatch, ItemPayload, ITEM_SCHEMA_VERSION};
use crate::outbox::SqliteOutbox;
use crate::storage::schema::Items;
use crate::storage::{begin_immediate, finish, format_timestamp, Result, StorageError};

/// Items owned by this service.
#[derive(Clone)]
pub struct ItemRepository {
    pool: SqlitePool,
}

impl ItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new item and stage its Created event.
    ///
    /// Timestamps are assigned here. Inserting an id that already exists
    /// fails and leaves no event behind.
    pub async fn create(&self, mut item: ItemPayload) -> Result<Event> {
        let ts = now();
        item.schema_version = ITEM_SCHEMA_VERSION;
        item.created_at = ts;
        item.updated_at = ts;
        let event = Event::created(item.clone());

        let mut conn = begin_immediate(&self.pool).await?;
        let result: Result<()> = async {
            SqliteOutbox::enqueue(&mut conn, &event).await?;
            Self::insert(&mut conn, &item).await
        }
        .await;
        finish(&mut conn, result).await?;

        info!(item_id = %item.id, event_id = %event.event_id, "Item created");
        Ok(event)
    }

    /// Apply a patch and stage its Updated event.
    ///
    /// Returns `None` when the item does not exist.
    pub async fn update(&self, patch: ItemPatch) -> Result<Option<Event>> {
        let mut conn = begin_immediate(&self.pool).await?;
        let result = Self::update_in(&mut conn, patch).await;
        let event = finish(&mut conn, result).await?;

        if let Some(event) = &event {
            info!(item_id = %event.entity_id, event_id = %event.event_id, "Item updated");
        }
        Ok(event)
    }

    /// Delete an item and stage its Removed event.
    ///
    /// Returns `None` when the item does not exist.
    pub async fn remove(&self, id: Uuid) -> Result<Option<Event>> {
        let mut conn = begin_immediate(&self.pool).await?;
        let result = Self::remove_in(&mut conn, id).await;
        let event = finish(&mut conn, result).await?;

        if let Some(event) = &event {
            info!(item_id = %id, event_id = %event.event_id, "Item removed");
        }
        Ok(event)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<ItemPayload>> {
        let mut conn = self.pool.acquire().await?;
        Self::get_in(&mut conn, id).await
    }

    /// Items changed strictly after `since`, oldest first. `None` returns all.
    pub async fn items_since(&self, since: Option<DateTime<Utc>>) -> Result<Vec<ItemPayload>> {
        let mut query = Query::select();
        query
            .column(Items::Document)
            .from(Items::Table)
            .order_by(Items::UpdatedAt, Order::Asc);
        if let Some(since) = since {
            query.and_where(Expr::col(Items::UpdatedAt).gt(format_timestamp(&since)));
        }
        let (sql, values) = query.build_sqlx(SqliteQueryBuilder);

        let documents: Vec<String> = sqlx::query_scalar_with(&sql, values)
            .fetch_all(&self.pool)
            .await?;
        documents
            .iter()
            .map(|doc| serde_json::from_str(doc).map_err(StorageError::from))
            .collect()
    }

    async fn update_in(conn: &mut SqliteConnection, mut patch: ItemPatch) -> Result<Option<Event>> {
        let Some(mut item) = Self::get_in(conn, patch.id).await? else {
            return Ok(None);
        };

        patch.updated_at = now();
        item.apply_patch(&patch);
        let event = Event::updated(patch);

        let (sql, values) = Query::update()
            .table(Items::Table)
            .value(Items::Document, serde_json::to_string(&item)?)
            .value(Items::UpdatedAt, format_timestamp(&item.updated_at))
            .and_where(Expr::col(Items::Id).eq(item.id.to_string()))
            .build_sqlx(SqliteQueryBuilder);
        sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        SqliteOutbox::enqueue(conn, &event).await?;
        Ok(Some(event))
    }

    async fn remove_in(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<Event>> {
        let (sql, values) = Query::delete()
            .from_table(Items::Table)
            .and_where(Expr::col(Items::Id).eq(id.to_string()))
            .build_sqlx(SqliteQueryBuilder);
        let result = sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }

        let event = Event::removed(id);
        SqliteOutbox::enqueue(conn, &event).await?;
        Ok(Some(event))
    }

    async fn insert(conn: &mut SqliteConnection, item: &ItemPayload) -> Result<()> {
        let (sql, values) = Query::insert()
            .into_table(Items::Table)
            .columns([Items::Id, Items::Document, Items::UpdatedAt])
            .values_panic([
                item.id.to_string().into(),
                serde_json::to_string(item)?.into(),
                format_timestamp(&item.updated_at).into(),
            ])
            .build_sqlx(SqliteQueryBuilder);

        sqlx::query_with(&sql, values).execute(&mut *conn).await?;
        Ok(())
    }

    async fn get_in(conn: &mut SqliteConnection, id: Uuid) -> Result<Option<ItemPayload>> {
        let (sql, values) = Query::select()
            .column(Items::Document)
            .from(Items::Table)
            .and_where(Expr::col(Items::Id).eq(id.to_string()))
            .build_sqlx(SqliteQueryBuilder);

        let row = sqlx::query_with(&sql, values)
            .fetch_optional(&mut *conn)
            .await?;
        match row {
            Some(row) => {
                let document: String = row.try_get("document")?;
                Ok(Some(serde_json::from_str(&document)?))
            }
            None => Ok(None),
        }
    }
}
