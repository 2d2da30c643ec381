//! Reconciliation watermarks: the newest `updated_at` each consumer has seen.

use chrono::{DateTime, Utc};
use sea_query::{Alias, Expr, OnConflict, Query, SqliteQueryBuilder};
use sea_query_binder::SqlxBinder;
use sqlx::SqlitePool;

use crate::storage::schema::Watermarks;
use crate::storage::{format_timestamp, parse_timestamp, Result};

/// SQLite-backed watermark store, one row per consumer name.
#[derive(Clone)]
pub struct WatermarkStore {
    pool: SqlitePool,
}

impl WatermarkStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, name: &str) -> Result<Option<DateTime<Utc>>> {
        let (sql, values) = Query::select()
            .column(Watermarks::ObservedAt)
            .from(Watermarks::Table)
            .and_where(Expr::col(Watermarks::Name).eq(name))
            .build_sqlx(SqliteQueryBuilder);

        let observed: Option<String> = sqlx::query_scalar_with(&sql, values)
            .fetch_optional(&self.pool)
            .await?;
        observed.as_deref().map(parse_timestamp).transpose()
    }

    /// Move the watermark to `observed_at` if that is later than the stored value.
    ///
    /// Returns whether the stored value changed.
    pub async fn advance(&self, name: &str, observed_at: DateTime<Utc>) -> Result<bool> {
        let (sql, values) = Query::insert()
            .into_table(Watermarks::Table)
            .columns([Watermarks::Name, Watermarks::ObservedAt])
            .values_panic([name.into(), format_timestamp(&observed_at).into()])
            .on_conflict(
                OnConflict::column(Watermarks::Name)
                    .update_column(Watermarks::ObservedAt)
                    .action_and_where(
                        Expr::col((Alias::new("excluded"), Watermarks::ObservedAt))
                            .gt(Expr::col((Watermarks::Table, Watermarks::ObservedAt))),
                    )
                    .to_owned(),
            )
            .build_sqlx(SqliteQueryBuilder);

        let result = sqlx::query_with(&sql, values).execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }
}
