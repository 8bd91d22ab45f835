//! Postgres outbox reader.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use super::store::OutboxStore;
use super::types::{OutboxMessage, OutboxStats};
use crate::db::{decode_error, map_sqlx_error};
use crate::error::StoreError;

#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait::async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxMessage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, payload, created_at, published_at, attempts, last_error, dead_lettered_at
            FROM outbox
            WHERE published_at IS NULL AND dead_lettered_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_unpublished", e))?;

        rows.iter()
            .map(|row| {
                OutboxRow::from_row(row)
                    .map(OutboxMessage::from)
                    .map_err(|e| decode_error("outbox message", e))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn mark_published(&self, id: i64) -> Result<(), StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE outbox
            SET published_at = COALESCE(published_at, NOW())
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_published", e))?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(format!("outbox message {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, error), err)]
    async fn record_failure(&self, id: i64, error: &str, dead_letter: bool) -> Result<u32, StoreError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE outbox
            SET attempts = attempts + 1,
                last_error = $2,
                dead_lettered_at = CASE WHEN $3 THEN COALESCE(dead_lettered_at, NOW()) ELSE dead_lettered_at END
            WHERE id = $1
            RETURNING attempts
            "#,
        )
        .bind(id)
        .bind(error)
        .bind(dead_letter)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("record_outbox_failure", e))?;

        attempts
            .map(|n| n.max(0) as u32)
            .ok_or_else(|| StoreError::NotFound(format!("outbox message {id}")))
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE dead_lettered_at IS NULL) AS unpublished,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at) FILTER (WHERE dead_lettered_at IS NULL))), 0)::FLOAT8
                    AS oldest_age,
                COUNT(*) FILTER (WHERE dead_lettered_at IS NOT NULL) AS dead_lettered
            FROM outbox
            WHERE published_at IS NULL
            "#,
        )
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_stats", e))?;

        let unpublished: i64 = row.try_get("unpublished").map_err(|e| decode_error("outbox stats", e))?;
        let oldest_age: f64 = row.try_get("oldest_age").map_err(|e| decode_error("outbox stats", e))?;
        let dead_lettered: i64 = row.try_get("dead_lettered").map_err(|e| decode_error("outbox stats", e))?;
        Ok(OutboxStats {
            unpublished: unpublished.max(0) as u64,
            oldest_unpublished_age_secs: oldest_age.max(0.0),
            dead_lettered: dead_lettered.max(0) as u64,
        })
    }
}

struct OutboxRow {
    id: i64,
    topic: String,
    payload: JsonValue,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    attempts: i32,
    last_error: Option<String>,
    dead_lettered_at: Option<DateTime<Utc>>,
}

impl FromRow<'_, PgRow> for OutboxRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            topic: row.try_get("topic")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            published_at: row.try_get("published_at")?,
            attempts: row.try_get("attempts")?,
            last_error: row.try_get("last_error")?,
            dead_lettered_at: row.try_get("dead_lettered_at")?,
        })
    }
}

impl From<OutboxRow> for OutboxMessage {
    fn from(row: OutboxRow) -> Self {
        OutboxMessage {
            id: row.id,
            topic: row.topic,
            payload: row.payload,
            created_at: row.created_at,
            published_at: row.published_at,
            attempts: row.attempts.max(0) as u32,
            last_error: row.last_error,
            dead_lettered_at: row.dead_lettered_at,
        }
    }
}
