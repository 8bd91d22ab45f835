//! Postgres-backed job store.
//!
//! `create_job` runs in a single transaction:
//!
//! 1. look up the idempotency key,
//! 2. insert the job row and its outbox row,
//! 3. insert the key with `ON CONFLICT (idem_key) DO NOTHING`.
//!
//! If step 3 affects no row another transaction won the race for the key; we
//! roll back and return the winner's job id, so racing submitters never see
//! an error.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::{Span, instrument, warn};

use beacon_core::JobId;
use beacon_jobspec::JobSpec;

use super::store::JobStore;
use super::types::{CreateOutcome, JobRecord, JobStatus, NewJob, StuckCriteria, StuckJob, StuckJobStats};
use crate::db::{decode_error, is_unique_violation, map_sqlx_error};
use crate::error::StoreError;

/// Postgres-backed job, idempotency and outbox writer.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id, created = tracing::field::Empty), err)]
    async fn create_job(&self, job: NewJob) -> Result<CreateOutcome, StoreError> {
        let span = Span::current();
        let spec = serde_json::to_value(&job.spec)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(key) = &job.idempotency_key {
            let existing: Option<String> =
                sqlx::query_scalar("SELECT job_id FROM idempotency_keys WHERE idem_key = $1")
                    .bind(key)
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("get_idempotency_key", e))?;
            if let Some(existing) = existing {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                span.record("created", false);
                return Ok(CreateOutcome {
                    job_id: parse_job_id(existing)?,
                    created: false,
                });
            }
        }

        let inserted_job = sqlx::query(
            r#"
            INSERT INTO jobs (id, spec, status)
            VALUES ($1, $2, 'created')
            "#,
        )
        .bind(job.id.as_str())
        .bind(&spec)
        .execute(&mut *tx)
        .await;

        if let Err(e) = inserted_job {
            if !is_unique_violation(&e) {
                return Err(map_sqlx_error("insert_job", e));
            }
            // Same spec submitted concurrently under the same key: the unique
            // violation is only reported once the winner has committed.
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            if let Some(key) = &job.idempotency_key {
                if let Some(winner) = self.find_by_idempotency_key(key).await? {
                    span.record("created", false);
                    return Ok(CreateOutcome {
                        job_id: winner,
                        created: false,
                    });
                }
            }
            return Err(StoreError::Conflict(format!("job {} already exists", job.id)));
        }

        sqlx::query("INSERT INTO outbox (topic, payload) VALUES ($1, $2)")
            .bind(&job.outbox_topic)
            .bind(&job.outbox_payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_outbox", e))?;

        if let Some(key) = &job.idempotency_key {
            let inserted = sqlx::query(
                r#"
                INSERT INTO idempotency_keys (idem_key, job_id)
                VALUES ($1, $2)
                ON CONFLICT (idem_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(job.id.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_idempotency_key", e))?
            .rows_affected();

            if inserted == 0 {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                let winner = self
                    .find_by_idempotency_key(key)
                    .await?
                    .ok_or_else(|| StoreError::Conflict(format!("idempotency key {key} vanished")))?;
                warn!(job_id = %winner, "lost idempotency race; returning existing job");
                span.record("created", false);
                return Ok(CreateOutcome {
                    job_id: winner,
                    created: false,
                });
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        span.record("created", true);
        Ok(CreateOutcome {
            job_id: job.id,
            created: true,
        })
    }

    #[instrument(skip(self), err)]
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<JobId>, StoreError> {
        let job_id: Option<String> =
            sqlx::query_scalar("SELECT job_id FROM idempotency_keys WHERE idem_key = $1")
                .bind(key)
                .fetch_optional(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("find_by_idempotency_key", e))?;
        job_id.map(parse_job_id).transpose()
    }

    #[instrument(skip(self), fields(job_id = %id), err)]
    async fn get(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, spec, status, created_at, started_at, updated_at
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(|row| {
            JobRow::from_row(&row)
                .map_err(|e| decode_error("job", e))
                .and_then(JobRecord::try_from)
        })
        .transpose()
    }

    #[instrument(skip(self), fields(job_id = %id, status = %status), err)]
    async fn set_status(&self, id: &JobId, status: JobStatus) -> Result<(), StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = $2,
                started_at = CASE WHEN $2 = 'running' THEN COALESCE(started_at, NOW()) ELSE started_at END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .bind(status.as_str())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_job_status", e))?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(format!("job {id}")));
        }
        Ok(())
    }

    #[instrument(skip(self, payload), fields(job_id = %id, expected = %expected), err)]
    async fn republish(
        &self,
        id: &JobId,
        expected: JobStatus,
        topic: &str,
        payload: JsonValue,
    ) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'created', started_at = NULL, updated_at = NOW()
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id.as_str())
        .bind(expected.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reset_job", e))?
        .rows_affected();

        if affected == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(false);
        }

        sqlx::query("INSERT INTO outbox (topic, payload) VALUES ($1, $2)")
            .bind(topic)
            .bind(&payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_outbox", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(true)
    }

    #[instrument(skip(self), fields(stuck_count = tracing::field::Empty), err)]
    async fn find_stuck(&self, criteria: &StuckCriteria) -> Result<Vec<StuckJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, created_at, started_at
            FROM jobs
            WHERE (status = 'created' AND created_at < $1)
               OR (status = 'running' AND started_at IS NULL)
               OR (status = 'running' AND started_at < $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(criteria.created_before)
        .bind(criteria.started_before)
        .bind(criteria.limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("find_stuck_jobs", e))?;

        let mut stuck = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| decode_error("job", e))?;
            stuck.push(StuckJob {
                id: parse_job_id(row.try_get("id").map_err(|e| decode_error("job", e))?)?,
                status: parse_status(&status)?,
                created_at: row.try_get("created_at").map_err(|e| decode_error("job", e))?,
                started_at: row.try_get("started_at").map_err(|e| decode_error("job", e))?,
            });
        }
        Span::current().record("stuck_count", stuck.len());
        Ok(stuck)
    }

    #[instrument(skip(self), err)]
    async fn stuck_stats(&self, criteria: &StuckCriteria) -> Result<StuckJobStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'created' AND created_at < $1) AS stuck_created,
                COUNT(*) FILTER (WHERE status = 'running' AND started_at IS NULL) AS running_without_start,
                COUNT(*) FILTER (WHERE status = 'running' AND started_at < $2) AS running_too_long
            FROM jobs
            "#,
        )
        .bind(criteria.created_before)
        .bind(criteria.started_before)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stuck_job_stats", e))?;

        let count = |col: &str| -> Result<u64, StoreError> {
            let n: i64 = row.try_get(col).map_err(|e| decode_error("stuck_stats", e))?;
            Ok(n.max(0) as u64)
        };
        Ok(StuckJobStats {
            stuck_created: count("stuck_created")?,
            running_without_start: count("running_without_start")?,
            running_too_long: count("running_too_long")?,
        })
    }
}

fn parse_job_id(raw: String) -> Result<JobId, StoreError> {
    JobId::parse(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_status(raw: &str) -> Result<JobStatus, StoreError> {
    JobStatus::parse(raw).ok_or_else(|| StoreError::Serialization(format!("unknown job status '{raw}'")))
}

/// Row struct for deserializing jobs.
struct JobRow {
    id: String,
    spec: JsonValue,
    status: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl FromRow<'_, PgRow> for JobRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            spec: row.try_get("spec")?,
            status: row.try_get("status")?,
            created_at: row.try_get("created_at")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let spec: JobSpec = serde_json::from_value(row.spec)?;
        Ok(JobRecord {
            id: parse_job_id(row.id)?,
            spec,
            status: parse_status(&row.status)?,
            created_at: row.created_at,
            started_at: row.started_at,
            updated_at: row.updated_at,
        })
    }
}
