//! Postgres-backed execution store.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use beacon_core::{ExecutionId, JobId, UnitId};

use super::store::ExecutionStore;
use super::types::{
    AggregateStatus, CrossRegionExecution, ExecutionUnit, RegionResult, ResponseClassification, RetryHistoryEntry,
    UnitStatus,
};
use crate::db::{decode_error, map_sqlx_error};
use crate::error::StoreError;

const UNIT_COLUMNS: &str = r#"
    id, execution_id, job_id, region, model_id, question_index, question, status, provider_id,
    started_at, completed_at, output, output_hash, receipt, ipfs_cid, retry_count, max_retries,
    retry_history, original_error, last_error, is_substantive, is_refusal, is_technical_error
"#;

const EXECUTION_COLUMNS: &str = r#"
    id, job_id, total_regions, success_count, failure_count, min_regions_required,
    min_success_rate, status, started_at, completed_at, duration_ms
"#;

#[derive(Debug, Clone)]
pub struct PostgresExecutionStore {
    pool: Arc<PgPool>,
}

impl PostgresExecutionStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    async fn fetch_units(&self, filter: &str, bind: UnitFilter<'_>) -> Result<Vec<ExecutionUnit>, StoreError> {
        let sql = format!(
            "SELECT {UNIT_COLUMNS} FROM execution_units WHERE {filter} ORDER BY question_index, region, model_id"
        );
        let query = sqlx::query(&sql);
        let query = match bind {
            UnitFilter::Execution(id) => query.bind(id),
            UnitFilter::Job(id) => query.bind(id),
        };
        let rows = query
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("fetch_units", e))?;
        rows.iter().map(decode_unit).collect()
    }
}

enum UnitFilter<'a> {
    Execution(Uuid),
    Job(&'a str),
}

fn i32_of(n: u32, what: &str) -> Result<i32, StoreError> {
    i32::try_from(n).map_err(|_| StoreError::Serialization(format!("{what} out of range: {n}")))
}

fn u32_of(n: i32, what: &str) -> Result<u32, StoreError> {
    u32::try_from(n).map_err(|_| StoreError::Serialization(format!("{what} out of range: {n}")))
}

#[async_trait::async_trait]
impl ExecutionStore for PostgresExecutionStore {
    #[instrument(skip(self, execution), fields(job_id = %execution.job_id), err)]
    async fn create_execution(&self, execution: &CrossRegionExecution) -> Result<CrossRegionExecution, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO cross_region_executions
                (id, job_id, total_regions, success_count, failure_count, min_regions_required,
                 min_success_rate, status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(execution.job_id.as_str())
        .bind(i32_of(execution.total_regions, "total_regions")?)
        .bind(i32_of(execution.success_count, "success_count")?)
        .bind(i32_of(execution.failure_count, "failure_count")?)
        .bind(i32_of(execution.min_regions_required, "min_regions_required")?)
        .bind(execution.min_success_rate)
        .bind(execution.status.as_str())
        .bind(execution.started_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_execution", e))?;

        self.execution_for_job(&execution.job_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("execution for job {}", execution.job_id)))
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn execution_for_job(&self, job_id: &JobId) -> Result<Option<CrossRegionExecution>, StoreError> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM cross_region_executions WHERE job_id = $1");
        let row = sqlx::query(&sql)
            .bind(job_id.as_str())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("execution_for_job", e))?;
        row.as_ref().map(decode_execution).transpose()
    }

    #[instrument(skip(self), fields(execution_id = %id), err)]
    async fn get_execution(&self, id: ExecutionId) -> Result<Option<CrossRegionExecution>, StoreError> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM cross_region_executions WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_execution", e))?;
        row.as_ref().map(decode_execution).transpose()
    }

    #[instrument(skip(self, execution), fields(execution_id = %execution.id, status = %execution.status), err)]
    async fn update_execution(&self, execution: &CrossRegionExecution) -> Result<(), StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE cross_region_executions
            SET success_count = $2, failure_count = $3, status = $4, completed_at = $5, duration_ms = $6
            WHERE id = $1
            "#,
        )
        .bind(execution.id.as_uuid())
        .bind(i32_of(execution.success_count, "success_count")?)
        .bind(i32_of(execution.failure_count, "failure_count")?)
        .bind(execution.status.as_str())
        .bind(execution.completed_at)
        .bind(execution.duration_ms)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_execution", e))?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(format!("execution {}", execution.id)));
        }
        Ok(())
    }

    #[instrument(skip(self, result), fields(execution_id = %result.execution_id, region = %result.region), err)]
    async fn upsert_region_result(&self, result: &RegionResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO region_results
                (execution_id, region, provider_id, status, units_total, units_succeeded,
                 started_at, completed_at, duration_ms, error)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (execution_id, region) DO UPDATE SET
                provider_id = EXCLUDED.provider_id,
                status = EXCLUDED.status,
                units_total = EXCLUDED.units_total,
                units_succeeded = EXCLUDED.units_succeeded,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                duration_ms = EXCLUDED.duration_ms,
                error = EXCLUDED.error
            "#,
        )
        .bind(result.execution_id.as_uuid())
        .bind(&result.region)
        .bind(&result.provider_id)
        .bind(result.status.as_str())
        .bind(i32_of(result.units_total, "units_total")?)
        .bind(i32_of(result.units_succeeded, "units_succeeded")?)
        .bind(result.started_at)
        .bind(result.completed_at)
        .bind(result.duration_ms)
        .bind(&result.error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert_region_result", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(execution_id = %execution_id), err)]
    async fn region_results(&self, execution_id: ExecutionId) -> Result<Vec<RegionResult>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT execution_id, region, provider_id, status, units_total, units_succeeded,
                   started_at, completed_at, duration_ms, error
            FROM region_results
            WHERE execution_id = $1
            ORDER BY region
            "#,
        )
        .bind(execution_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("region_results", e))?;

        rows.iter()
            .map(|row| {
                RegionRow::from_row(row)
                    .map_err(|e| decode_error("region result", e))
                    .and_then(RegionResult::try_from)
            })
            .collect()
    }

    #[instrument(skip(self, unit), fields(unit_id = %unit.id, region = %unit.region, question_index = unit.question_index), err)]
    async fn insert_unit(&self, unit: &ExecutionUnit) -> Result<ExecutionUnit, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO execution_units
                (id, execution_id, job_id, region, model_id, question_index, question, status, max_retries)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (execution_id, region, model_id, question_index) DO NOTHING
            "#,
        )
        .bind(unit.id.as_uuid())
        .bind(unit.execution_id.as_uuid())
        .bind(unit.job_id.as_str())
        .bind(&unit.region)
        .bind(&unit.model_id)
        .bind(i32_of(unit.question_index, "question_index")?)
        .bind(&unit.question)
        .bind(unit.status.as_str())
        .bind(i32_of(unit.max_retries, "max_retries")?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_unit", e))?;

        let sql = format!(
            "SELECT {UNIT_COLUMNS} FROM execution_units \
             WHERE execution_id = $1 AND region = $2 AND model_id = $3 AND question_index = $4"
        );
        let row = sqlx::query(&sql)
            .bind(unit.execution_id.as_uuid())
            .bind(&unit.region)
            .bind(&unit.model_id)
            .bind(i32_of(unit.question_index, "question_index")?)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_unit", e))?;
        decode_unit(&row)
    }

    #[instrument(skip(self), fields(unit_id = %id), err)]
    async fn get_unit(&self, id: UnitId) -> Result<Option<ExecutionUnit>, StoreError> {
        let sql = format!("SELECT {UNIT_COLUMNS} FROM execution_units WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_unit", e))?;
        row.as_ref().map(decode_unit).transpose()
    }

    #[instrument(skip(self), fields(anchor = %anchor), err)]
    async fn find_unit(
        &self,
        anchor: UnitId,
        region: &str,
        question_index: u32,
    ) -> Result<Option<ExecutionUnit>, StoreError> {
        let sql = format!(
            r#"
            SELECT {UNIT_COLUMNS} FROM execution_units
            WHERE (execution_id, model_id) = (SELECT execution_id, model_id FROM execution_units WHERE id = $1)
              AND region = $2 AND question_index = $3
            "#
        );
        let row = sqlx::query(&sql)
            .bind(anchor.as_uuid())
            .bind(region)
            .bind(i32_of(question_index, "question_index")?)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("find_unit", e))?;
        row.as_ref().map(decode_unit).transpose()
    }

    #[instrument(skip(self, unit), fields(unit_id = %unit.id, status = %unit.status), err)]
    async fn update_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError> {
        let history = serde_json::to_value(&unit.retry_history)?;
        let affected = sqlx::query(
            r#"
            UPDATE execution_units
            SET status = $2, provider_id = $3, started_at = $4, completed_at = $5, output = $6,
                output_hash = $7, receipt = $8, ipfs_cid = $9, retry_count = $10, retry_history = $11,
                original_error = $12, last_error = $13, is_substantive = $14, is_refusal = $15,
                is_technical_error = $16
            WHERE id = $1
            "#,
        )
        .bind(unit.id.as_uuid())
        .bind(unit.status.as_str())
        .bind(&unit.provider_id)
        .bind(unit.started_at)
        .bind(unit.completed_at)
        .bind(&unit.output)
        .bind(&unit.output_hash)
        .bind(&unit.receipt)
        .bind(&unit.ipfs_cid)
        .bind(i32_of(unit.retry_count, "retry_count")?)
        .bind(&history)
        .bind(&unit.original_error)
        .bind(&unit.last_error)
        .bind(unit.classification.is_substantive)
        .bind(unit.classification.is_refusal)
        .bind(unit.classification.is_technical_error)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_unit", e))?
        .rows_affected();

        if affected == 0 {
            return Err(StoreError::NotFound(format!("unit {}", unit.id)));
        }
        Ok(())
    }

    #[instrument(skip(self, unit), fields(unit_id = %unit.id), err)]
    async fn try_begin_retry(&self, unit: &ExecutionUnit, expected_retry_count: u32) -> Result<bool, StoreError> {
        let history = serde_json::to_value(&unit.retry_history)?;
        let affected = sqlx::query(
            r#"
            UPDATE execution_units
            SET status = $2, retry_count = $3, retry_history = $4
            WHERE id = $1 AND retry_count = $5 AND status IN ('failed', 'timeout')
            "#,
        )
        .bind(unit.id.as_uuid())
        .bind(unit.status.as_str())
        .bind(i32_of(unit.retry_count, "retry_count")?)
        .bind(&history)
        .bind(i32_of(expected_retry_count, "retry_count")?)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("begin_retry", e))?
        .rows_affected();
        Ok(affected == 1)
    }

    #[instrument(skip(self), fields(execution_id = %execution_id), err)]
    async fn units_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionUnit>, StoreError> {
        self.fetch_units("execution_id = $1", UnitFilter::Execution(*execution_id.as_uuid()))
            .await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn units_for_job(&self, job_id: &JobId) -> Result<Vec<ExecutionUnit>, StoreError> {
        self.fetch_units("job_id = $1", UnitFilter::Job(job_id.as_str())).await
    }
}

fn decode_execution(row: &PgRow) -> Result<CrossRegionExecution, StoreError> {
    ExecutionRow::from_row(row)
        .map_err(|e| decode_error("execution", e))
        .and_then(CrossRegionExecution::try_from)
}

fn decode_unit(row: &PgRow) -> Result<ExecutionUnit, StoreError> {
    UnitRow::from_row(row)
        .map_err(|e| decode_error("execution unit", e))
        .and_then(ExecutionUnit::try_from)
}

fn parse_job_id(raw: String) -> Result<JobId, StoreError> {
    JobId::parse(raw).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn parse_aggregate_status(raw: &str) -> Result<AggregateStatus, StoreError> {
    AggregateStatus::parse(raw).ok_or_else(|| StoreError::Serialization(format!("unknown aggregate status '{raw}'")))
}

struct ExecutionRow {
    id: Uuid,
    job_id: String,
    total_regions: i32,
    success_count: i32,
    failure_count: i32,
    min_regions_required: i32,
    min_success_rate: f64,
    status: String,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
}

impl FromRow<'_, PgRow> for ExecutionRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            job_id: row.try_get("job_id")?,
            total_regions: row.try_get("total_regions")?,
            success_count: row.try_get("success_count")?,
            failure_count: row.try_get("failure_count")?,
            min_regions_required: row.try_get("min_regions_required")?,
            min_success_rate: row.try_get("min_success_rate")?,
            status: row.try_get("status")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }
}

impl TryFrom<ExecutionRow> for CrossRegionExecution {
    type Error = StoreError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(CrossRegionExecution {
            id: ExecutionId::from_uuid(row.id),
            job_id: parse_job_id(row.job_id)?,
            total_regions: u32_of(row.total_regions, "total_regions")?,
            success_count: u32_of(row.success_count, "success_count")?,
            failure_count: u32_of(row.failure_count, "failure_count")?,
            min_regions_required: u32_of(row.min_regions_required, "min_regions_required")?,
            min_success_rate: row.min_success_rate,
            status: parse_aggregate_status(&row.status)?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
        })
    }
}

struct RegionRow {
    execution_id: Uuid,
    region: String,
    provider_id: Option<String>,
    status: String,
    units_total: i32,
    units_succeeded: i32,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<i64>,
    error: Option<String>,
}

impl FromRow<'_, PgRow> for RegionRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            execution_id: row.try_get("execution_id")?,
            region: row.try_get("region")?,
            provider_id: row.try_get("provider_id")?,
            status: row.try_get("status")?,
            units_total: row.try_get("units_total")?,
            units_succeeded: row.try_get("units_succeeded")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
            error: row.try_get("error")?,
        })
    }
}

impl TryFrom<RegionRow> for RegionResult {
    type Error = StoreError;

    fn try_from(row: RegionRow) -> Result<Self, Self::Error> {
        Ok(RegionResult {
            execution_id: ExecutionId::from_uuid(row.execution_id),
            region: row.region,
            provider_id: row.provider_id,
            status: parse_aggregate_status(&row.status)?,
            units_total: u32_of(row.units_total, "units_total")?,
            units_succeeded: u32_of(row.units_succeeded, "units_succeeded")?,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            error: row.error,
        })
    }
}

/// Row struct for deserializing execution units.
struct UnitRow {
    id: Uuid,
    execution_id: Uuid,
    job_id: String,
    region: String,
    model_id: String,
    question_index: i32,
    question: Option<String>,
    status: String,
    provider_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    output: Option<JsonValue>,
    output_hash: Option<String>,
    receipt: Option<JsonValue>,
    ipfs_cid: Option<String>,
    retry_count: i32,
    max_retries: i32,
    retry_history: JsonValue,
    original_error: Option<String>,
    last_error: Option<String>,
    is_substantive: bool,
    is_refusal: bool,
    is_technical_error: bool,
}

impl FromRow<'_, PgRow> for UnitRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            job_id: row.try_get("job_id")?,
            region: row.try_get("region")?,
            model_id: row.try_get("model_id")?,
            question_index: row.try_get("question_index")?,
            question: row.try_get("question")?,
            status: row.try_get("status")?,
            provider_id: row.try_get("provider_id")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            output: row.try_get("output")?,
            output_hash: row.try_get("output_hash")?,
            receipt: row.try_get("receipt")?,
            ipfs_cid: row.try_get("ipfs_cid")?,
            retry_count: row.try_get("retry_count")?,
            max_retries: row.try_get("max_retries")?,
            retry_history: row.try_get("retry_history")?,
            original_error: row.try_get("original_error")?,
            last_error: row.try_get("last_error")?,
            is_substantive: row.try_get("is_substantive")?,
            is_refusal: row.try_get("is_refusal")?,
            is_technical_error: row.try_get("is_technical_error")?,
        })
    }
}

impl TryFrom<UnitRow> for ExecutionUnit {
    type Error = StoreError;

    fn try_from(row: UnitRow) -> Result<Self, Self::Error> {
        let retry_history: Vec<RetryHistoryEntry> = serde_json::from_value(row.retry_history)?;
        Ok(ExecutionUnit {
            id: UnitId::from_uuid(row.id),
            execution_id: ExecutionId::from_uuid(row.execution_id),
            job_id: parse_job_id(row.job_id)?,
            region: row.region,
            model_id: row.model_id,
            question_index: u32_of(row.question_index, "question_index")?,
            question: row.question,
            status: UnitStatus::parse(&row.status)
                .ok_or_else(|| StoreError::Serialization(format!("unknown unit status '{}'", row.status)))?,
            provider_id: row.provider_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            output: row.output,
            output_hash: row.output_hash,
            receipt: row.receipt,
            ipfs_cid: row.ipfs_cid,
            retry_count: u32_of(row.retry_count, "retry_count")?,
            max_retries: u32_of(row.max_retries, "max_retries")?,
            retry_history,
            original_error: row.original_error,
            last_error: row.last_error,
            classification: ResponseClassification {
                is_substantive: row.is_substantive,
                is_refusal: row.is_refusal,
                is_technical_error: row.is_technical_error,
            },
        })
    }
}
