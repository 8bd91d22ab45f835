//! Postgres-backed transparency log.
//!
//! `log_index` is the primary key, so two writers racing for the same index
//! get a unique violation (`Conflict`) and the loser re-reads the head.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use super::merkle::MerkleProof;
use super::store::TransparencyStore;
use super::types::{Anchor, LogEntry};
use crate::db::{decode_error, map_sqlx_error};
use crate::error::StoreError;

const ENTRY_COLUMNS: &str = r#"
    log_index, execution_id, job_id, region, provider_id, status, output_hash, receipt_hash,
    ipfs_cid, merkle_leaf_hash, previous_log_hash, logged_at, merkle_tree_root, merkle_proof,
    anchor_tx_hash, anchor_block_number, anchor_timestamp
"#;

#[derive(Debug, Clone)]
pub struct PostgresTransparencyStore {
    pool: Arc<PgPool>,
}

impl PostgresTransparencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

fn db_index(log_index: u64) -> Result<i64, StoreError> {
    i64::try_from(log_index).map_err(|_| StoreError::Serialization(format!("log index out of range: {log_index}")))
}

fn decode_entries(rows: &[PgRow]) -> Result<Vec<LogEntry>, StoreError> {
    rows.iter().map(decode_entry).collect()
}

fn decode_entry(row: &PgRow) -> Result<LogEntry, StoreError> {
    EntryRow::from_row(row)
        .map_err(|e| decode_error("transparency log", e))
        .and_then(LogEntry::try_from)
}

#[async_trait::async_trait]
impl TransparencyStore for PostgresTransparencyStore {
    #[instrument(skip(self, entry), fields(log_index = entry.log_index, job_id = %entry.job_id), err)]
    async fn append(&self, entry: &LogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO transparency_log
                (log_index, execution_id, job_id, region, provider_id, status, output_hash,
                 receipt_hash, ipfs_cid, merkle_leaf_hash, previous_log_hash, logged_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(db_index(entry.log_index)?)
        .bind(&entry.execution_id)
        .bind(&entry.job_id)
        .bind(&entry.region)
        .bind(&entry.provider_id)
        .bind(&entry.status)
        .bind(&entry.output_hash)
        .bind(&entry.receipt_hash)
        .bind(&entry.ipfs_cid)
        .bind(&entry.merkle_leaf_hash)
        .bind(&entry.previous_log_hash)
        .bind(entry.logged_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("append_log_entry", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn latest(&self) -> Result<Option<LogEntry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM transparency_log ORDER BY log_index DESC LIMIT 1");
        let row = sqlx::query(&sql)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("latest_log_entry", e))?;
        row.as_ref().map(decode_entry).transpose()
    }

    #[instrument(skip(self), err)]
    async fn get(&self, log_index: u64) -> Result<Option<LogEntry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM transparency_log WHERE log_index = $1");
        let row = sqlx::query(&sql)
            .bind(db_index(log_index)?)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_log_entry", e))?;
        row.as_ref().map(decode_entry).transpose()
    }

    #[instrument(skip(self), err)]
    async fn range(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM transparency_log WHERE log_index BETWEEN $1 AND $2 ORDER BY log_index"
        );
        let rows = sqlx::query(&sql)
            .bind(db_index(start)?)
            .bind(db_index(end)?)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("log_range", e))?;
        decode_entries(&rows)
    }

    #[instrument(skip(self), err)]
    async fn by_job(&self, job_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM transparency_log WHERE job_id = $1 ORDER BY log_index");
        let rows = sqlx::query(&sql)
            .bind(job_id)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("log_by_job", e))?;
        decode_entries(&rows)
    }

    #[instrument(skip(self), err)]
    async fn list(&self, limit: usize, offset: u64) -> Result<Vec<LogEntry>, StoreError> {
        let sql = format!("SELECT {ENTRY_COLUMNS} FROM transparency_log ORDER BY log_index LIMIT $1 OFFSET $2");
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(db_index(offset)?)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_log_entries", e))?;
        decode_entries(&rows)
    }

    #[instrument(skip(self), err)]
    async fn size(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM transparency_log")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("log_size", e))?;
        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self, proofs), fields(entries = proofs.len()), err)]
    async fn set_batch(&self, root: &str, proofs: &[(u64, MerkleProof)]) -> Result<(), StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        for (log_index, proof) in proofs {
            let proof = serde_json::to_value(proof)?;
            let affected = sqlx::query(
                "UPDATE transparency_log SET merkle_tree_root = $2, merkle_proof = $3 WHERE log_index = $1",
            )
            .bind(db_index(*log_index)?)
            .bind(root)
            .bind(&proof)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("set_batch", e))?
            .rows_affected();
            if affected == 0 {
                return Err(StoreError::NotFound(format!("log entry {log_index}")));
            }
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }

    #[instrument(skip(self, anchor), fields(tx_hash = %anchor.tx_hash), err)]
    async fn set_anchor(&self, start: u64, end: u64, anchor: &Anchor) -> Result<u64, StoreError> {
        let affected = sqlx::query(
            r#"
            UPDATE transparency_log
            SET anchor_tx_hash = $3, anchor_block_number = $4, anchor_timestamp = $5
            WHERE log_index BETWEEN $1 AND $2
            "#,
        )
        .bind(db_index(start)?)
        .bind(db_index(end)?)
        .bind(&anchor.tx_hash)
        .bind(anchor.block_number)
        .bind(anchor.timestamp)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("set_anchor", e))?
        .rows_affected();
        Ok(affected)
    }
}

/// Row struct for deserializing log entries.
struct EntryRow {
    log_index: i64,
    execution_id: String,
    job_id: String,
    region: String,
    provider_id: String,
    status: String,
    output_hash: String,
    receipt_hash: String,
    ipfs_cid: Option<String>,
    merkle_leaf_hash: String,
    previous_log_hash: String,
    logged_at: DateTime<Utc>,
    merkle_tree_root: Option<String>,
    merkle_proof: Option<JsonValue>,
    anchor_tx_hash: Option<String>,
    anchor_block_number: Option<i64>,
    anchor_timestamp: Option<DateTime<Utc>>,
}

impl FromRow<'_, PgRow> for EntryRow {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            log_index: row.try_get("log_index")?,
            execution_id: row.try_get("execution_id")?,
            job_id: row.try_get("job_id")?,
            region: row.try_get("region")?,
            provider_id: row.try_get("provider_id")?,
            status: row.try_get("status")?,
            output_hash: row.try_get("output_hash")?,
            receipt_hash: row.try_get("receipt_hash")?,
            ipfs_cid: row.try_get("ipfs_cid")?,
            merkle_leaf_hash: row.try_get("merkle_leaf_hash")?,
            previous_log_hash: row.try_get("previous_log_hash")?,
            logged_at: row.try_get("logged_at")?,
            merkle_tree_root: row.try_get("merkle_tree_root")?,
            merkle_proof: row.try_get("merkle_proof")?,
            anchor_tx_hash: row.try_get("anchor_tx_hash")?,
            anchor_block_number: row.try_get("anchor_block_number")?,
            anchor_timestamp: row.try_get("anchor_timestamp")?,
        })
    }
}

impl TryFrom<EntryRow> for LogEntry {
    type Error = StoreError;

    fn try_from(row: EntryRow) -> Result<Self, Self::Error> {
        Ok(LogEntry {
            log_index: u64::try_from(row.log_index)
                .map_err(|_| StoreError::Serialization(format!("negative log index {}", row.log_index)))?,
            execution_id: row.execution_id,
            job_id: row.job_id,
            region: row.region,
            provider_id: row.provider_id,
            status: row.status,
            output_hash: row.output_hash,
            receipt_hash: row.receipt_hash,
            ipfs_cid: row.ipfs_cid,
            merkle_leaf_hash: row.merkle_leaf_hash,
            previous_log_hash: row.previous_log_hash,
            logged_at: row.logged_at,
            merkle_tree_root: row.merkle_tree_root,
            merkle_proof: row.merkle_proof.map(serde_json::from_value).transpose()?,
            anchor_tx_hash: row.anchor_tx_hash,
            anchor_block_number: row.anchor_block_number,
            anchor_timestamp: row.anchor_timestamp,
        })
    }
}
