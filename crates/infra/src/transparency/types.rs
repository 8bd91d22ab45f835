//! Transparency log entries.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::merkle::{MerkleProof, sha256_hex};
use crate::error::StoreError;

/// `previous_log_hash` of the genesis entry.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// What a caller logs: one terminal unit result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLogEntry {
    pub execution_id: String,
    pub job_id: String,
    pub region: String,
    pub provider_id: String,
    pub status: String,
    pub output_hash: String,
    pub receipt_hash: String,
    pub ipfs_cid: Option<String>,
}

/// External reference attached to a range of entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Anchor {
    pub tx_hash: String,
    pub block_number: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub log_index: u64,
    pub execution_id: String,
    pub job_id: String,
    pub region: String,
    pub provider_id: String,
    pub status: String,
    pub output_hash: String,
    pub receipt_hash: String,
    pub ipfs_cid: Option<String>,
    pub merkle_leaf_hash: String,
    pub previous_log_hash: String,
    pub logged_at: DateTime<Utc>,
    pub merkle_tree_root: Option<String>,
    pub merkle_proof: Option<MerkleProof>,
    pub anchor_tx_hash: Option<String>,
    pub anchor_block_number: Option<i64>,
    pub anchor_timestamp: Option<DateTime<Utc>>,
}

impl LogEntry {
    /// Seal a new entry onto the chain after `previous` (or at genesis).
    ///
    /// `logged_at` is truncated to microseconds so the hash survives a
    /// round-trip through a TIMESTAMPTZ column.
    pub fn seal(new: NewLogEntry, previous: Option<&LogEntry>, now: DateTime<Utc>) -> Self {
        let (log_index, previous_log_hash) = match previous {
            Some(prev) => (prev.log_index + 1, prev.merkle_leaf_hash.clone()),
            None => (0, GENESIS_HASH.to_string()),
        };
        let mut entry = LogEntry {
            log_index,
            execution_id: new.execution_id,
            job_id: new.job_id,
            region: new.region,
            provider_id: new.provider_id,
            status: new.status,
            output_hash: new.output_hash,
            receipt_hash: new.receipt_hash,
            ipfs_cid: new.ipfs_cid,
            merkle_leaf_hash: String::new(),
            previous_log_hash,
            logged_at: now.trunc_subsecs(6),
            merkle_tree_root: None,
            merkle_proof: None,
            anchor_tx_hash: None,
            anchor_block_number: None,
            anchor_timestamp: None,
        };
        entry.merkle_leaf_hash = entry.compute_leaf_hash();
        entry
    }

    /// Hex SHA-256 over the pipe-joined entry fields.
    ///
    /// Fields are joined without escaping, so none of them may contain `|`;
    /// otherwise two different entries can share a leaf hash.
    pub fn compute_leaf_hash(&self) -> String {
        let preimage = format!(
            "{}|{}|{}|{}|{}|{}|{}|{}|{}|{}|{}",
            self.log_index,
            self.execution_id,
            self.job_id,
            self.region,
            self.provider_id,
            self.status,
            self.output_hash,
            self.receipt_hash,
            self.ipfs_cid.as_deref().unwrap_or_default(),
            self.previous_log_hash,
            self.logged_at.to_rfc3339_opts(SecondsFormat::Nanos, true),
        );
        sha256_hex(preimage.as_bytes())
    }
}

/// Outcome of a merkle batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub start: u64,
    pub end: u64,
    pub size: usize,
    pub root: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IntegrityViolation {
    /// Stored leaf hash differs from the recomputed one.
    LeafHashMismatch { log_index: u64 },
    /// `previous_log_hash` does not match the preceding entry.
    BrokenChain { log_index: u64 },
    /// Index sequence has a hole or a repeat.
    IndexGap { expected: u64, found: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IntegrityReport {
    pub valid: bool,
    pub checked: u64,
    pub violation: Option<IntegrityViolation>,
}

#[derive(Debug, Error)]
pub enum TransparencyError {
    #[error("transparency store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid range {start}..={end}")]
    InvalidRange { start: u64, end: u64 },

    #[error("range {start}..={end} is incomplete: expected {expected} entries, found {found}")]
    IncompleteRange {
        start: u64,
        end: u64,
        expected: u64,
        found: u64,
    },

    #[error("log entry {0} not found")]
    NotFound(u64),

    #[error("append contention: gave up after {0} attempts")]
    Contention(u32),
}
