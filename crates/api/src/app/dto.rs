//! Request/response bodies that are not plain domain types.

use serde::{Deserialize, Serialize};

use beacon_core::JobId;
use beacon_infra::orchestrator::{CrossRegionExecution, RegionResult};
use beacon_infra::transparency::{LogEntry, MerkleProof};

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: JobId,
    pub created: bool,
}

#[derive(Debug, Deserialize)]
pub struct RetryQuestionRequest {
    pub region: String,
    pub question_index: u32,
}

#[derive(Debug, Serialize)]
pub struct CrossRegionSummary {
    pub execution: CrossRegionExecution,
    pub regions: Vec<RegionResult>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EntriesQuery {
    pub job_id: Option<String>,
    pub start: Option<u64>,
    pub end: Option<u64>,
    #[serde(default)]
    pub proof: bool,
    pub limit: Option<usize>,
    pub offset: Option<u64>,
}

/// A log entry, optionally with its inclusion proof and a verification
/// result against the proof's root.
#[derive(Debug, Serialize)]
pub struct EntryView {
    #[serde(flatten)]
    pub entry: LogEntry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof_valid: Option<bool>,
}

impl EntryView {
    pub fn new(mut entry: LogEntry, with_proof: bool) -> Self {
        let proof_valid = if with_proof {
            Some(entry.merkle_proof.as_ref().is_some_and(MerkleProof::verify))
        } else {
            entry.merkle_proof = None;
            None
        };
        Self { entry, proof_valid }
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub start: u64,
    pub end: u64,
}

#[derive(Debug, Deserialize)]
pub struct AnchorRequest {
    pub start: u64,
    pub end: u64,
    pub tx_hash: String,
    pub block_number: i64,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
}
