//! Execution units, cross-region aggregates and per-region rollups.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use beacon_core::{DomainError, DomainResult, ExecutionId, JobId, UnitId};

/// Retry history is capped; the oldest entries are dropped first.
pub const RETRY_HISTORY_CAP: usize = 20;

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Error recorded on a `retrying` unit whose re-run never happened.
pub const ABANDONED_RETRY: &str = "retry abandoned before completion";

/// Status of a single execution unit.
///
/// ```text
/// created -> running -> completed | failed | timeout
/// failed | timeout -> retrying -> running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Created,
    Running,
    Completed,
    Failed,
    Timeout,
    Retrying,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, UnitStatus::Completed | UnitStatus::Failed | UnitStatus::Timeout)
    }

    /// Failed or timed out, i.e. eligible for a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, UnitStatus::Failed | UnitStatus::Timeout)
    }

    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Timeout)
                | (Failed, Retrying)
                | (Timeout, Retrying)
                | (Retrying, Running)
                | (Retrying, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Created => "created",
            UnitStatus::Running => "running",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed => "failed",
            UnitStatus::Timeout => "timeout",
            UnitStatus::Retrying => "retrying",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "created" => Some(UnitStatus::Created),
            "running" => Some(UnitStatus::Running),
            "completed" => Some(UnitStatus::Completed),
            "failed" => Some(UnitStatus::Failed),
            "timeout" => Some(UnitStatus::Timeout),
            "retrying" => Some(UnitStatus::Retrying),
            _ => None,
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryHistoryEntry {
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    /// Status the unit was in when the retry was requested.
    pub status: UnitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a provider response reads: refusal, substantive answer, or neither.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseClassification {
    pub is_substantive: bool,
    pub is_refusal: bool,
    pub is_technical_error: bool,
}

/// One (question, model, region) unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    pub id: UnitId,
    pub execution_id: ExecutionId,
    pub job_id: JobId,
    pub region: String,
    pub model_id: String,
    pub question_index: u32,
    pub question: Option<String>,
    pub status: UnitStatus,
    pub provider_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub output: Option<JsonValue>,
    pub output_hash: Option<String>,
    pub receipt: Option<JsonValue>,
    pub ipfs_cid: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub retry_history: Vec<RetryHistoryEntry>,
    /// First error ever recorded; survives later attempts.
    pub original_error: Option<String>,
    pub last_error: Option<String>,
    #[serde(flatten)]
    pub classification: ResponseClassification,
}

impl ExecutionUnit {
    pub fn new(
        execution_id: ExecutionId,
        job_id: JobId,
        region: impl Into<String>,
        model_id: impl Into<String>,
        question_index: u32,
        question: Option<String>,
        max_retries: u32,
    ) -> Self {
        Self {
            id: UnitId::new(),
            execution_id,
            job_id,
            region: region.into(),
            model_id: model_id.into(),
            question_index,
            question,
            status: UnitStatus::Created,
            provider_id: None,
            started_at: None,
            completed_at: None,
            output: None,
            output_hash: None,
            receipt: None,
            ipfs_cid: None,
            retry_count: 0,
            max_retries,
            retry_history: Vec::new(),
            original_error: None,
            last_error: None,
            classification: ResponseClassification::default(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn transition(&mut self, next: UnitStatus) -> DomainResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(DomainError::invariant(format!(
                "unit {}: illegal transition {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(UnitStatus::Running)?;
        self.started_at = Some(now);
        self.completed_at = None;
        Ok(())
    }

    pub fn mark_completed(&mut self, result: CompletedOutput, now: DateTime<Utc>) -> DomainResult<()> {
        self.transition(UnitStatus::Completed)?;
        self.provider_id = Some(result.provider_id);
        self.output_hash = Some(result.output_hash);
        self.output = Some(result.output);
        self.receipt = Some(result.receipt);
        self.ipfs_cid = result.ipfs_cid;
        self.classification = result.classification;
        self.completed_at = Some(now);
        self.last_error = None;
        Ok(())
    }

    /// Record a failed attempt as `failed` or `timeout`.
    pub fn mark_failed(
        &mut self,
        status: UnitStatus,
        error: impl Into<String>,
        now: DateTime<Utc>,
    ) -> DomainResult<()> {
        if !matches!(status, UnitStatus::Failed | UnitStatus::Timeout) {
            return Err(DomainError::invariant(format!("{status} is not a failure status")));
        }
        self.transition(status)?;
        let error = error.into();
        if self.original_error.is_none() {
            self.original_error = Some(error.clone());
        }
        self.last_error = Some(error);
        self.classification = ResponseClassification {
            is_technical_error: true,
            ..ResponseClassification::default()
        };
        self.completed_at = Some(now);
        Ok(())
    }

    /// When the current retry was requested, if any.
    pub fn last_retry_at(&self) -> Option<DateTime<Utc>> {
        self.retry_history.last().map(|entry| entry.timestamp)
    }

    /// Move a failed unit to `retrying`, counting the attempt.
    pub fn begin_retry(&mut self, now: DateTime<Utc>, history_cap: usize) -> DomainResult<()> {
        if self.retry_count >= self.max_retries {
            return Err(DomainError::invariant(format!(
                "unit {}: retries exhausted ({}/{})",
                self.id, self.retry_count, self.max_retries
            )));
        }
        let previous = self.status;
        let error = self.last_error.clone();
        self.transition(UnitStatus::Retrying)?;
        self.retry_count += 1;
        self.retry_history.push(RetryHistoryEntry {
            attempt: self.retry_count,
            timestamp: now,
            status: previous,
            error,
        });
        let overflow = self.retry_history.len().saturating_sub(history_cap);
        self.retry_history.drain(..overflow);
        Ok(())
    }
}

/// What a successful provider call leaves on a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedOutput {
    pub provider_id: String,
    pub output: JsonValue,
    pub output_hash: String,
    pub receipt: JsonValue,
    pub ipfs_cid: Option<String>,
    pub classification: ResponseClassification,
}

/// Status of the cross-region aggregate (and of each region rollup).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStatus {
    Running,
    Completed,
    Failed,
}

impl AggregateStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AggregateStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AggregateStatus::Running => "running",
            AggregateStatus::Completed => "completed",
            AggregateStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(AggregateStatus::Running),
            "completed" => Some(AggregateStatus::Completed),
            "failed" => Some(AggregateStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for AggregateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Success thresholds of a cross-region run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatePolicy {
    pub min_regions: u32,
    pub min_success_rate: f64,
}

impl AggregatePolicy {
    /// Completed iff `success / total >= min_success_rate` and
    /// `success >= min_regions`. Both bounds are inclusive.
    pub fn evaluate(&self, success: u32, total: u32) -> AggregateStatus {
        if total == 0 {
            return AggregateStatus::Failed;
        }
        let rate = f64::from(success) / f64::from(total);
        if rate >= self.min_success_rate && success >= self.min_regions {
            AggregateStatus::Completed
        } else {
            AggregateStatus::Failed
        }
    }
}

/// The aggregate over every unit of one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossRegionExecution {
    pub id: ExecutionId,
    pub job_id: JobId,
    pub total_regions: u32,
    pub success_count: u32,
    pub failure_count: u32,
    pub min_regions_required: u32,
    pub min_success_rate: f64,
    pub status: AggregateStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl CrossRegionExecution {
    pub fn start(job_id: JobId, total_regions: u32, policy: AggregatePolicy, now: DateTime<Utc>) -> Self {
        Self {
            id: ExecutionId::new(),
            job_id,
            total_regions,
            success_count: 0,
            failure_count: 0,
            min_regions_required: policy.min_regions,
            min_success_rate: policy.min_success_rate,
            status: AggregateStatus::Running,
            started_at: now,
            completed_at: None,
            duration_ms: None,
        }
    }

    pub fn policy(&self) -> AggregatePolicy {
        AggregatePolicy {
            min_regions: self.min_regions_required,
            min_success_rate: self.min_success_rate,
        }
    }
}

/// Per-region rollup of one cross-region execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionResult {
    pub execution_id: ExecutionId,
    pub region: String,
    pub provider_id: Option<String>,
    pub status: AggregateStatus,
    pub units_total: u32,
    pub units_succeeded: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub error: Option<String>,
}
