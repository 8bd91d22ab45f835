//! Self-healing sweep for jobs that stopped making progress.
//!
//! Every pass queries stuck jobs and pushes each back through the outbox:
//!
//! - `created` past the grace window: republish
//! - `running` without `started_at`: reset to `created`, republish
//! - `running` for too long: reset to `created`, republish
//!
//! The reset and the new outbox row commit together and only if the job is
//! still in the status the sweep saw, so a job that moved on is skipped.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use beacon_core::JobId;

use crate::error::StoreError;
use crate::jobs::{JobStatus, JobStore, StuckCriteria, StuckJob, StuckJobStats};
use crate::outbox::{JobDispatch, TOPIC_JOB_CREATED};

#[derive(Debug, Clone)]
pub struct RepairConfig {
    pub interval: Duration,
    /// Grace window for `created` jobs.
    pub stuck_created_after: Duration,
    /// Longest a job may stay `running`.
    pub stuck_running_after: Duration,
    /// Jobs handled per pass.
    pub batch_limit: usize,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            stuck_created_after: Duration::from_secs(10 * 60),
            stuck_running_after: Duration::from_secs(30 * 60),
            batch_limit: 100,
        }
    }
}

impl RepairConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_limit(mut self, limit: usize) -> Self {
        self.batch_limit = limit;
        self
    }

    fn criteria(&self, now: DateTime<Utc>) -> StuckCriteria {
        let ago = |d: Duration| {
            chrono::Duration::from_std(d)
                .ok()
                .and_then(|d| now.checked_sub_signed(d))
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        };
        StuckCriteria {
            created_before: ago(self.stuck_created_after),
            started_before: ago(self.stuck_running_after),
            limit: self.batch_limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    Republish,
    FixStatus,
    TimeoutReset,
}

impl RepairAction {
    pub fn for_job(job: &StuckJob) -> Option<Self> {
        match (job.status, job.started_at) {
            (JobStatus::Created, _) => Some(Self::Republish),
            (JobStatus::Running, None) => Some(Self::FixStatus),
            (JobStatus::Running, Some(_)) => Some(Self::TimeoutReset),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Republish => "republish",
            Self::FixStatus => "fix_status",
            Self::TimeoutReset => "timeout_reset",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    Repaired,
    /// The job changed status between query and repair.
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairResult {
    pub job_id: JobId,
    pub action: Option<RepairAction>,
    pub status: RepairStatus,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RepairSummary {
    pub total: usize,
    pub repaired: usize,
    pub skipped: usize,
    pub errors: usize,
    pub results: Vec<RepairResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: i64,
}

#[derive(Clone)]
pub struct RepairSweep {
    jobs: Arc<dyn JobStore>,
    config: RepairConfig,
}

impl RepairSweep {
    pub fn new(jobs: Arc<dyn JobStore>, config: RepairConfig) -> Self {
        Self { jobs, config }
    }

    /// One pass over the stuck jobs. Per-job failures are recorded in the
    /// summary; only a failed query fails the pass.
    #[instrument(skip(self), err)]
    pub async fn run_once(&self) -> Result<RepairSummary, StoreError> {
        let started_at = Utc::now();
        let stuck = self.jobs.find_stuck(&self.config.criteria(started_at)).await?;

        let mut results = Vec::with_capacity(stuck.len());
        for job in &stuck {
            results.push(self.repair(job).await);
        }

        let finished_at = Utc::now();
        let count = |status: RepairStatus| results.iter().filter(|r| r.status == status).count();
        let summary = RepairSummary {
            total: results.len(),
            repaired: count(RepairStatus::Repaired),
            skipped: count(RepairStatus::Skipped),
            errors: count(RepairStatus::Error),
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds(),
            results,
        };
        if summary.total > 0 {
            info!(
                total = summary.total,
                repaired = summary.repaired,
                skipped = summary.skipped,
                errors = summary.errors,
                "repair pass finished"
            );
        }
        Ok(summary)
    }

    async fn repair(&self, job: &StuckJob) -> RepairResult {
        let Some(action) = RepairAction::for_job(job) else {
            return RepairResult {
                job_id: job.id.clone(),
                action: None,
                status: RepairStatus::Skipped,
                error: None,
            };
        };
        let payload = JobDispatch::repaired(job.id.clone(), action.as_str()).to_payload();
        let (status, error) = match self.jobs.republish(&job.id, job.status, TOPIC_JOB_CREATED, payload).await {
            Ok(true) => (RepairStatus::Repaired, None),
            Ok(false) => (RepairStatus::Skipped, None),
            Err(err) => {
                warn!(job_id = %job.id, action = action.as_str(), error = %err, "job repair failed");
                (RepairStatus::Error, Some(err.to_string()))
            }
        };
        RepairResult {
            job_id: job.id.clone(),
            action: Some(action),
            status,
            error,
        }
    }

    pub async fn stuck_job_stats(&self) -> Result<StuckJobStats, StoreError> {
        self.jobs.stuck_stats(&self.config.criteria(Utc::now())).await
    }

    /// Run a pass every `interval` until shut down.
    pub fn spawn(self) -> RepairHandle {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        let join = tokio::spawn(async move { self.run(loop_token).await });
        RepairHandle { token, join }
    }

    async fn run(self, token: CancellationToken) {
        info!(interval_secs = self.config.interval.as_secs(), "repair sweep started");
        loop {
            if let Err(err) = self.run_once().await {
                error!(error = %err, "repair pass failed");
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        info!("repair sweep stopped");
    }
}

#[derive(Debug)]
pub struct RepairHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl RepairHandle {
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(err) = self.join.await {
            warn!(error = %err, "repair sweep ended abnormally");
        }
    }
}
