//! Per-unit retry with distributed dedupe.
//!
//! A retry is accepted once the unit is durably `retrying`; the re-run
//! itself happens on the supervised pool and ends with an aggregate
//! recompute. Concurrent requests for the same unit collapse to one re-run
//! through the coordination key and the store's compare-and-set.
//!
//! A unit left `retrying` by a re-run that errored or never started is
//! failed again: by the re-run's own error path, by the next job run, or by
//! the next retry request once its dedupe key has lapsed.

pub mod supervisor;

pub use supervisor::{PoolStats, SupervisedPool, TaskFailure};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use beacon_core::{DomainError, UnitId};

use crate::coordination::{CoordinationError, CoordinationStore, retry_dedupe_key};
use crate::error::StoreError;
use crate::jobs::JobStore;
use crate::orchestrator::{
    ABANDONED_RETRY, Aggregator, ExecutionStore, ExecutionUnit, OrchestratorError, RETRY_HISTORY_CAP,
    UnitRunner, UnitStatus,
};

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Lifetime of the dedupe key guarding one unit's retry.
    pub dedupe_ttl: Duration,
    pub history_cap: usize,
    /// Concurrent re-executions.
    pub pool_size: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            dedupe_ttl: Duration::from_secs(90),
            history_cap: RETRY_HISTORY_CAP,
            pool_size: 16,
        }
    }
}

impl RetryConfig {
    pub fn with_dedupe_ttl(mut self, ttl: Duration) -> Self {
        self.dedupe_ttl = ttl;
        self
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// The unit is `retrying` and a re-run was scheduled.
    Accepted { unit: ExecutionUnit },
    AlreadyCompleted { unit: ExecutionUnit },
    /// Someone else is already running the unit.
    InFlight { status: UnitStatus },
    Exhausted { retry_count: u32, max_retries: u32 },
    NotRetryable { status: UnitStatus },
}

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("execution unit not found: {anchor} ({region}, question {question_index})")]
    NotFound {
        anchor: UnitId,
        region: String,
        question_index: u32,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

pub struct RetryService {
    jobs: Arc<dyn JobStore>,
    executions: Arc<dyn ExecutionStore>,
    coordination: Arc<dyn CoordinationStore>,
    runner: UnitRunner,
    aggregator: Aggregator,
    pool: Arc<SupervisedPool>,
    config: RetryConfig,
}

impl RetryService {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        executions: Arc<dyn ExecutionStore>,
        coordination: Arc<dyn CoordinationStore>,
        runner: UnitRunner,
        config: RetryConfig,
    ) -> Self {
        Self {
            aggregator: Aggregator::new(executions.clone(), jobs.clone()),
            pool: Arc::new(SupervisedPool::new("retry", config.pool_size)),
            jobs,
            executions,
            coordination,
            runner,
            config,
        }
    }

    pub fn pool(&self) -> &Arc<SupervisedPool> {
        &self.pool
    }

    /// Retry the unit at (`region`, `question_index`) of the execution `anchor` belongs to.
    #[instrument(skip(self), fields(anchor = %anchor), err)]
    pub async fn retry(&self, anchor: UnitId, region: &str, question_index: u32) -> Result<RetryOutcome, RetryError> {
        let mut unit = self
            .executions
            .find_unit(anchor, region, question_index)
            .await?
            .ok_or_else(|| RetryError::NotFound {
                anchor,
                region: region.to_string(),
                question_index,
            })?;

        let stale = unit.status == UnitStatus::Retrying && self.is_stale(&unit);
        match unit.status {
            UnitStatus::Completed => return Ok(RetryOutcome::AlreadyCompleted { unit }),
            UnitStatus::Retrying if stale => {}
            status @ (UnitStatus::Created | UnitStatus::Running | UnitStatus::Retrying) => {
                return Ok(RetryOutcome::InFlight { status });
            }
            status if !status.is_retryable() => return Ok(RetryOutcome::NotRetryable { status }),
            _ => {}
        }
        if !stale && unit.retry_count >= unit.max_retries {
            return Ok(RetryOutcome::Exhausted {
                retry_count: unit.retry_count,
                max_retries: unit.max_retries,
            });
        }

        let key = retry_dedupe_key(&unit.id, &unit.region, unit.question_index);
        if !self.coordination.set_if_absent(&key, self.config.dedupe_ttl).await? {
            return Ok(RetryOutcome::InFlight {
                status: UnitStatus::Retrying,
            });
        }

        if stale {
            // Nobody holds the key, so the earlier retry died before re-running.
            if let Err(err) = self.abandon(&mut unit).await {
                self.release(&key).await;
                return Err(err);
            }
            if unit.retry_count >= unit.max_retries {
                self.release(&key).await;
                return Ok(RetryOutcome::Exhausted {
                    retry_count: unit.retry_count,
                    max_retries: unit.max_retries,
                });
            }
        }

        let expected = unit.retry_count;
        let claimed = match unit.begin_retry(Utc::now(), self.config.history_cap) {
            Ok(()) => self
                .executions
                .try_begin_retry(&unit, expected)
                .await
                .map_err(RetryError::from),
            Err(err) => Err(RetryError::from(err)),
        };
        match claimed {
            Ok(true) => {}
            Ok(false) => {
                self.release(&key).await;
                return Ok(RetryOutcome::InFlight {
                    status: UnitStatus::Retrying,
                });
            }
            Err(err) => {
                self.release(&key).await;
                return Err(err);
            }
        }
        info!(unit_id = %unit.id, retry_count = unit.retry_count, "unit retry accepted");

        self.schedule(unit.clone(), key);
        Ok(RetryOutcome::Accepted { unit })
    }

    /// A `retrying` unit whose retry was requested longer ago than the
    /// dedupe key lives can no longer be owned by that request.
    fn is_stale(&self, unit: &ExecutionUnit) -> bool {
        let Ok(ttl) = chrono::Duration::from_std(self.config.dedupe_ttl) else {
            return false;
        };
        unit.last_retry_at().is_none_or(|at| at + ttl <= Utc::now())
    }

    async fn abandon(&self, unit: &mut ExecutionUnit) -> Result<(), RetryError> {
        unit.mark_failed(UnitStatus::Failed, ABANDONED_RETRY, Utc::now())?;
        self.executions.update_unit(unit).await?;
        warn!(unit_id = %unit.id, region = %unit.region, question_index = unit.question_index, "abandoned retry reclaimed");
        Ok(())
    }

    fn schedule(&self, unit: ExecutionUnit, key: String) {
        let jobs = self.jobs.clone();
        let executions = self.executions.clone();
        let runner = self.runner.clone();
        let aggregator = self.aggregator.clone();
        let coordination = self.coordination.clone();
        let label = format!("retry {}", unit.id);

        self.pool.spawn(label, async move {
            let unit_id = unit.id;
            let result = reexecute(jobs, runner, aggregator, unit).await;
            if let Err(err) = &result {
                fail_unfinished(executions.as_ref(), unit_id, err).await;
            }
            if let Err(err) = coordination.release(&key).await {
                warn!(key = %key, error = %err, "failed to release retry key; it will expire");
            }
            result
        });
    }

    async fn release(&self, key: &str) {
        if let Err(err) = self.coordination.release(key).await {
            warn!(key = %key, error = %err, "failed to release retry key; it will expire");
        }
    }
}

async fn reexecute(
    jobs: Arc<dyn JobStore>,
    runner: UnitRunner,
    aggregator: Aggregator,
    unit: ExecutionUnit,
) -> Result<(), OrchestratorError> {
    let job = jobs
        .get(&unit.job_id)
        .await?
        .ok_or_else(|| OrchestratorError::JobNotFound(unit.job_id.clone()))?;
    let constraints = job.spec.constraints.effective();
    let model_image = job
        .spec
        .effective_models()
        .into_iter()
        .find(|m| m.id == unit.model_id)
        .map(|m| m.container_image)
        .filter(|image| !image.is_empty());

    let execution_id = unit.execution_id;
    let unit = runner.run(unit, constraints.provider_timeout, model_image).await?;
    info!(unit_id = %unit.id, status = %unit.status, "retried unit finished");
    aggregator
        .recompute(execution_id, &constraints.regions, job.spec.planned_unit_count())
        .await?;
    Ok(())
}

/// A re-run that errored out must not leave its unit `retrying` or
/// `running`; fail it so the cell stays retryable.
async fn fail_unfinished(executions: &dyn ExecutionStore, unit_id: UnitId, cause: &OrchestratorError) {
    let mut unit = match executions.get_unit(unit_id).await {
        Ok(Some(unit)) => unit,
        Ok(None) => return,
        Err(err) => {
            warn!(unit_id = %unit_id, error = %err, "failed to reload unit after retry error");
            return;
        }
    };
    if !matches!(unit.status, UnitStatus::Retrying | UnitStatus::Running) {
        return;
    }
    let reason = format!("retry failed: {cause}");
    let updated = match unit.mark_failed(UnitStatus::Failed, reason, Utc::now()) {
        Ok(()) => executions.update_unit(&unit).await.map_err(|e| e.to_string()),
        Err(err) => Err(err.to_string()),
    };
    if let Err(err) = updated {
        warn!(unit_id = %unit_id, error = %err, "failed to mark unit failed after retry error");
    }
}
