//! Cross-region job execution.
//!
//! Questions run one batch at a time; within a batch every (model, region)
//! unit runs concurrently on a shared permit pool, each under its own
//! provider deadline. Batch N+1 starts only once batch N is fully terminal.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use beacon_core::JobId;
use beacon_jobspec::{EffectiveConstraints, JobSpec};

use super::OrchestratorError;
use super::aggregate::Aggregator;
use super::runner::UnitRunner;
use super::store::ExecutionStore;
use super::types::{
    ABANDONED_RETRY, AggregatePolicy, CrossRegionExecution, DEFAULT_MAX_RETRIES, ExecutionUnit,
    UnitStatus,
};
use crate::coordination::{CoordinationStore, job_processing_key, retry_dedupe_key};
use crate::jobs::{JobStatus, JobStore};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Units in flight across all jobs.
    pub max_concurrent: usize,
    /// Retry budget given to every new unit.
    pub max_retries: u32,
    /// TTL of the per-job processing lock. The lock is extended every third
    /// of this while the job runs.
    pub job_lock_ttl: Duration,
    /// Capacity of the dispatch queue feeding the worker.
    pub queue_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_retries: DEFAULT_MAX_RETRIES,
            job_lock_ttl: Duration::from_secs(15 * 60),
            queue_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_job_lock_ttl(mut self, ttl: Duration) -> Self {
        self.job_lock_ttl = ttl;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Another worker holds the job's processing lock.
    LockHeld,
    /// The job (or its aggregate) already finished.
    AlreadyTerminal,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobRunOutcome {
    Skipped(SkipReason),
    Finished(CrossRegionExecution),
}

/// One unit of one question batch.
struct PlannedUnit {
    unit: ExecutionUnit,
    model_image: Option<String>,
}

pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    executions: Arc<dyn ExecutionStore>,
    coordination: Arc<dyn CoordinationStore>,
    runner: UnitRunner,
    aggregator: Aggregator,
    permits: Arc<Semaphore>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        executions: Arc<dyn ExecutionStore>,
        coordination: Arc<dyn CoordinationStore>,
        runner: UnitRunner,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            aggregator: Aggregator::new(executions.clone(), jobs.clone()),
            permits: Arc::new(Semaphore::new(config.max_concurrent)),
            jobs,
            executions,
            coordination,
            runner,
            config,
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Run a job to a terminal aggregate under its processing lock.
    ///
    /// Duplicate deliveries are harmless: a held lock or a finished job is
    /// skipped, and units already terminal are never re-run.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn run_job(&self, job_id: &JobId) -> Result<JobRunOutcome, OrchestratorError> {
        let lock_key = job_processing_key(job_id);
        if !self
            .coordination
            .set_if_absent(&lock_key, self.config.job_lock_ttl)
            .await?
        {
            debug!("job already being processed; skipping delivery");
            return Ok(JobRunOutcome::Skipped(SkipReason::LockHeld));
        }

        let lost = AtomicBool::new(false);
        let result = tokio::select! {
            biased;
            result = self.process(job_id) => result,
            never = self.hold_lock(&lock_key, &lost) => match never {},
        };

        // A lock taken over by another worker is theirs to release.
        if !lost.load(Ordering::Relaxed) {
            if let Err(err) = self.coordination.release(&lock_key).await {
                warn!(error = %err, "failed to release job lock; it will expire");
            }
        }
        result
    }

    /// Keep the processing lock alive for as long as the job runs. If the
    /// claim lapsed anyway it is re-taken when free; if another worker got
    /// it first there is nothing left to hold.
    async fn hold_lock(&self, key: &str, lost: &AtomicBool) -> Infallible {
        let ttl = self.config.job_lock_ttl;
        let mut ticker = tokio::time::interval((ttl / 3).max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let held = match self.coordination.extend(key, ttl).await {
                Ok(true) => true,
                Ok(false) => self.coordination.set_if_absent(key, ttl).await.unwrap_or(false),
                Err(err) => {
                    warn!(error = %err, "failed to extend job lock");
                    continue;
                }
            };
            if !held {
                lost.store(true, Ordering::Relaxed);
                warn!("job lock taken over by another worker");
                return std::future::pending::<Infallible>().await;
            }
        }
    }

    async fn process(&self, job_id: &JobId) -> Result<JobRunOutcome, OrchestratorError> {
        let job = self
            .jobs
            .get(job_id)
            .await?
            .ok_or_else(|| OrchestratorError::JobNotFound(job_id.clone()))?;
        if job.status.is_terminal() {
            return Ok(JobRunOutcome::Skipped(SkipReason::AlreadyTerminal));
        }
        if let Some(existing) = self.executions.execution_for_job(job_id).await? {
            if existing.status.is_terminal() {
                return Ok(JobRunOutcome::Skipped(SkipReason::AlreadyTerminal));
            }
        }

        let constraints = job.spec.constraints.effective();
        self.jobs.set_status(job_id, JobStatus::Running).await?;

        let execution = self
            .executions
            .create_execution(&CrossRegionExecution::start(
                job_id.clone(),
                constraints.regions.len() as u32,
                AggregatePolicy {
                    min_regions: constraints.min_regions,
                    min_success_rate: constraints.min_success_rate,
                },
                Utc::now(),
            ))
            .await?;
        info!(
            execution_id = %execution.id,
            regions = constraints.regions.len(),
            questions = job.spec.questions.len(),
            "cross-region execution started"
        );

        let planned_units = job.spec.planned_unit_count();
        let batches = question_batches(&job.spec);
        for (question_index, question) in batches.into_iter().enumerate() {
            let planned = self
                .plan_batch(&execution, &job.spec, question_index as u32, question)
                .await?;
            self.run_batch(planned, &constraints).await?;
        }

        let execution = self
            .aggregator
            .recompute(execution.id, &constraints.regions, planned_units)
            .await?;
        Ok(JobRunOutcome::Finished(execution))
    }

    /// Insert (or reload) the units of one question and return those that
    /// still need to run.
    async fn plan_batch(
        &self,
        execution: &CrossRegionExecution,
        spec: &JobSpec,
        question_index: u32,
        question: Option<String>,
    ) -> Result<Vec<PlannedUnit>, OrchestratorError> {
        let mut planned = Vec::new();
        for model in spec.effective_models() {
            let model_image = Some(model.container_image.clone()).filter(|s| !s.is_empty());
            for region in spec.regions_for_model(&model) {
                let fresh = ExecutionUnit::new(
                    execution.id,
                    execution.job_id.clone(),
                    region,
                    model.id.clone(),
                    question_index,
                    question.clone(),
                    self.config.max_retries,
                );
                let mut unit = self.executions.insert_unit(&fresh).await?;
                match unit.status {
                    UnitStatus::Created => planned.push(PlannedUnit {
                        unit,
                        model_image: model_image.clone(),
                    }),
                    // A retry may still own it; its dedupe key says so.
                    UnitStatus::Retrying => self.reclaim_retry(unit).await?,
                    UnitStatus::Running if unit.retry_count > 0 => self.reclaim_retry(unit).await?,
                    UnitStatus::Running => {
                        // Left over from an interrupted run; we hold the job lock.
                        unit.mark_failed(UnitStatus::Failed, "interrupted before completion", Utc::now())?;
                        self.executions.update_unit(&unit).await?;
                    }
                    _ => {}
                }
            }
        }
        Ok(planned)
    }

    /// A retried unit whose dedupe key is free has no re-run behind it;
    /// fail it so the aggregate can settle and the cell can be retried again.
    async fn reclaim_retry(&self, mut unit: ExecutionUnit) -> Result<(), OrchestratorError> {
        let key = retry_dedupe_key(&unit.id, &unit.region, unit.question_index);
        if !self.coordination.set_if_absent(&key, self.config.job_lock_ttl).await? {
            return Ok(());
        }
        let result = match unit.mark_failed(UnitStatus::Failed, ABANDONED_RETRY, Utc::now()) {
            Ok(()) => self.executions.update_unit(&unit).await.map_err(OrchestratorError::from),
            Err(err) => Err(OrchestratorError::from(err)),
        };
        if let Err(err) = self.coordination.release(&key).await {
            warn!(key = %key, error = %err, "failed to release retry key; it will expire");
        }
        if result.is_ok() {
            warn!(unit_id = %unit.id, region = %unit.region, question_index = unit.question_index, "abandoned retry reclaimed");
        }
        result
    }

    async fn run_batch(
        &self,
        planned: Vec<PlannedUnit>,
        constraints: &EffectiveConstraints,
    ) -> Result<(), OrchestratorError> {
        let mut tasks = JoinSet::new();
        for PlannedUnit { unit, model_image } in planned {
            let runner = self.runner.clone();
            let permits = Arc::clone(&self.permits);
            let timeout = constraints.provider_timeout;
            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| OrchestratorError::PoolClosed)?;
                runner.run(unit, timeout, model_image).await
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| OrchestratorError::Task(e.to_string())).and_then(|r| r);
            if let Err(err) = outcome {
                error!(error = %err, "execution unit aborted");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// One batch per question; a spec without questions runs a single batch.
fn question_batches(spec: &JobSpec) -> Vec<Option<String>> {
    if spec.questions.is_empty() {
        vec![None]
    } else {
        spec.questions.iter().cloned().map(Some).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specs_without_questions_run_one_batch() {
        let spec = JobSpec::default();
        assert_eq!(question_batches(&spec), vec![None]);

        let spec = JobSpec {
            questions: vec!["a".into(), "b".into()],
            ..Default::default()
        };
        assert_eq!(question_batches(&spec), vec![Some("a".into()), Some("b".into())]);
    }

    #[test]
    fn concurrency_floor_is_one() {
        assert_eq!(OrchestratorConfig::default().with_max_concurrent(0).max_concurrent, 1);
    }
}
