//! Region rollups and the cross-region aggregate.
//!
//! A region succeeds when all of its units are terminal and at least one of
//! them completed. The aggregate is evaluated only once every planned unit
//! exists and is terminal; until then it stays `running`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument};

use beacon_core::ExecutionId;

use super::store::ExecutionStore;
use super::types::{AggregateStatus, CrossRegionExecution, ExecutionUnit, RegionResult, UnitStatus};
use crate::error::StoreError;
use crate::jobs::{JobStatus, JobStore};

#[derive(Debug, Clone, PartialEq)]
pub struct Rollup {
    pub regions: Vec<RegionResult>,
    pub success_count: u32,
    pub failure_count: u32,
    pub all_terminal: bool,
}

/// Summarize `units` per region, in the order of `regions`.
///
/// `planned_units` is how many units a full run schedules; while fewer exist
/// the run is still between batches and nothing is terminal yet. A region
/// with no units at all counts as failed.
pub fn roll_up(
    execution_id: ExecutionId,
    regions: &[String],
    planned_units: usize,
    units: &[ExecutionUnit],
) -> Rollup {
    let mut rollup = Rollup {
        regions: Vec::with_capacity(regions.len()),
        success_count: 0,
        failure_count: 0,
        all_terminal: units.len() >= planned_units && units.iter().all(ExecutionUnit::is_terminal),
    };

    for region in regions {
        let in_region: Vec<&ExecutionUnit> = units.iter().filter(|u| &u.region == region).collect();
        let units_total = in_region.len() as u32;
        let units_succeeded = in_region.iter().filter(|u| u.status == UnitStatus::Completed).count() as u32;
        let terminal = in_region.iter().all(|u| u.is_terminal());

        let status = if !terminal {
            AggregateStatus::Running
        } else if units_succeeded > 0 {
            AggregateStatus::Completed
        } else {
            AggregateStatus::Failed
        };
        match status {
            AggregateStatus::Completed => rollup.success_count += 1,
            AggregateStatus::Failed => rollup.failure_count += 1,
            AggregateStatus::Running => {}
        }

        let started_at = in_region.iter().filter_map(|u| u.started_at).min();
        let completed_at = terminal
            .then(|| in_region.iter().filter_map(|u| u.completed_at).max())
            .flatten();
        let first_error = in_region
            .iter()
            .find(|u| u.is_terminal() && u.status != UnitStatus::Completed)
            .and_then(|u| u.last_error.clone());
        let units_failed = in_region
            .iter()
            .filter(|u| u.is_terminal() && u.status != UnitStatus::Completed)
            .count();
        let error = if units_total == 0 {
            Some("no units scheduled for region".to_string())
        } else if status == AggregateStatus::Completed && units_failed > 0 {
            Some(format!(
                "{units_failed} of {units_total} units failed: {}",
                first_error.as_deref().unwrap_or("unknown error")
            ))
        } else {
            first_error
        };

        rollup.regions.push(RegionResult {
            execution_id,
            region: region.clone(),
            provider_id: in_region.iter().find_map(|u| u.provider_id.clone()),
            status,
            units_total,
            units_succeeded,
            started_at,
            completed_at,
            duration_ms: duration_ms(started_at, completed_at),
            error,
        });
    }
    rollup
}

fn duration_ms(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<i64> {
    Some((end? - start?).num_milliseconds().max(0))
}

/// Fold a rollup into the aggregate record.
pub fn apply(execution: &mut CrossRegionExecution, rollup: &Rollup, now: DateTime<Utc>) {
    execution.success_count = rollup.success_count;
    execution.failure_count = rollup.failure_count;
    if rollup.all_terminal {
        execution.status = execution.policy().evaluate(rollup.success_count, execution.total_regions);
        execution.completed_at = Some(now);
        execution.duration_ms = duration_ms(Some(execution.started_at), Some(now));
    } else {
        execution.status = AggregateStatus::Running;
        execution.completed_at = None;
        execution.duration_ms = None;
    }
}

/// Recomputes and persists aggregates, and mirrors terminal outcomes onto the job.
#[derive(Clone)]
pub struct Aggregator {
    executions: Arc<dyn ExecutionStore>,
    jobs: Arc<dyn JobStore>,
}

impl Aggregator {
    pub fn new(executions: Arc<dyn ExecutionStore>, jobs: Arc<dyn JobStore>) -> Self {
        Self { executions, jobs }
    }

    #[instrument(skip(self, regions), fields(execution_id = %execution_id), err)]
    pub async fn recompute(
        &self,
        execution_id: ExecutionId,
        regions: &[String],
        planned_units: usize,
    ) -> Result<CrossRegionExecution, StoreError> {
        let mut execution = self
            .executions
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("execution {execution_id}")))?;
        let units = self.executions.units_for_execution(execution_id).await?;

        let rollup = roll_up(execution_id, regions, planned_units, &units);
        for result in &rollup.regions {
            self.executions.upsert_region_result(result).await?;
        }
        apply(&mut execution, &rollup, Utc::now());
        self.executions.update_execution(&execution).await?;

        if execution.status.is_terminal() {
            let job_status = match execution.status {
                AggregateStatus::Completed => JobStatus::Completed,
                _ => JobStatus::Failed,
            };
            self.jobs.set_status(&execution.job_id, job_status).await?;
            info!(
                job_id = %execution.job_id,
                status = %execution.status,
                success_count = execution.success_count,
                total_regions = execution.total_regions,
                "cross-region execution finished"
            );
        }
        Ok(execution)
    }
}
