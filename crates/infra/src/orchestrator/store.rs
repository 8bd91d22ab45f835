//! Execution storage: aggregates, region rollups, and units.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use beacon_core::{ExecutionId, JobId, UnitId};

use super::types::{CrossRegionExecution, ExecutionUnit, RegionResult, UnitStatus};
use crate::error::StoreError;

#[async_trait::async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert the aggregate for a job, or return the one that already exists.
    async fn create_execution(&self, execution: &CrossRegionExecution) -> Result<CrossRegionExecution, StoreError>;

    async fn execution_for_job(&self, job_id: &JobId) -> Result<Option<CrossRegionExecution>, StoreError>;

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<CrossRegionExecution>, StoreError>;

    async fn update_execution(&self, execution: &CrossRegionExecution) -> Result<(), StoreError>;

    async fn upsert_region_result(&self, result: &RegionResult) -> Result<(), StoreError>;

    /// Region rollups ordered by region name.
    async fn region_results(&self, execution_id: ExecutionId) -> Result<Vec<RegionResult>, StoreError>;

    /// Insert a unit, or return the existing one with the same
    /// (execution, region, model, question) key.
    async fn insert_unit(&self, unit: &ExecutionUnit) -> Result<ExecutionUnit, StoreError>;

    async fn get_unit(&self, id: UnitId) -> Result<Option<ExecutionUnit>, StoreError>;

    /// The unit of the same execution and model as `anchor` at `region` and
    /// `question_index` (the anchor itself when it matches).
    async fn find_unit(
        &self,
        anchor: UnitId,
        region: &str,
        question_index: u32,
    ) -> Result<Option<ExecutionUnit>, StoreError>;

    async fn update_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError>;

    /// Persist a unit already moved to `retrying`, provided nobody else
    /// started a retry since it was read: the stored row must still be
    /// failed/timeout with `retry_count == expected_retry_count`.
    async fn try_begin_retry(&self, unit: &ExecutionUnit, expected_retry_count: u32) -> Result<bool, StoreError>;

    /// Units ordered by question index, region, then model.
    async fn units_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionUnit>, StoreError>;

    async fn units_for_job(&self, job_id: &JobId) -> Result<Vec<ExecutionUnit>, StoreError>;
}

pub(crate) fn sort_units(units: &mut [ExecutionUnit]) {
    units.sort_by(|a, b| {
        (a.question_index, &a.region, &a.model_id).cmp(&(b.question_index, &b.region, &b.model_id))
    });
}

#[derive(Debug, Default)]
struct ExecutionState {
    executions: HashMap<ExecutionId, CrossRegionExecution>,
    by_job: HashMap<JobId, ExecutionId>,
    regions: HashMap<ExecutionId, Vec<RegionResult>>,
    units: HashMap<UnitId, ExecutionUnit>,
}

impl ExecutionState {
    fn unit_by_key(&self, execution_id: ExecutionId, region: &str, model_id: &str, question_index: u32) -> Option<&ExecutionUnit> {
        self.units.values().find(|u| {
            u.execution_id == execution_id
                && u.region == region
                && u.model_id == model_id
                && u.question_index == question_index
        })
    }
}

/// In-memory execution store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryExecutionStore {
    state: RwLock<ExecutionState>,
}

impl InMemoryExecutionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl ExecutionStore for InMemoryExecutionStore {
    async fn create_execution(&self, execution: &CrossRegionExecution) -> Result<CrossRegionExecution, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        if let Some(existing) = state.by_job.get(&execution.job_id).and_then(|id| state.executions.get(id)) {
            return Ok(existing.clone());
        }
        state.by_job.insert(execution.job_id.clone(), execution.id);
        state.executions.insert(execution.id, execution.clone());
        Ok(execution.clone())
    }

    async fn execution_for_job(&self, job_id: &JobId) -> Result<Option<CrossRegionExecution>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        Ok(state
            .by_job
            .get(job_id)
            .and_then(|id| state.executions.get(id))
            .cloned())
    }

    async fn get_execution(&self, id: ExecutionId) -> Result<Option<CrossRegionExecution>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        Ok(state.executions.get(&id).cloned())
    }

    async fn update_execution(&self, execution: &CrossRegionExecution) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        let slot = state
            .executions
            .get_mut(&execution.id)
            .ok_or_else(|| StoreError::NotFound(format!("execution {}", execution.id)))?;
        *slot = execution.clone();
        Ok(())
    }

    async fn upsert_region_result(&self, result: &RegionResult) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        let rows = state.regions.entry(result.execution_id).or_default();
        match rows.iter_mut().find(|r| r.region == result.region) {
            Some(existing) => *existing = result.clone(),
            None => {
                rows.push(result.clone());
                rows.sort_by(|a, b| a.region.cmp(&b.region));
            }
        }
        Ok(())
    }

    async fn region_results(&self, execution_id: ExecutionId) -> Result<Vec<RegionResult>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        Ok(state.regions.get(&execution_id).cloned().unwrap_or_default())
    }

    async fn insert_unit(&self, unit: &ExecutionUnit) -> Result<ExecutionUnit, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        if let Some(existing) = state.unit_by_key(unit.execution_id, &unit.region, &unit.model_id, unit.question_index) {
            return Ok(existing.clone());
        }
        state.units.insert(unit.id, unit.clone());
        Ok(unit.clone())
    }

    async fn get_unit(&self, id: UnitId) -> Result<Option<ExecutionUnit>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        Ok(state.units.get(&id).cloned())
    }

    async fn find_unit(
        &self,
        anchor: UnitId,
        region: &str,
        question_index: u32,
    ) -> Result<Option<ExecutionUnit>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        let Some(anchor) = state.units.get(&anchor) else {
            return Ok(None);
        };
        Ok(state
            .unit_by_key(anchor.execution_id, region, &anchor.model_id, question_index)
            .cloned())
    }

    async fn update_unit(&self, unit: &ExecutionUnit) -> Result<(), StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        let slot = state
            .units
            .get_mut(&unit.id)
            .ok_or_else(|| StoreError::NotFound(format!("unit {}", unit.id)))?;
        *slot = unit.clone();
        Ok(())
    }

    async fn try_begin_retry(&self, unit: &ExecutionUnit, expected_retry_count: u32) -> Result<bool, StoreError> {
        let mut state = self.state.write().map_err(|_| StoreError::poisoned())?;
        let slot = state
            .units
            .get_mut(&unit.id)
            .ok_or_else(|| StoreError::NotFound(format!("unit {}", unit.id)))?;
        if !slot.status.is_retryable() || slot.retry_count != expected_retry_count {
            return Ok(false);
        }
        debug_assert_eq!(unit.status, UnitStatus::Retrying);
        *slot = unit.clone();
        Ok(true)
    }

    async fn units_for_execution(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionUnit>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        let mut units: Vec<ExecutionUnit> = state
            .units
            .values()
            .filter(|u| u.execution_id == execution_id)
            .cloned()
            .collect();
        sort_units(&mut units);
        Ok(units)
    }

    async fn units_for_job(&self, job_id: &JobId) -> Result<Vec<ExecutionUnit>, StoreError> {
        let state = self.state.read().map_err(|_| StoreError::poisoned())?;
        let mut units: Vec<ExecutionUnit> = state
            .units
            .values()
            .filter(|u| &u.job_id == job_id)
            .cloned()
            .collect();
        sort_units(&mut units);
        Ok(units)
    }
}
