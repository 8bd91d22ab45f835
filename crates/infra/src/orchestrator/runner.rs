//! Runs one execution unit: provider call under a deadline, persisted
//! status transitions, and the transparency log entry for the result.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, instrument, warn};

use super::classify::{classify_response, json_hash, response_text};
use super::provider::{InferenceRequest, InferenceRouter, ProviderError};
use super::store::ExecutionStore;
use super::types::{CompletedOutput, ExecutionUnit, UnitStatus};
use super::OrchestratorError;
use crate::transparency::{NewLogEntry, TransparencyLog};

#[derive(Clone)]
pub struct UnitRunner {
    executions: Arc<dyn ExecutionStore>,
    router: Arc<dyn InferenceRouter>,
    log: Arc<TransparencyLog>,
}

impl UnitRunner {
    pub fn new(
        executions: Arc<dyn ExecutionStore>,
        router: Arc<dyn InferenceRouter>,
        log: Arc<TransparencyLog>,
    ) -> Self {
        Self {
            executions,
            router,
            log,
        }
    }

    /// Drive `unit` (created or retrying) to a terminal status.
    ///
    /// Provider failures end up on the unit; only store errors are returned.
    #[instrument(
        skip(self, unit, model_image),
        fields(unit_id = %unit.id, job_id = %unit.job_id, region = %unit.region, question_index = unit.question_index),
        err
    )]
    pub async fn run(
        &self,
        mut unit: ExecutionUnit,
        timeout: Duration,
        model_image: Option<String>,
    ) -> Result<ExecutionUnit, OrchestratorError> {
        unit.mark_running(Utc::now())?;
        self.executions.update_unit(&unit).await?;

        let request = InferenceRequest {
            job_id: unit.job_id.clone(),
            unit_id: unit.id,
            region: unit.region.clone(),
            model_id: unit.model_id.clone(),
            model_image,
            question_index: unit.question_index,
            question: unit.question.clone(),
            timeout,
        };

        let outcome = match tokio::time::timeout(timeout, self.router.execute(request)).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::Timeout(timeout)),
        };

        let now = Utc::now();
        match outcome {
            Ok(output) => {
                let classification = classify_response(response_text(&output.output), true);
                unit.mark_completed(
                    CompletedOutput {
                        provider_id: output.provider_id,
                        output_hash: json_hash(&output.output),
                        output: output.output,
                        receipt: output.receipt,
                        ipfs_cid: output.ipfs_cid,
                        classification,
                    },
                    now,
                )?;
                debug!(provider_id = ?unit.provider_id, "unit completed");
            }
            Err(ProviderError::Timeout(after)) => {
                warn!(timeout_ms = after.as_millis() as u64, "unit timed out");
                unit.mark_failed(UnitStatus::Timeout, format!("provider timed out after {after:?}"), now)?;
            }
            Err(err) => {
                warn!(error = %err, "unit failed");
                unit.mark_failed(UnitStatus::Failed, err.to_string(), now)?;
            }
        }
        self.executions.update_unit(&unit).await?;
        self.record(&unit).await;
        Ok(unit)
    }

    /// Append the unit's terminal result to the transparency log. A log
    /// failure never changes the unit's outcome.
    async fn record(&self, unit: &ExecutionUnit) {
        let entry = NewLogEntry {
            execution_id: unit.id.to_string(),
            job_id: unit.job_id.to_string(),
            region: unit.region.clone(),
            provider_id: unit.provider_id.clone().unwrap_or_default(),
            status: unit.status.to_string(),
            output_hash: unit.output_hash.clone().unwrap_or_default(),
            receipt_hash: unit.receipt.as_ref().map(json_hash).unwrap_or_default(),
            ipfs_cid: unit.ipfs_cid.clone(),
        };
        if let Err(err) = self.log.append(entry).await {
            error!(unit_id = %unit.id, error = %err, "failed to append transparency entry");
        }
    }
}
