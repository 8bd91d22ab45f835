//! Inference routing seam.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use beacon_core::{JobId, UnitId};

/// One inference call for one execution unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceRequest {
    pub job_id: JobId,
    pub unit_id: UnitId,
    pub region: String,
    pub model_id: String,
    /// Container image the model runs in, when the spec names one.
    pub model_image: Option<String>,
    pub question_index: u32,
    pub question: Option<String>,
    pub timeout: Duration,
}

/// What a provider returned for a successful call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceOutput {
    pub provider_id: String,
    pub output: JsonValue,
    pub receipt: JsonValue,
    #[serde(default)]
    pub ipfs_cid: Option<String>,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("provider call failed: {0}")]
    Transient(String),

    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs inference in a given region.
#[async_trait::async_trait]
pub trait InferenceRouter: Send + Sync {
    async fn execute(&self, request: InferenceRequest) -> Result<InferenceOutput, ProviderError>;
}

/// Router used when no inference backend is wired in: every call fails, so
/// units end up `failed` and remain retryable once a backend is available.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredRouter;

#[async_trait::async_trait]
impl InferenceRouter for UnconfiguredRouter {
    async fn execute(&self, request: InferenceRequest) -> Result<InferenceOutput, ProviderError> {
        Err(ProviderError::Transient(format!(
            "no inference router configured for region {}",
            request.region
        )))
    }
}
