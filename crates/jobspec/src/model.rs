//! JobSpec wire model.
//!
//! Every field defaults when absent so that partially-filled specs from
//! different clients deserialize identically; canonicalization later prunes
//! the zero values again. Durations travel as integer nanoseconds.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A signed benchmark-job specification.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    pub id: String,
    pub jobspec_id: String,
    pub version: String,
    pub benchmark: Benchmark,
    pub constraints: ExecutionConstraints,
    pub metadata: Map<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub questions: Vec<String>,
    pub models: Vec<ModelSpec>,
    pub runs: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wallet_auth: Option<WalletAuth>,
    pub signature: String,
    pub public_key: String,

    /// Top-level fields this model does not know about. They are part of the
    /// signed content, so they are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Benchmark {
    pub name: String,
    pub version: String,
    pub description: String,
    pub container: Container,
    pub input: InputSpec,
    pub scoring: ScoringSpec,
    pub metadata: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Container {
    pub image: String,
    pub tag: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub resources: ResourceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSpec {
    pub cpu: String,
    pub memory: String,
    pub gpu: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputSpec {
    /// "prompt", "dataset" or "file".
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Map<String, Value>,
    /// SHA-256 of the input, required for integrity checks.
    pub hash: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringSpec {
    pub method: String,
    pub parameters: Map<String, Value>,
}

/// Where and how strictly a job must run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConstraints {
    pub regions: Vec<String>,
    pub min_regions: u32,
    pub min_success_rate: f64,
    /// Whole-job budget, nanoseconds.
    pub timeout: u64,
    /// Per-call budget, nanoseconds.
    pub provider_timeout: u64,
    pub max_cost: f64,
    pub providers: Vec<ProviderFilter>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderFilter {
    pub region: String,
    pub min_score: f64,
    pub max_price: f64,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
}

/// One model to evaluate. An empty `regions` list means "all job regions".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSpec {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub container_image: String,
    pub regions: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletAuth {
    pub address: String,
    pub signature: String,
    pub message: String,
    #[serde(rename = "chainId")]
    pub chain_id: u64,
    pub nonce: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: String,
}

impl JobSpec {
    /// The identifier the job is stored under: `id`, falling back to `jobspec_id`.
    pub fn effective_id(&self) -> Option<&str> {
        [self.id.as_str(), self.jobspec_id.as_str()]
            .into_iter()
            .find(|s| !s.trim().is_empty())
    }

    /// Models to run. Specs without a model list run the benchmark container
    /// as a single implicit model.
    pub fn effective_models(&self) -> Vec<ModelSpec> {
        if !self.models.is_empty() {
            return self.models.clone();
        }
        vec![ModelSpec {
            id: "default".to_string(),
            name: self.benchmark.name.clone(),
            provider: String::new(),
            container_image: self.benchmark.container.image.clone(),
            regions: Vec::new(),
        }]
    }

    /// Regions a model runs in, restricted to the job's regions and kept in
    /// job-region order.
    pub fn regions_for_model(&self, model: &ModelSpec) -> Vec<String> {
        if model.regions.is_empty() {
            return self.constraints.regions.clone();
        }
        self.constraints
            .regions
            .iter()
            .filter(|r| model.regions.iter().any(|m| m.eq_ignore_ascii_case(r)))
            .cloned()
            .collect()
    }

    /// Units one full run schedules: every question, for every model, in
    /// every region that model runs in. A spec without questions runs once.
    pub fn planned_unit_count(&self) -> usize {
        let per_question: usize = self
            .effective_models()
            .iter()
            .map(|m| self.regions_for_model(m).len())
            .sum();
        per_question * self.questions.len().max(1)
    }
}
