//! Cross-region orchestration.
//!
//! ## Components
//!
//! - `types`: execution units, their status machine, and the aggregate
//! - `store`: execution/unit persistence (`ExecutionStore`) with an in-memory impl
//! - `postgres`: the Postgres `ExecutionStore`
//! - `provider`: the inference routing seam
//! - `classify`: response classification and output hashing
//! - `runner`: drives one unit to a terminal status and logs it
//! - `aggregate`: per-region rollup and success thresholds
//! - `engine`: runs a whole job, one question batch at a time
//! - `worker`: consumes dispatches and feeds the engine

pub mod aggregate;
pub mod classify;
pub mod engine;
pub mod postgres;
pub mod provider;
pub mod runner;
pub mod store;
pub mod types;
pub mod worker;

use thiserror::Error;

use beacon_core::{DomainError, JobId};

use crate::coordination::CoordinationError;
use crate::error::StoreError;
use crate::transparency::TransparencyError;

pub use aggregate::{Aggregator, Rollup, apply, roll_up};
pub use classify::{classify_response, json_hash, response_text};
pub use engine::{JobRunOutcome, Orchestrator, OrchestratorConfig, SkipReason};
pub use postgres::PostgresExecutionStore;
pub use provider::{InferenceOutput, InferenceRequest, InferenceRouter, ProviderError, UnconfiguredRouter};
pub use runner::UnitRunner;
pub use store::{ExecutionStore, InMemoryExecutionStore};
pub use types::{
    ABANDONED_RETRY, AggregatePolicy, AggregateStatus, CompletedOutput, CrossRegionExecution, DEFAULT_MAX_RETRIES,
    ExecutionUnit, RETRY_HISTORY_CAP, RegionResult, ResponseClassification, RetryHistoryEntry,
    UnitStatus,
};
pub use worker::{OrchestratorWorker, WorkerHandle};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    #[error(transparent)]
    Transparency(#[from] TransparencyError),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("execution pool closed")]
    PoolClosed,

    #[error("execution task failed: {0}")]
    Task(String),
}
