//! Distributed coordination: short-lived keys used as locks and dedupe markers.
//!
//! Two users today:
//!
//! - retry dedupe, `retry:{unit}:{region}:{question}`
//! - the per-job processing lock, `job:processing:{job}`
//!
//! The Redis store makes both work across processes; the in-memory store is
//! for single-process deployments and tests.

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::InMemoryCoordinationStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisCoordinationStore;

use std::time::Duration;

use beacon_core::JobId;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),

    #[error("coordination command failed: {0}")]
    Command(String),
}

/// Set-if-absent with expiry, plus explicit release.
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Claim `key` for `ttl`. Returns `false` if someone else holds it.
    async fn set_if_absent(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError>;

    /// Push the expiry of a live claim out to `ttl` from now. Returns `false`
    /// if the key already expired or was released.
    async fn extend(&self, key: &str, ttl: Duration) -> Result<bool, CoordinationError>;

    /// Drop a claim early. Releasing an absent key is not an error.
    async fn release(&self, key: &str) -> Result<(), CoordinationError>;
}

pub fn retry_dedupe_key(unit_id: &impl std::fmt::Display, region: &str, question_index: u32) -> String {
    format!("retry:{unit_id}:{region}:{question_index}")
}

pub fn job_processing_key(job_id: &JobId) -> String {
    format!("job:processing:{job_id}")
}
