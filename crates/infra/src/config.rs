//! Configuration loading and representation.
//!
//! Everything is read from environment variables with conservative defaults,
//! so a bare `cargo run` starts an in-memory engine.

use std::time::Duration;

use crate::orchestrator::OrchestratorConfig;
use crate::outbox::PublisherConfig;
use crate::repair::RepairConfig;
use crate::retry::RetryConfig;

/// Process-wide engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Postgres URL. `None` selects the in-memory stores.
    pub database_url: Option<String>,
    /// Redis URL for retry dedupe / job locks. `None` selects the in-process store.
    pub redis_url: Option<String>,
    pub bind_addr: String,
    pub db_max_connections: u32,
    pub orchestrator: OrchestratorConfig,
    pub publisher: PublisherConfig,
    pub repair: RepairConfig,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: None,
            bind_addr: "0.0.0.0:8080".to_string(),
            db_max_connections: 10,
            orchestrator: OrchestratorConfig::default(),
            publisher: PublisherConfig::default(),
            repair: RepairConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary lookup (used by tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let number = |key: &str| non_empty(key).and_then(|v| v.trim().parse::<u64>().ok());

        config.database_url = non_empty("DATABASE_URL");
        config.redis_url = non_empty("REDIS_URL");
        if let Some(addr) = non_empty("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(n) = number("DB_MAX_CONNECTIONS") {
            config.db_max_connections = n as u32;
        }
        if let Some(n) = number("ORCHESTRATOR_MAX_CONCURRENT") {
            config.orchestrator = config.orchestrator.with_max_concurrent(n as usize);
        }
        if let Some(n) = number("OUTBOX_BATCH_SIZE") {
            config.publisher = config.publisher.with_batch_size(n as usize);
        }
        if let Some(n) = number("OUTBOX_POLL_INTERVAL_MS") {
            config.publisher = config.publisher.with_poll_interval(Duration::from_millis(n));
        }
        if let Some(n) = number("OUTBOX_MAX_ATTEMPTS") {
            config.publisher = config.publisher.with_max_attempts(n as u32);
        }
        if let Some(n) = number("REPAIR_INTERVAL_SECS") {
            config.repair = config.repair.with_interval(Duration::from_secs(n));
        }
        if let Some(n) = number("REPAIR_STUCK_CREATED_MINS") {
            config.repair.stuck_created_after = Duration::from_secs(n * 60);
        }
        if let Some(n) = number("REPAIR_STUCK_RUNNING_MINS") {
            config.repair.stuck_running_after = Duration::from_secs(n * 60);
        }
        if let Some(n) = number("RETRY_MAX_RETRIES") {
            config.orchestrator.max_retries = n as u32;
        }
        if let Some(n) = number("RETRY_DEDUPE_TTL_SECS") {
            config.retry.dedupe_ttl = Duration::from_secs(n);
        }
        config
    }
}
