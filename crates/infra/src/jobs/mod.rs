//! Job records: creation (with idempotency + outbox), status, and stuck-job queries.
//!
//! ## Components
//!
//! - `JobRecord` / `JobStatus`: the persisted job and its lifecycle
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `RetryPolicy`: backoff used by the background workers

pub mod postgres;
pub mod store;
pub mod types;

pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore};
pub use types::{
    BackoffStrategy, CreateOutcome, JobRecord, JobStatus, NewJob, RetryPolicy, StuckCriteria,
    StuckJob, StuckJobStats,
};
