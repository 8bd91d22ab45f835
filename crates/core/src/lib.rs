//! `beacon-core` - shared primitives for the job-lifecycle engine.
//!
//! This crate holds **pure** building blocks (identifiers, error model) with no
//! storage or runtime concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{ExecutionId, JobId, UnitId};
