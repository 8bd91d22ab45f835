//! Infrastructure layer: stores, background workers, and the execution pipeline.
//!
//! Every store is a trait with an in-memory implementation (tests/dev) and a
//! Postgres implementation (production). Cross-process coordination goes
//! through [`coordination::CoordinationStore`].

pub mod config;
pub mod coordination;
pub mod db;
pub mod error;
pub mod intake;
pub mod jobs;
pub mod orchestrator;
pub mod outbox;
pub mod repair;
pub mod retry;
pub mod transparency;

pub use error::StoreError;

#[cfg(test)]
mod integration_tests;
