//! Transactional outbox: durable, at-least-once announcement of new jobs.
//!
//! ## Design
//!
//! - Outbox rows are written in the same transaction as the job (see `jobs`)
//! - A publisher drains unpublished rows in insertion (`id`) order
//! - Each row is dispatched, then marked published; rows are never deleted
//! - Dispatch is at-least-once, so consumers must be idempotent per job
//!
//! ## Components
//!
//! - `OutboxStore`: fetch / mark / stats (in-memory or Postgres)
//! - `Dispatcher`: where published messages go (`ChannelDispatcher` feeds the orchestrator)
//! - `OutboxPublisher`: the polling loop with an explicit start/stop lifecycle

pub mod postgres;
pub mod publisher;
pub mod store;
pub mod types;

pub use postgres::PostgresOutboxStore;
pub use publisher::{
    ChannelDispatcher, DispatchError, Dispatcher, OutboxPublisher, PublisherConfig, PublisherHandle,
    PublisherStats,
};
pub use store::OutboxStore;
pub use types::{JobDispatch, OutboxMessage, OutboxStats, TOPIC_JOB_CREATED};
