//! Hash-chained, merkle-batched transparency log of execution results.
//!
//! ## Structure
//!
//! - Every entry carries the previous entry's leaf hash (genesis: 64 zeros)
//! - Contiguous index ranges are sealed into merkle batches; each entry then
//!   carries the batch root and its own inclusion proof
//! - Ranges can be anchored to an external reference (e.g. a chain tx)
//!
//! Entries are append-only: only batch and anchor fields are ever attached
//! after insert.

pub mod log;
pub mod merkle;
pub mod postgres;
pub mod store;
pub mod types;

pub use log::TransparencyLog;
pub use merkle::{MerkleProof, MerkleTree};
pub use postgres::PostgresTransparencyStore;
pub use store::{InMemoryTransparencyStore, TransparencyStore};
pub use types::{
    Anchor, BatchSummary, GENESIS_HASH, IntegrityReport, IntegrityViolation, LogEntry, NewLogEntry,
    TransparencyError,
};
