//! Transparency log storage.

use std::sync::{Arc, RwLock};

use super::merkle::MerkleProof;
use super::types::{Anchor, LogEntry};
use crate::error::StoreError;

/// Append-only entry storage. After insert, only the batch fields
/// (`merkle_tree_root`, `merkle_proof`) and the anchor fields change.
#[async_trait::async_trait]
pub trait TransparencyStore: Send + Sync {
    /// Insert `entry`. `Conflict` when its `log_index` is already taken.
    async fn append(&self, entry: &LogEntry) -> Result<(), StoreError>;

    async fn latest(&self) -> Result<Option<LogEntry>, StoreError>;

    async fn get(&self, log_index: u64) -> Result<Option<LogEntry>, StoreError>;

    /// Entries with `start <= log_index <= end`, ascending.
    async fn range(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, StoreError>;

    async fn by_job(&self, job_id: &str) -> Result<Vec<LogEntry>, StoreError>;

    /// Page through the log in index order.
    async fn list(&self, limit: usize, offset: u64) -> Result<Vec<LogEntry>, StoreError>;

    async fn size(&self) -> Result<u64, StoreError>;

    /// Attach a batch root and each entry's proof, keyed by log index.
    async fn set_batch(&self, root: &str, proofs: &[(u64, MerkleProof)]) -> Result<(), StoreError>;

    /// Attach an anchor to every entry in `start..=end`. Returns rows touched.
    async fn set_anchor(&self, start: u64, end: u64, anchor: &Anchor) -> Result<u64, StoreError>;
}

/// In-memory log. Entries live in a `Vec` whose position is the append order.
#[derive(Debug, Default)]
pub struct InMemoryTransparencyStore {
    entries: RwLock<Vec<LogEntry>>,
}

impl InMemoryTransparencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Mutate a stored entry in place (tests simulate tampering with this).
    #[cfg(test)]
    pub(crate) fn tamper(&self, log_index: u64, f: impl FnOnce(&mut LogEntry)) {
        let mut entries = self.entries.write().unwrap();
        let entry = entries.iter_mut().find(|e| e.log_index == log_index).unwrap();
        f(entry);
    }

    /// Swap two stored entries' positions and indices.
    #[cfg(test)]
    pub(crate) fn swap(&self, a: u64, b: u64) {
        let mut entries = self.entries.write().unwrap();
        let (ia, ib) = (a as usize, b as usize);
        entries.swap(ia, ib);
        entries[ia].log_index = a;
        entries[ib].log_index = b;
    }
}

#[async_trait::async_trait]
impl TransparencyStore for InMemoryTransparencyStore {
    async fn append(&self, entry: &LogEntry) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::poisoned())?;
        if entries.iter().any(|e| e.log_index == entry.log_index) {
            return Err(StoreError::Conflict(format!("log index {} already taken", entry.log_index)));
        }
        entries.push(entry.clone());
        Ok(())
    }

    async fn latest(&self) -> Result<Option<LogEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::poisoned())?;
        Ok(entries.iter().max_by_key(|e| e.log_index).cloned())
    }

    async fn get(&self, log_index: u64) -> Result<Option<LogEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::poisoned())?;
        Ok(entries.iter().find(|e| e.log_index == log_index).cloned())
    }

    async fn range(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::poisoned())?;
        let mut found: Vec<LogEntry> = entries
            .iter()
            .filter(|e| (start..=end).contains(&e.log_index))
            .cloned()
            .collect();
        found.sort_by_key(|e| e.log_index);
        Ok(found)
    }

    async fn by_job(&self, job_id: &str) -> Result<Vec<LogEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::poisoned())?;
        let mut found: Vec<LogEntry> = entries.iter().filter(|e| e.job_id == job_id).cloned().collect();
        found.sort_by_key(|e| e.log_index);
        Ok(found)
    }

    async fn list(&self, limit: usize, offset: u64) -> Result<Vec<LogEntry>, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::poisoned())?;
        let mut all: Vec<&LogEntry> = entries.iter().collect();
        all.sort_by_key(|e| e.log_index);
        Ok(all
            .into_iter()
            .skip(usize::try_from(offset).unwrap_or(usize::MAX))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn size(&self) -> Result<u64, StoreError> {
        let entries = self.entries.read().map_err(|_| StoreError::poisoned())?;
        Ok(entries.len() as u64)
    }

    async fn set_batch(&self, root: &str, proofs: &[(u64, MerkleProof)]) -> Result<(), StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::poisoned())?;
        for (log_index, proof) in proofs {
            let entry = entries
                .iter_mut()
                .find(|e| e.log_index == *log_index)
                .ok_or_else(|| StoreError::NotFound(format!("log entry {log_index}")))?;
            entry.merkle_tree_root = Some(root.to_string());
            entry.merkle_proof = Some(proof.clone());
        }
        Ok(())
    }

    async fn set_anchor(&self, start: u64, end: u64, anchor: &Anchor) -> Result<u64, StoreError> {
        let mut entries = self.entries.write().map_err(|_| StoreError::poisoned())?;
        let mut touched = 0;
        for entry in entries.iter_mut().filter(|e| (start..=end).contains(&e.log_index)) {
            entry.anchor_tx_hash = Some(anchor.tx_hash.clone());
            entry.anchor_block_number = Some(anchor.block_number);
            entry.anchor_timestamp = Some(anchor.timestamp);
            touched += 1;
        }
        Ok(touched)
    }
}
