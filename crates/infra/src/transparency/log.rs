//! The transparency log service: chained appends, merkle batches, proofs,
//! integrity verification and anchoring.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::merkle::{MerkleProof, MerkleTree};
use super::store::TransparencyStore;
use super::types::{
    Anchor, BatchSummary, GENESIS_HASH, IntegrityReport, IntegrityViolation, LogEntry, NewLogEntry,
    TransparencyError,
};
use crate::error::StoreError;

const APPEND_ATTEMPTS: u32 = 5;
const VERIFY_PAGE: usize = 1_000;

pub struct TransparencyLog {
    store: Arc<dyn TransparencyStore>,
    /// Serializes appends from this process; other processes are caught by
    /// the store's unique `log_index`.
    append_lock: Mutex<()>,
}

impl TransparencyLog {
    pub fn new(store: Arc<dyn TransparencyStore>) -> Self {
        Self {
            store,
            append_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn TransparencyStore> {
        &self.store
    }

    #[instrument(skip(self, new), fields(job_id = %new.job_id, region = %new.region), err)]
    pub async fn append(&self, new: NewLogEntry) -> Result<LogEntry, TransparencyError> {
        let _guard = self.append_lock.lock().await;
        for attempt in 1..=APPEND_ATTEMPTS {
            let head = self.store.latest().await?;
            let entry = LogEntry::seal(new.clone(), head.as_ref(), Utc::now());
            match self.store.append(&entry).await {
                Ok(()) => {
                    debug!(log_index = entry.log_index, "transparency entry appended");
                    return Ok(entry);
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(log_index = entry.log_index, attempt, "log head moved; retrying append");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(TransparencyError::Contention(APPEND_ATTEMPTS))
    }

    /// Build a merkle tree over `start..=end` and store its root and proofs.
    #[instrument(skip(self), err)]
    pub async fn batch(&self, start: u64, end: u64) -> Result<BatchSummary, TransparencyError> {
        if end < start {
            return Err(TransparencyError::InvalidRange { start, end });
        }
        let entries = self.store.range(start, end).await?;
        let expected = end - start + 1;
        let contiguous = entries
            .iter()
            .zip(start..)
            .all(|(entry, index)| entry.log_index == index);
        if entries.len() as u64 != expected || !contiguous {
            return Err(TransparencyError::IncompleteRange {
                start,
                end,
                expected,
                found: entries.len() as u64,
            });
        }

        let leaves: Vec<&str> = entries.iter().map(|e| e.merkle_leaf_hash.as_str()).collect();
        let tree = MerkleTree::build(&leaves).ok_or(TransparencyError::InvalidRange { start, end })?;
        let proofs: Vec<(u64, MerkleProof)> = entries
            .iter()
            .enumerate()
            .filter_map(|(i, entry)| tree.proof(i).map(|p| (entry.log_index, p)))
            .collect();
        self.store.set_batch(tree.root(), &proofs).await?;

        info!(start, end, root = %tree.root(), "merkle batch sealed");
        Ok(BatchSummary {
            start,
            end,
            size: tree.len(),
            root: tree.root().to_string(),
        })
    }

    /// An entry together with its inclusion proof, once it has been batched.
    pub async fn proof_for(&self, log_index: u64) -> Result<(LogEntry, Option<MerkleProof>), TransparencyError> {
        let entry = self
            .store
            .get(log_index)
            .await?
            .ok_or(TransparencyError::NotFound(log_index))?;
        let proof = entry.merkle_proof.clone();
        Ok((entry, proof))
    }

    /// Walk the whole log in index order, recomputing every leaf hash and
    /// checking every chain link and index. Stops at the first violation.
    #[instrument(skip(self), err)]
    pub async fn verify_integrity(&self) -> Result<IntegrityReport, TransparencyError> {
        let mut expected_index = 0u64;
        let mut previous_hash = GENESIS_HASH.to_string();

        loop {
            let page = self.store.list(VERIFY_PAGE, expected_index).await?;
            if page.is_empty() {
                break;
            }
            for entry in &page {
                let violation = if entry.log_index != expected_index {
                    Some(IntegrityViolation::IndexGap {
                        expected: expected_index,
                        found: entry.log_index,
                    })
                } else if entry.compute_leaf_hash() != entry.merkle_leaf_hash {
                    Some(IntegrityViolation::LeafHashMismatch {
                        log_index: entry.log_index,
                    })
                } else if entry.previous_log_hash != previous_hash {
                    Some(IntegrityViolation::BrokenChain {
                        log_index: entry.log_index,
                    })
                } else {
                    None
                };
                if let Some(violation) = violation {
                    warn!(?violation, "transparency log integrity violation");
                    return Ok(IntegrityReport {
                        valid: false,
                        checked: expected_index,
                        violation: Some(violation),
                    });
                }
                previous_hash = entry.merkle_leaf_hash.clone();
                expected_index += 1;
            }
        }

        Ok(IntegrityReport {
            valid: true,
            checked: expected_index,
            violation: None,
        })
    }

    /// Attach an external anchor to `start..=end`. Never blocks appends.
    #[instrument(skip(self, tx_hash), err)]
    pub async fn anchor(
        &self,
        start: u64,
        end: u64,
        tx_hash: impl Into<String>,
        block_number: i64,
        timestamp: DateTime<Utc>,
    ) -> Result<u64, TransparencyError> {
        if end < start {
            return Err(TransparencyError::InvalidRange { start, end });
        }
        let anchor = Anchor {
            tx_hash: tx_hash.into(),
            block_number,
            timestamp,
        };
        let touched = self.store.set_anchor(start, end, &anchor).await?;
        info!(start, end, touched, tx_hash = %anchor.tx_hash, "log range anchored");
        Ok(touched)
    }

    pub async fn size(&self) -> Result<u64, TransparencyError> {
        Ok(self.store.size().await?)
    }

    pub async fn latest(&self) -> Result<Option<LogEntry>, TransparencyError> {
        Ok(self.store.latest().await?)
    }

    pub async fn by_job(&self, job_id: &str) -> Result<Vec<LogEntry>, TransparencyError> {
        Ok(self.store.by_job(job_id).await?)
    }

    pub async fn range(&self, start: u64, end: u64) -> Result<Vec<LogEntry>, TransparencyError> {
        if end < start {
            return Err(TransparencyError::InvalidRange { start, end });
        }
        Ok(self.store.range(start, end).await?)
    }

    pub async fn list(&self, limit: usize, offset: u64) -> Result<Vec<LogEntry>, TransparencyError> {
        Ok(self.store.list(limit, offset).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transparency::store::InMemoryTransparencyStore;

    fn new_entry(i: usize) -> NewLogEntry {
        NewLogEntry {
            execution_id: format!("unit-{i}"),
            job_id: if i % 2 == 0 { "job-even".into() } else { "job-odd".into() },
            region: "US".into(),
            provider_id: "prov".into(),
            status: "completed".into(),
            output_hash: format!("out-{i}"),
            receipt_hash: format!("rcpt-{i}"),
            ipfs_cid: None,
        }
    }

    async fn seeded(n: usize) -> (Arc<InMemoryTransparencyStore>, TransparencyLog) {
        let store = InMemoryTransparencyStore::arc();
        let log = TransparencyLog::new(store.clone());
        for i in 0..n {
            log.append(new_entry(i)).await.unwrap();
        }
        (store, log)
    }

    #[tokio::test]
    async fn appends_are_contiguous_and_chained() {
        let (_, log) = seeded(4).await;
        let entries = log.range(0, 3).await.unwrap();

        assert_eq!(entries.iter().map(|e| e.log_index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(entries[0].previous_log_hash, GENESIS_HASH);
        for pair in entries.windows(2) {
            assert_eq!(pair[1].previous_log_hash, pair[0].merkle_leaf_hash);
        }
        assert_eq!(log.by_job("job-odd").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_appends_never_share_an_index() {
        let log = Arc::new(TransparencyLog::new(InMemoryTransparencyStore::arc()));
        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let log = Arc::clone(&log);
            tasks.spawn(async move { log.append(new_entry(i)).await.unwrap().log_index });
        }
        let mut indices = Vec::new();
        while let Some(index) = tasks.join_next().await {
            indices.push(index.unwrap());
        }
        indices.sort();
        assert_eq!(indices, (0..16).collect::<Vec<u64>>());
        assert!(log.verify_integrity().await.unwrap().valid);
    }

    #[tokio::test]
    async fn clean_log_verifies() {
        let (_, log) = seeded(5).await;
        let report = log.verify_integrity().await.unwrap();
        assert!(report.valid);
        assert_eq!(report.checked, 5);
    }

    #[tokio::test]
    async fn tampered_field_is_detected() {
        let (store, log) = seeded(5).await;
        store.tamper(2, |e| e.output_hash = "forged".into());

        let report = log.verify_integrity().await.unwrap();
        assert!(!report.valid);
        assert_eq!(report.violation, Some(IntegrityViolation::LeafHashMismatch { log_index: 2 }));
    }

    #[tokio::test]
    async fn swapped_entries_are_detected() {
        let (store, log) = seeded(5).await;
        store.swap(1, 3);

        let report = log.verify_integrity().await.unwrap();
        assert!(!report.valid);
        assert!(matches!(
            report.violation,
            Some(IntegrityViolation::LeafHashMismatch { log_index: 1 })
        ));
    }

    #[tokio::test]
    async fn batch_proofs_verify_against_their_own_root_only() {
        let (_, log) = seeded(7).await;
        let first = log.batch(0, 3).await.unwrap();
        let second = log.batch(4, 6).await.unwrap();
        assert_ne!(first.root, second.root);

        let (entry, proof) = log.proof_for(2).await.unwrap();
        let proof = proof.unwrap();
        assert_eq!(proof.leaf_hash, entry.merkle_leaf_hash);
        assert_eq!(entry.merkle_tree_root.as_deref(), Some(first.root.as_str()));
        assert!(proof.verify_against(&first.root));
        assert!(!proof.verify_against(&second.root));
    }

    #[tokio::test]
    async fn batch_rejects_missing_entries() {
        let (_, log) = seeded(3).await;
        assert!(matches!(
            log.batch(1, 5).await,
            Err(TransparencyError::IncompleteRange { expected: 5, found: 2, .. })
        ));
        assert!(matches!(log.batch(2, 1).await, Err(TransparencyError::InvalidRange { .. })));
    }

    #[tokio::test]
    async fn anchoring_touches_only_the_range() {
        let (_, log) = seeded(4).await;
        let touched = log.anchor(1, 2, "0xabc", 42, Utc::now()).await.unwrap();
        assert_eq!(touched, 2);

        let entries = log.range(0, 3).await.unwrap();
        assert!(entries[0].anchor_tx_hash.is_none());
        assert_eq!(entries[1].anchor_tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(entries[2].anchor_block_number, Some(42));
        assert!(entries[3].anchor_tx_hash.is_none());
        assert!(log.verify_integrity().await.unwrap().valid);
    }
}
