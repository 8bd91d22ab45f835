//! Binary SHA-256 Merkle tree over hex leaf hashes.
//!
//! - leaf node: `sha256(leaf_hash)` (the hex string's bytes)
//! - parent: `sha256(left_hex ++ right_hex)`
//! - an odd node at any level is paired with itself

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn parent(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

/// Inclusion proof for one leaf of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MerkleProof {
    /// The entry's leaf hash (before leaf-node hashing).
    pub leaf_hash: String,
    /// Position within the batch.
    pub leaf_index: usize,
    pub siblings: Vec<String>,
    /// `true` when the sibling sits on the right.
    pub directions: Vec<bool>,
    pub root_hash: String,
}

impl MerkleProof {
    /// Fold the path and compare with the root the proof claims.
    pub fn verify(&self) -> bool {
        self.verify_against(&self.root_hash)
    }

    /// Fold the path and compare with an independently known root.
    pub fn verify_against(&self, root: &str) -> bool {
        if self.siblings.len() != self.directions.len() {
            return false;
        }
        let folded = self
            .siblings
            .iter()
            .zip(&self.directions)
            .fold(sha256_hex(self.leaf_hash.as_bytes()), |node, (sibling, right)| {
                if *right { parent(&node, sibling) } else { parent(sibling, &node) }
            });
        folded == root
    }
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    leaf_hashes: Vec<String>,
    /// levels[0] are leaf nodes; the last level holds the root.
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    /// Build a tree over entry leaf hashes. Returns `None` for an empty batch.
    pub fn build<S: AsRef<str>>(leaf_hashes: &[S]) -> Option<Self> {
        if leaf_hashes.is_empty() {
            return None;
        }
        let leaf_hashes: Vec<String> = leaf_hashes.iter().map(|h| h.as_ref().to_string()).collect();
        let mut levels = vec![leaf_hashes.iter().map(|h| sha256_hex(h.as_bytes())).collect::<Vec<_>>()];

        while levels.last().is_some_and(|level| level.len() > 1) {
            let current = &levels[levels.len() - 1];
            let next = current
                .chunks(2)
                .map(|pair| parent(&pair[0], pair.get(1).unwrap_or(&pair[0])))
                .collect();
            levels.push(next);
        }
        Some(Self { leaf_hashes, levels })
    }

    pub fn root(&self) -> &str {
        self.levels
            .last()
            .and_then(|level| level.first())
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.leaf_hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_hashes.is_empty()
    }

    pub fn proof(&self, leaf_index: usize) -> Option<MerkleProof> {
        let leaf_hash = self.leaf_hashes.get(leaf_index)?.clone();
        let mut siblings = Vec::with_capacity(self.levels.len());
        let mut directions = Vec::with_capacity(self.levels.len());

        let mut index = leaf_index;
        for level in &self.levels[..self.levels.len() - 1] {
            let sibling_index = index ^ 1;
            let sibling = level.get(sibling_index).unwrap_or(&level[index]);
            siblings.push(sibling.clone());
            directions.push(index % 2 == 0);
            index /= 2;
        }

        Some(MerkleProof {
            leaf_hash,
            leaf_index,
            siblings,
            directions,
            root_hash: self.root().to_string(),
        })
    }
}
