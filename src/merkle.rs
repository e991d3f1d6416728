//! # Merkle builder
//!
//! Binary Merkle tree over block summaries, used for anchors and audit proofs.
//!
//! - Leaf: `SHA256(json(summary))` where the summary is
//!   `{index, hash, timestamp, userId, actionType, points}` (metadata excluded).
//! - Node: `SHA256(left_hex || right_hex)` over the hex strings.
//! - A trailing node without a partner is paired with itself.
//!
//! All digests are lowercase hex strings.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::ledger::{Block, BlockSummary};

#[derive(Debug, Error)]
pub enum MerkleError {
    #[error("cannot build a Merkle tree from zero leaves")]
    EmptyTree,
    #[error("leaf position {position} out of range for {leaves} leaves")]
    LeafOutOfRange { position: usize, leaves: usize },
    #[error("failed to encode leaf: {0}")]
    LeafEncoding(String),
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn leaf_hash(summary: &BlockSummary) -> Result<String, MerkleError> {
    let encoded =
        serde_json::to_string(summary).map_err(|e| MerkleError::LeafEncoding(e.to_string()))?;
    Ok(sha256_hex(encoded.as_bytes()))
}

pub fn node_hash(left: &str, right: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    hex::encode(hasher.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

/// One sibling on the path from a leaf to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofStep {
    pub hash: String,
    /// Which side the sibling sits on relative to the running hash.
    pub side: Side,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    pub leaf: String,
    pub position: usize,
    pub steps: Vec<ProofStep>,
}

fn fold_path(leaf: &str, path: &[ProofStep]) -> String {
    path.iter().fold(leaf.to_string(), |acc, step| match step.side {
        Side::Left => node_hash(&step.hash, &acc),
        Side::Right => node_hash(&acc, &step.hash),
    })
}

/// Checks that `leaf` hashes up to `root` along `path`.
pub fn verify_proof(leaf: &str, path: &[ProofStep], root: &str) -> bool {
    fold_path(leaf, path) == root
}

impl MerkleProof {
    pub fn compute_root(&self) -> String {
        fold_path(&self.leaf, &self.steps)
    }

    pub fn verify(&self, root: &str) -> bool {
        verify_proof(&self.leaf, &self.steps, root)
    }
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    /// `levels[0]` are the leaves, the last level holds only the root.
    levels: Vec<Vec<String>>,
}

impl MerkleTree {
    pub fn from_leaves(leaves: Vec<String>) -> Result<Self, MerkleError> {
        if leaves.is_empty() {
            return Err(MerkleError::EmptyTree);
        }

        let mut levels = vec![leaves];
        while let Some(current) = levels.last().filter(|level| level.len() > 1) {
            let next: Vec<String> = current
                .chunks(2)
                .map(|pair| match pair {
                    [left, right] => node_hash(left, right),
                    [single] => node_hash(single, single),
                    _ => unreachable!("chunks(2) yields one or two items"),
                })
                .collect();
            levels.push(next);
        }
        Ok(MerkleTree { levels })
    }

    /// Builds the tree over `blocks` in the order given.
    pub fn from_blocks(blocks: &[Block]) -> Result<Self, MerkleError> {
        let leaves = blocks
            .iter()
            .map(|b| leaf_hash(&b.summary()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_leaves(leaves)
    }

    pub fn root(&self) -> &str {
        // from_leaves guarantees at least one level with exactly one node at the top
        &self.levels[self.levels.len() - 1][0]
    }

    pub fn leaf_count(&self) -> usize {
        self.levels[0].len()
    }

    pub fn leaves(&self) -> &[String] {
        &self.levels[0]
    }

    pub fn depth(&self) -> usize {
        self.levels.len() - 1
    }

    pub fn proof(&self, position: usize) -> Result<MerkleProof, MerkleError> {
        let leaves = self.leaf_count();
        if position >= leaves {
            return Err(MerkleError::LeafOutOfRange { position, leaves });
        }

        let mut steps = Vec::with_capacity(self.depth());
        let mut idx = position;
        for level in &self.levels[..self.levels.len() - 1] {
            let step = if idx % 2 == 0 {
                // Unpaired trailing node is its own sibling.
                let sibling = level.get(idx + 1).unwrap_or(&level[idx]);
                ProofStep {
                    hash: sibling.clone(),
                    side: Side::Right,
                }
            } else {
                ProofStep {
                    hash: level[idx - 1].clone(),
                    side: Side::Left,
                }
            };
            steps.push(step);
            idx /= 2;
        }

        Ok(MerkleProof {
            leaf: self.levels[0][position].clone(),
            position,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ActionType, Metadata};

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| sha256_hex(format!("leaf-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_empty_tree_rejected() {
        assert!(matches!(MerkleTree::from_leaves(vec![]), Err(MerkleError::EmptyTree)));
    }

    #[test]
    fn test_single_leaf_is_root() {
        let l = leaves(1);
        let tree = MerkleTree::from_leaves(l.clone()).unwrap();
        assert_eq!(tree.root(), l[0]);
        assert_eq!(tree.depth(), 0);
    }

    #[test]
    fn test_odd_node_pairs_with_itself() {
        let l = leaves(3);
        let tree = MerkleTree::from_leaves(l.clone()).unwrap();
        let left = node_hash(&l[0], &l[1]);
        let right = node_hash(&l[2], &l[2]);
        assert_eq!(tree.root(), node_hash(&left, &right));
    }

    #[test]
    fn test_node_hash_is_hex_concatenation() {
        assert_eq!(node_hash("ab", "cd"), sha256_hex(b"abcd"));
    }

    #[test]
    fn test_every_leaf_proof_verifies() {
        for n in [1usize, 2, 3, 5, 8, 13] {
            let tree = MerkleTree::from_leaves(leaves(n)).unwrap();
            for i in 0..n {
                let proof = tree.proof(i).unwrap();
                assert!(proof.verify(tree.root()), "leaf {} of {}", i, n);
            }
        }
    }

    #[test]
    fn test_tampered_proof_fails() {
        let tree = MerkleTree::from_leaves(leaves(6)).unwrap();
        let mut proof = tree.proof(4).unwrap();
        assert!(verify_proof(&proof.leaf, &proof.steps, tree.root()));
        proof.leaf = sha256_hex(b"forged");
        assert!(!proof.verify(tree.root()));
        assert!(matches!(
            tree.proof(6),
            Err(MerkleError::LeafOutOfRange { position: 6, leaves: 6 })
        ));
    }

    #[test]
    fn test_leaf_ignores_metadata() {
        let mut metadata = Metadata::new();
        metadata.insert("note".to_string(), "a".into());
        let a = Block::with_timestamp(
            1,
            "p".to_string(),
            "t".to_string(),
            "u",
            ActionType::WasteSubmission,
            5,
            metadata.clone(),
        );
        let mut b = a.clone();
        b.metadata.insert("note".to_string(), "b".into());
        assert_eq!(leaf_hash(&a.summary()).unwrap(), leaf_hash(&b.summary()).unwrap());

        let mut c = a.clone();
        c.points = 6;
        assert_ne!(leaf_hash(&a.summary()).unwrap(), leaf_hash(&c.summary()).unwrap());
    }
}
