//! Published checkpoints of ledger state.
//!
//! An anchor freezes `(latestHash, blockCount)` plus a Merkle root over the
//! most recent blocks. Anchors are append-only; the newest is mirrored into a
//! singleton slot for constant-time lookup.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::ledger::{current_timestamp, Ledger};
use crate::merkle::{sha256_hex, MerkleTree};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    pub id: String,
    pub published_at: String,
    pub latest_hash: String,
    pub block_count: u64,
    pub latest_block_index: u64,
    pub merkle_root: Option<String>,
    pub merkle_block_count: Option<u64>,
    pub merkle_enabled: bool,
}

impl Anchor {
    fn derive_id(latest_hash: &str, block_count: u64, published_at: &str) -> String {
        let digest = sha256_hex(format!("{}|{}|{}", latest_hash, block_count, published_at).as_bytes());
        digest[..16].to_string()
    }
}

/// Why an anchor check passed or failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnchorReason {
    Match { index: u64 },
    EmptyAnchor,
    ChainTooShort { chain_length: u64, required: u64 },
    BlockNotFound { index: u64 },
    HashMismatch { index: u64, expected: String, actual: String },
}

impl fmt::Display for AnchorReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AnchorReason::Match { index } => {
                write!(f, "Block {} matches the anchored hash", index)
            }
            AnchorReason::EmptyAnchor => write!(f, "Anchor covers no blocks"),
            AnchorReason::ChainTooShort {
                chain_length,
                required,
            } => write!(
                f,
                "Chain too short: {} blocks present, anchor requires {}",
                chain_length, required
            ),
            AnchorReason::BlockNotFound { index } => {
                write!(f, "Anchored block index {} not found", index)
            }
            AnchorReason::HashMismatch {
                index,
                expected,
                actual,
            } => write!(
                f,
                "Hash mismatch at block {}: anchor {} vs stored {}",
                index, expected, actual
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorCheck {
    pub valid: bool,
    pub reason: AnchorReason,
    pub message: String,
}

impl From<AnchorReason> for AnchorCheck {
    fn from(reason: AnchorReason) -> Self {
        AnchorCheck {
            valid: matches!(reason, AnchorReason::Match { .. }),
            message: reason.to_string(),
            reason,
        }
    }
}

impl Ledger {
    /// Merkle tree over the most recent `merkle_window` blocks, oldest first.
    pub fn current_merkle_tree(&self) -> Result<MerkleTree, LedgerError> {
        let window = self.persistence().recent_blocks(self.settings().merkle_window.max(1))?;
        Ok(MerkleTree::from_blocks(&window)?)
    }

    /// Merkle tree over the `merkle_window` blocks ending at `last_index`.
    pub fn merkle_tree_through(&self, last_index: u64) -> Result<MerkleTree, LedgerError> {
        let window = self.settings().merkle_window.max(1);
        let start = (last_index + 1).saturating_sub(window as u64);
        let mut blocks = self.persistence().blocks_from(start, window)?;
        blocks.retain(|b| b.index <= last_index);
        Ok(MerkleTree::from_blocks(&blocks)?)
    }

    /// Root and leaf count of the window ending at `last_index`. Only a
    /// Merkle failure degrades to `(None, None)`; store errors propagate.
    pub(crate) fn merkle_snapshot(
        &self,
        last_index: u64,
    ) -> Result<(Option<String>, Option<u64>), LedgerError> {
        match self.merkle_tree_through(last_index) {
            Ok(tree) => Ok((Some(tree.root().to_string()), Some(tree.leaf_count() as u64))),
            Err(LedgerError::MerkleGenerationFailure(e)) => {
                warn!(error = %e, last_index, "Merkle root unavailable");
                Ok((None, None))
            }
            Err(e) => Err(e),
        }
    }

    /// Publishes a new anchor. Requires a non-empty chain that verifies clean;
    /// a Merkle failure only drops the Merkle fields.
    ///
    /// Everything is derived from one tip read: the chain is verified through
    /// that tip and the Merkle window ends at it, so appends racing the publish
    /// never leak into the anchor. Repair is held off for the duration.
    pub fn publish_anchor(&self) -> Result<Anchor, LedgerError> {
        let _guard = self.maintenance.read();
        let tip = self.tip()?.ok_or(LedgerError::ChainEmpty)?;
        self.verify_chain_through(tip.current_index)?.into_result()?;

        let (merkle_root, merkle_block_count) = self.merkle_snapshot(tip.current_index)?;
        if merkle_root.is_none() {
            warn!(latest_index = tip.current_index, "anchor published without Merkle root");
        }

        let block_count = tip.current_index + 1;
        let published_at = current_timestamp();
        let anchor = Anchor {
            id: Anchor::derive_id(&tip.latest_hash, block_count, &published_at),
            published_at,
            latest_hash: tip.latest_hash,
            block_count,
            latest_block_index: tip.current_index,
            merkle_enabled: merkle_root.is_some(),
            merkle_root,
            merkle_block_count,
        };

        self.persistence().save_anchor(&anchor)?;
        info!(
            id = %anchor.id,
            block_count = anchor.block_count,
            latest_hash = %anchor.latest_hash,
            merkle_root = ?anchor.merkle_root,
            "ledger.anchor published"
        );
        Ok(anchor)
    }

    pub fn latest_anchor(&self) -> Result<Option<Anchor>, LedgerError> {
        self.persistence().latest_anchor()
    }

    /// Most recent first.
    pub fn list_anchors(&self, limit: usize) -> Result<Vec<Anchor>, LedgerError> {
        self.persistence().list_anchors(limit)
    }

    /// Checks that the block at `anchor_block_count - 1` still carries
    /// `anchor_hash`. Historical anchors stay provable as the chain grows.
    pub fn verify_against_anchor(
        &self,
        anchor_hash: &str,
        anchor_block_count: u64,
    ) -> Result<AnchorCheck, LedgerError> {
        if anchor_block_count == 0 {
            return Ok(AnchorReason::EmptyAnchor.into());
        }

        let chain_length = self.block_count()?;
        if chain_length < anchor_block_count {
            return Ok(AnchorReason::ChainTooShort {
                chain_length,
                required: anchor_block_count,
            }
            .into());
        }

        let index = anchor_block_count - 1;
        let reason = match self.persistence().block_at(index)? {
            None => AnchorReason::BlockNotFound { index },
            Some(block) if block.hash == anchor_hash => AnchorReason::Match { index },
            Some(block) => AnchorReason::HashMismatch {
                index,
                expected: anchor_hash.to_string(),
                actual: block.hash,
            },
        };
        Ok(reason.into())
    }

    /// Checks the current chain against the latest published anchor, if any.
    pub fn verify_latest_anchor(&self) -> Result<Option<AnchorCheck>, LedgerError> {
        match self.latest_anchor()? {
            Some(anchor) => self
                .verify_against_anchor(&anchor.latest_hash, anchor.block_count)
                .map(Some),
            None => Ok(None),
        }
    }
}
