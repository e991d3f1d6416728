use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use super::block::{Block, GENESIS_PREV_HASH};
use super::chain::Ledger;
use crate::error::LedgerError;

/// A single violated condition on a stored block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockIssue {
    /// Stored hash differs from the hash recomputed over the stored fields.
    HashMismatch { stored: String, computed: String },
    /// `prevHash` does not name the previous block's stored hash.
    BrokenLink { expected: String, found: String },
    /// `index` differs from the block's position in the sequence.
    IndexMismatch { expected: u64, found: u64 },
}

impl fmt::Display for BlockIssue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BlockIssue::HashMismatch { stored, computed } => {
                write!(f, "hash mismatch (stored {}, computed {})", stored, computed)
            }
            BlockIssue::BrokenLink { expected, found } => {
                write!(f, "broken link (expected prevHash {}, found {})", expected, found)
            }
            BlockIssue::IndexMismatch { expected, found } => {
                write!(f, "index mismatch (expected {}, found {})", expected, found)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockDiagnosis {
    pub index: u64,
    pub issues: Vec<BlockIssue>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationReport {
    pub valid: bool,
    pub message: String,
    pub block_count: u64,
    pub invalid_block_indices: Vec<u64>,
    pub details: Vec<BlockDiagnosis>,
}

impl VerificationReport {
    pub fn invalid_count(&self) -> usize {
        self.invalid_block_indices.len()
    }

    /// Converts a failed report into `ChainInvalid`.
    pub fn into_result(self) -> Result<Self, LedgerError> {
        if self.valid {
            Ok(self)
        } else {
            Err(LedgerError::ChainInvalid {
                message: self.message,
                invalid_indices: self.invalid_block_indices,
            })
        }
    }
}

/// Checks one block against the hash of the block before it (`None` at the
/// start of the sequence) and its expected position. Returns every violated
/// condition.
pub fn check_block(block: &Block, previous_hash: Option<&str>, position: u64) -> Vec<BlockIssue> {
    let mut issues = Vec::new();

    let computed = block.calculate_hash();
    if computed != block.hash {
        issues.push(BlockIssue::HashMismatch {
            stored: block.hash.clone(),
            computed,
        });
    }

    let expected_prev = previous_hash.unwrap_or(GENESIS_PREV_HASH);
    if block.prev_hash != expected_prev {
        issues.push(BlockIssue::BrokenLink {
            expected: expected_prev.to_string(),
            found: block.prev_hash.clone(),
        });
    }

    if block.index != position {
        issues.push(BlockIssue::IndexMismatch {
            expected: position,
            found: block.index,
        });
    }

    issues
}

/// Incremental verifier. Feeding blocks in ascending order across any number
/// of pages yields the same report as a single pass.
#[derive(Debug, Default)]
pub struct ChainWalker {
    previous_hash: Option<String>,
    position: u64,
    details: Vec<BlockDiagnosis>,
}

impl ChainWalker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, block: &Block) {
        let issues = check_block(block, self.previous_hash.as_deref(), self.position);
        if !issues.is_empty() {
            self.details.push(BlockDiagnosis {
                index: block.index,
                issues,
            });
        }
        self.previous_hash = Some(block.hash.clone());
        self.position += 1;
    }

    pub fn finish(self) -> VerificationReport {
        let block_count = self.position;
        let mut invalid_block_indices: Vec<u64> = self.details.iter().map(|d| d.index).collect();
        invalid_block_indices.sort_unstable();
        invalid_block_indices.dedup();

        let valid = self.details.is_empty();
        let message = if block_count == 0 {
            "Ledger is empty; nothing to verify".to_string()
        } else if valid {
            format!("Chain valid: {} blocks verified", block_count)
        } else {
            format!(
                "Chain integrity compromised: {} of {} blocks invalid",
                invalid_block_indices.len(),
                block_count
            )
        };

        VerificationReport {
            valid,
            message,
            block_count,
            invalid_block_indices,
            details: self.details,
        }
    }
}

/// Verifies an in-memory sequence, ordered by index ascending.
pub fn verify_blocks(blocks: &[Block]) -> VerificationReport {
    let mut walker = ChainWalker::new();
    for block in blocks {
        walker.observe(block);
    }
    walker.finish()
}

impl Ledger {
    /// Walks the whole ledger in pages of `verify_batch_size`.
    pub fn verify_chain(&self) -> Result<VerificationReport, LedgerError> {
        self.walk_chain(None)
    }

    /// Verifies blocks `0..=last_index` only. Blocks appended past
    /// `last_index` while the walk runs are not observed.
    pub fn verify_chain_through(&self, last_index: u64) -> Result<VerificationReport, LedgerError> {
        self.walk_chain(Some(last_index))
    }

    fn walk_chain(&self, through: Option<u64>) -> Result<VerificationReport, LedgerError> {
        let batch = self.settings().verify_batch_size.max(1);
        let mut walker = ChainWalker::new();
        let mut start = 0u64;

        'pages: loop {
            let page = self.persistence().blocks_from(start, batch)?;
            let Some(last) = page.last() else { break };
            let next_start = last.index + 1;
            for block in &page {
                if through.is_some_and(|limit| block.index > limit) {
                    break 'pages;
                }
                walker.observe(block);
            }
            if page.len() < batch {
                break;
            }
            start = next_start;
        }

        let report = walker.finish();
        for diagnosis in &report.details {
            for issue in &diagnosis.issues {
                warn!(index = diagnosis.index, %issue, "ledger.verify: invalid block");
            }
        }
        Ok(report)
    }

    /// Verifies a single block against its stored predecessor.
    pub fn verify_block(&self, index: u64) -> Result<Vec<BlockIssue>, LedgerError> {
        let block = self.block(index)?;
        let previous = match index {
            0 => None,
            _ => Some(self.block(index - 1)?.hash),
        };
        Ok(check_block(&block, previous.as_deref(), index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LedgerConfig;
    use crate::ledger::{ActionType, Metadata};
    use crate::persistence::{InMemoryPersistence, Persistence};
    use std::sync::Arc;

    fn build_chain(n: u64) -> Vec<Block> {
        let mut blocks: Vec<Block> = Vec::new();
        for i in 0..n {
            let prev = blocks
                .last()
                .map(|b| b.hash.clone())
                .unwrap_or_else(|| GENESIS_PREV_HASH.to_string());
            let mut metadata = Metadata::new();
            metadata.insert("seq".to_string(), (i as i64).into());
            blocks.push(Block::with_timestamp(
                i,
                prev,
                format!("2024-01-01T00:00:{:02}.000Z", i),
                if i == 0 { "SYSTEM" } else { "user-1" },
                if i == 0 { ActionType::Genesis } else { ActionType::WasteSubmission },
                if i == 0 { 0 } else { 10 },
                metadata,
            ));
        }
        blocks
    }

    #[test]
    fn test_empty_chain_is_vacuously_valid() {
        let report = verify_blocks(&[]);
        assert!(report.valid);
        assert_eq!(report.block_count, 0);
        assert!(report.invalid_block_indices.is_empty());
    }

    #[test]
    fn test_valid_chain() {
        let report = verify_blocks(&build_chain(5));
        assert!(report.valid);
        assert_eq!(report.block_count, 5);
        assert!(report.details.is_empty());
        assert_eq!(report.message, "Chain valid: 5 blocks verified");
    }

    #[test]
    fn test_field_tamper_is_hash_mismatch_only() {
        let mut blocks = build_chain(4);
        blocks[2].metadata.insert("seq".to_string(), 99i64.into());
        let report = verify_blocks(&blocks);
        assert!(!report.valid);
        assert_eq!(report.invalid_block_indices, vec![2]);
        assert!(matches!(
            report.details[0].issues.as_slice(),
            [BlockIssue::HashMismatch { .. }]
        ));
    }

    #[test]
    fn test_prev_hash_corruption_reports_both_issues() {
        let mut blocks = build_chain(4);
        blocks[1].prev_hash = "corrupted".to_string();
        let report = verify_blocks(&blocks);
        assert_eq!(report.invalid_block_indices, vec![1]);
        let issues = &report.details[0].issues;
        assert!(issues.iter().any(|i| matches!(i, BlockIssue::BrokenLink { .. })));
        assert!(issues.iter().any(|i| matches!(i, BlockIssue::HashMismatch { .. })));
    }

    #[test]
    fn test_rehashed_tamper_breaks_successor_link() {
        let mut blocks = build_chain(4);
        blocks[1].points = 10_000;
        blocks[1].hash = blocks[1].calculate_hash();
        let report = verify_blocks(&blocks);
        assert_eq!(report.invalid_block_indices, vec![2]);
        assert!(matches!(
            report.details[0].issues.as_slice(),
            [BlockIssue::BrokenLink { .. }]
        ));
    }

    #[test]
    fn test_index_gap_detected() {
        let mut blocks = build_chain(3);
        blocks.remove(1);
        let report = verify_blocks(&blocks);
        assert!(!report.valid);
        let issues = &report.details[0].issues;
        assert_eq!(report.details[0].index, 2);
        assert!(issues.contains(&BlockIssue::IndexMismatch { expected: 1, found: 2 }));
        assert!(issues.iter().any(|i| matches!(i, BlockIssue::BrokenLink { .. })));
    }

    #[test]
    fn test_paged_walk_matches_single_pass() {
        let store = Arc::new(InMemoryPersistence::new());
        let blocks = build_chain(7);
        let mut tip = None;
        for block in &blocks {
            store.compare_and_append(tip.as_ref(), block).unwrap();
            tip = store.load_tip().unwrap();
        }
        let mut tampered = blocks[5].clone();
        tampered.user_id = "mallory".to_string();
        store.update_block(&tampered).unwrap();

        let settings = LedgerConfig {
            verify_batch_size: 2,
            ..LedgerConfig::default()
        };
        let ledger = Ledger::with_config(store.clone(), settings);
        let paged = ledger.verify_chain().unwrap();

        let mut all = blocks.clone();
        all[5] = tampered;
        assert_eq!(paged, verify_blocks(&all));
        assert_eq!(paged.invalid_block_indices, vec![5]);
        assert_eq!(paged.block_count, 7);

        assert!(ledger.verify_block(4).unwrap().is_empty());
        assert!(!ledger.verify_block(5).unwrap().is_empty());
    }

    #[test]
    fn test_verify_through_ignores_later_blocks() {
        let store = Arc::new(InMemoryPersistence::new());
        let blocks = build_chain(6);
        let mut tip = None;
        for block in &blocks {
            store.compare_and_append(tip.as_ref(), block).unwrap();
            tip = store.load_tip().unwrap();
        }
        let mut tampered = blocks[4].clone();
        tampered.points = 7_777;
        store.update_block(&tampered).unwrap();

        let settings = LedgerConfig {
            verify_batch_size: 2,
            ..LedgerConfig::default()
        };
        let ledger = Ledger::with_config(store, settings);
        let prefix = ledger.verify_chain_through(2).unwrap();
        assert!(prefix.valid);
        assert_eq!(prefix.block_count, 3);
        assert_eq!(prefix, verify_blocks(&blocks[..3]));

        let full = ledger.verify_chain_through(5).unwrap();
        assert_eq!(full.invalid_block_indices, vec![4]);
        assert_eq!(full.block_count, 6);
    }

    #[test]
    fn test_into_result_maps_to_chain_invalid() {
        let mut blocks = build_chain(2);
        blocks[1].points = -1;
        let err = verify_blocks(&blocks).into_result().unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ChainInvalid { ref invalid_indices, .. } if invalid_indices == &vec![1]
        ));
    }
}
