use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::block::{Tip, GENESIS_PREV_HASH};
use super::chain::Ledger;
use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RepairedField {
    PrevHash,
    Hash,
}

/// One field rewritten by a repair pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldRepair {
    pub index: u64,
    pub field: RepairedField,
    pub old_value: String,
    pub new_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub success: bool,
    pub repaired_count: u64,
    pub latest_hash: String,
    pub changes: Vec<FieldRepair>,
}

impl Ledger {
    /// Re-seals the chain: rewrites every `prevHash` and `hash` that does not
    /// follow from the block's stored fields and its predecessor, then points
    /// the tip at the last block.
    ///
    /// This restores structural consistency only. Tampered `points` or
    /// `metadata` are hashed over as-is and become part of the re-sealed
    /// chain. Safe to re-run after an interrupted pass; a second run on a
    /// repaired chain changes nothing.
    pub fn repair_chain(&self) -> Result<RepairReport, LedgerError> {
        let _guard = self.maintenance.write();
        let batch = self.settings().verify_batch_size.max(1);

        let mut previous_hash = GENESIS_PREV_HASH.to_string();
        let mut last_index = None;
        let mut repaired_count = 0u64;
        let mut changes = Vec::new();
        let mut start = 0u64;

        loop {
            let page = self.persistence().blocks_from(start, batch)?;
            let page_len = page.len();

            for mut block in page {
                let mut changed = false;

                let expected_prev = if block.index == 0 {
                    GENESIS_PREV_HASH.to_string()
                } else {
                    previous_hash.clone()
                };
                if block.prev_hash != expected_prev {
                    warn!(
                        index = block.index,
                        old = %block.prev_hash,
                        new = %expected_prev,
                        "ledger.repair: prevHash corrected"
                    );
                    changes.push(FieldRepair {
                        index: block.index,
                        field: RepairedField::PrevHash,
                        old_value: block.prev_hash.clone(),
                        new_value: expected_prev.clone(),
                    });
                    block.prev_hash = expected_prev;
                    changed = true;
                }

                let computed = block.calculate_hash();
                if block.hash != computed {
                    warn!(
                        index = block.index,
                        old = %block.hash,
                        new = %computed,
                        "ledger.repair: hash corrected"
                    );
                    changes.push(FieldRepair {
                        index: block.index,
                        field: RepairedField::Hash,
                        old_value: block.hash.clone(),
                        new_value: computed.clone(),
                    });
                    block.hash = computed;
                    changed = true;
                }

                if changed {
                    self.persistence().update_block(&block)?;
                    repaired_count += 1;
                }

                previous_hash = block.hash;
                start = block.index + 1;
                last_index = Some(block.index);
            }

            if page_len < batch {
                break;
            }
        }

        // An empty ledger has nothing to point a tip at.
        if let Some(current_index) = last_index {
            self.persistence().set_tip(&Tip {
                latest_hash: previous_hash.clone(),
                current_index,
            })?;
        }

        info!(repaired_count, latest_hash = %previous_hash, "ledger.repair complete");
        Ok(RepairReport {
            success: true,
            repaired_count,
            latest_hash: previous_hash,
            changes,
        })
    }
}
