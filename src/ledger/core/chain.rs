use parking_lot::RwLock;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::block::{ActionType, Block, MetaValue, Metadata, Tip, GENESIS_PREV_HASH};
use super::validation::check_block;
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::persistence::{CommitOutcome, Persistence};

/// The ledger core: append, genesis, and read access over a persistence
/// backend. Verification, repair, anchoring, reconciliation and audit proofs
/// are implemented on this type in their own modules.
pub struct Ledger {
    persistence: Arc<dyn Persistence>,
    settings: LedgerConfig,
    /// Appends hold this shared; repair and genesis reset hold it exclusively.
    pub(crate) maintenance: RwLock<()>,
}

impl Ledger {
    pub fn new(persistence: Arc<dyn Persistence>) -> Self {
        Self::with_config(persistence, LedgerConfig::default())
    }

    pub fn with_config(persistence: Arc<dyn Persistence>, settings: LedgerConfig) -> Self {
        Ledger {
            persistence,
            settings,
            maintenance: RwLock::new(()),
        }
    }

    pub fn persistence(&self) -> &dyn Persistence {
        self.persistence.as_ref()
    }

    pub fn settings(&self) -> &LedgerConfig {
        &self.settings
    }

    pub fn tip(&self) -> Result<Option<Tip>, LedgerError> {
        self.persistence.load_tip()
    }

    pub fn block_count(&self) -> Result<u64, LedgerError> {
        self.persistence.block_count()
    }

    pub fn block(&self, index: u64) -> Result<Block, LedgerError> {
        self.persistence
            .block_at(index)?
            .ok_or(LedgerError::BlockNotFound(index))
    }

    /// Up to `limit` blocks starting at `start`, ascending.
    pub fn blocks(&self, start: u64, limit: usize) -> Result<Vec<Block>, LedgerError> {
        self.persistence.blocks_from(start, limit)
    }

    /// Appends one event. The tip read, block construction, hashing, block
    /// write and tip advance commit as one unit; a moved tip retries the whole
    /// unit up to `max_append_retries` times.
    pub fn append(
        &self,
        user_id: &str,
        action_type: ActionType,
        points: i64,
        metadata: Metadata,
    ) -> Result<Block, LedgerError> {
        if user_id.trim().is_empty() {
            return Err(LedgerError::InvalidInput("userId must not be empty".to_string()));
        }

        let _guard = self.maintenance.read();
        let attempts = self.settings.max_append_retries.max(1);

        for attempt in 1..=attempts {
            let tip = self.persistence.load_tip()?;
            let (index, prev_hash) = Tip::next_link(tip.as_ref());
            let block = Block::new(
                index,
                prev_hash,
                user_id,
                action_type.clone(),
                points,
                metadata.clone(),
            );

            match self.persistence.compare_and_append(tip.as_ref(), &block)? {
                CommitOutcome::Committed => {
                    info!(
                        index = block.index,
                        user_id = %block.user_id,
                        action_type = %block.action_type,
                        points = block.points,
                        hash = %block.hash,
                        "ledger.append"
                    );
                    return Ok(block);
                }
                CommitOutcome::Conflict => {
                    debug!(attempt, index, "append lost the race for the tip, retrying");
                    if attempt < attempts && self.settings.retry_backoff_ms > 0 {
                        thread::sleep(Duration::from_millis(
                            self.settings.retry_backoff_ms * attempt as u64,
                        ));
                    }
                }
            }
        }

        warn!(attempts, "append gave up after repeated tip conflicts");
        Err(LedgerError::Contention { attempts })
    }

    /// Creates the genesis block. A no-op returning the existing block when a
    /// valid genesis is present; a lone genesis that fails verification is
    /// deleted and re-created.
    pub fn create_genesis(&self) -> Result<Block, LedgerError> {
        let _guard = self.maintenance.write();

        let count = self.persistence.block_count()?;
        let existing = self.persistence.block_at(0)?;
        let tip = self.persistence.load_tip()?;

        match existing {
            Some(genesis) if check_block(&genesis, None, 0).is_empty() => {
                if tip.is_none() && count == 1 {
                    // Block survived but the tip record did not.
                    self.persistence.set_tip(&Tip::of(&genesis))?;
                }
                return Ok(genesis);
            }
            Some(genesis) if count == 1 => {
                warn!(hash = %genesis.hash, "genesis block failed verification, re-creating");
                self.persistence.reset_genesis()?;
            }
            Some(_) => {
                return Err(LedgerError::ChainInvalid {
                    message: "genesis block is invalid and later blocks depend on it; run repair"
                        .to_string(),
                    invalid_indices: vec![0],
                });
            }
            None if count > 0 => {
                return Err(LedgerError::ChainInvalid {
                    message: format!("{} blocks stored but genesis is missing", count),
                    invalid_indices: vec![0],
                });
            }
            None if tip.is_some() => {
                warn!("tip present on an empty ledger, clearing it");
                self.persistence.reset_genesis()?;
            }
            None => {}
        }

        let mut metadata = Metadata::new();
        metadata.insert("message".to_string(), MetaValue::from("Genesis Block"));
        let genesis = Block::new(
            0,
            GENESIS_PREV_HASH.to_string(),
            &self.settings.system_user_id,
            ActionType::Genesis,
            0,
            metadata,
        );

        match self.persistence.compare_and_append(None, &genesis)? {
            CommitOutcome::Committed => {
                info!(hash = %genesis.hash, "ledger.genesis");
                Ok(genesis)
            }
            CommitOutcome::Conflict => Err(LedgerError::Contention { attempts: 1 }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryPersistence;

    fn ledger() -> (Ledger, Arc<InMemoryPersistence>) {
        let store = Arc::new(InMemoryPersistence::new());
        (Ledger::new(store.clone()), store)
    }

    fn submission(id: &str) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("submissionId".to_string(), id.into());
        metadata
    }

    #[test]
    fn test_genesis_on_empty_ledger() {
        let (ledger, _) = ledger();
        let genesis = ledger.create_genesis().unwrap();
        assert_eq!(genesis.index, 0);
        assert_eq!(genesis.prev_hash, GENESIS_PREV_HASH);
        assert_eq!(genesis.user_id, "SYSTEM");
        assert_eq!(genesis.action_type, ActionType::Genesis);
        assert_eq!(ledger.block_count().unwrap(), 1);
        assert_eq!(ledger.tip().unwrap(), Some(Tip::of(&genesis)));
    }

    #[test]
    fn test_genesis_is_idempotent_when_valid() {
        let (ledger, _) = ledger();
        let first = ledger.create_genesis().unwrap();
        let second = ledger.create_genesis().unwrap();
        assert_eq!(first, second);
        assert_eq!(ledger.block_count().unwrap(), 1);
    }

    #[test]
    fn test_invalid_lone_genesis_is_recreated() {
        let (ledger, store) = ledger();
        let mut genesis = ledger.create_genesis().unwrap();
        genesis.points = 1_000;
        store.update_block(&genesis).unwrap();

        let fresh = ledger.create_genesis().unwrap();
        assert_eq!(fresh.points, 0);
        assert_eq!(fresh.calculate_hash(), fresh.hash);
        assert_eq!(ledger.block_count().unwrap(), 1);
        assert_eq!(ledger.tip().unwrap(), Some(Tip::of(&fresh)));
    }

    #[test]
    fn test_invalid_genesis_with_descendants_is_refused() {
        let (ledger, store) = ledger();
        let mut genesis = ledger.create_genesis().unwrap();
        ledger
            .append("user-1", ActionType::WasteSubmission, 50, submission("s1"))
            .unwrap();
        genesis.user_id = "mallory".to_string();
        store.update_block(&genesis).unwrap();

        assert!(matches!(
            ledger.create_genesis(),
            Err(LedgerError::ChainInvalid { .. })
        ));
        assert_eq!(ledger.block_count().unwrap(), 2);
    }

    #[test]
    fn test_append_links_to_tip() {
        let (ledger, _) = ledger();
        let genesis = ledger.create_genesis().unwrap();
        let block = ledger
            .append("user-1", ActionType::WasteSubmission, 50, submission("s1"))
            .unwrap();
        assert_eq!(block.index, 1);
        assert_eq!(block.prev_hash, genesis.hash);
        assert_eq!(ledger.tip().unwrap(), Some(Tip::of(&block)));
        assert_eq!(ledger.block(1).unwrap(), block);
    }

    #[test]
    fn test_append_on_empty_ledger_starts_at_zero() {
        let (ledger, _) = ledger();
        let block = ledger
            .append("user-1", ActionType::WasteSubmission, 5, Metadata::new())
            .unwrap();
        assert_eq!(block.index, 0);
        assert_eq!(block.prev_hash, GENESIS_PREV_HASH);
    }

    #[test]
    fn test_append_rejects_blank_user() {
        let (ledger, _) = ledger();
        assert!(matches!(
            ledger.append("  ", ActionType::Adjustment, 1, Metadata::new()),
            Err(LedgerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_missing_block_is_not_found() {
        let (ledger, _) = ledger();
        assert!(matches!(ledger.block(3), Err(LedgerError::BlockNotFound(3))));
    }
}
