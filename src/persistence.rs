//! Database persistence layer for PointLedger
//!
//! The ledger needs very little from its store: an append-only block
//! collection ordered by index, a singleton tip record updated through an
//! atomic compare-and-append, an append-only anchor collection and a singleton
//! latest-anchor slot.

use crate::anchor::Anchor;
use crate::error::LedgerError;
use crate::ledger::{Block, Metadata, Tip};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Result of a conditional append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The tip moved (or the index was taken) since it was read.
    Conflict,
}

/// Abstraction for persistence backends.
pub trait Persistence: Send + Sync {
    fn load_tip(&self) -> Result<Option<Tip>, LedgerError>;

    /// Atomically: if the stored tip still equals `expected`, insert `block`
    /// and advance the tip to it. Never partially applies.
    fn compare_and_append(
        &self,
        expected: Option<&Tip>,
        block: &Block,
    ) -> Result<CommitOutcome, LedgerError>;

    /// Up to `limit` blocks with `index >= start`, ascending.
    fn blocks_from(&self, start: u64, limit: usize) -> Result<Vec<Block>, LedgerError>;

    /// The `limit` highest-index blocks, returned ascending.
    fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>, LedgerError>;

    fn block_at(&self, index: u64) -> Result<Option<Block>, LedgerError>;
    fn block_count(&self) -> Result<u64, LedgerError>;

    /// Sum of `points` over blocks with `index >= min_index`.
    fn sum_points(&self, min_index: u64) -> Result<i64, LedgerError>;

    /// Overwrites the stored block at `block.index`. Repair only.
    fn update_block(&self, block: &Block) -> Result<(), LedgerError>;
    fn set_tip(&self, tip: &Tip) -> Result<(), LedgerError>;

    /// Deletes the block at index 0 and clears the tip in one step.
    fn reset_genesis(&self) -> Result<(), LedgerError>;

    /// Inserts an immutable anchor and overwrites the latest-anchor slot.
    fn save_anchor(&self, anchor: &Anchor) -> Result<(), LedgerError>;
    fn latest_anchor(&self) -> Result<Option<Anchor>, LedgerError>;

    /// Most recent first.
    fn list_anchors(&self, limit: usize) -> Result<Vec<Anchor>, LedgerError>;
}

const BLOCK_COLUMNS: &str =
    "block_index, prev_hash, timestamp, user_id, action_type, points, metadata, hash";

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)
            .map_err(|e| LedgerError::DatabaseError(format!("Failed to open database: {}", e)))?;

        conn.busy_timeout(Duration::from_millis(250))
            .map_err(|e| db_error("Failed to set busy timeout", e))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS blocks (
                block_index INTEGER PRIMARY KEY,
                prev_hash TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                user_id TEXT NOT NULL,
                action_type TEXT NOT NULL,
                points INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                hash TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS tip (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                latest_hash TEXT NOT NULL,
                current_index INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS anchors (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                anchor_id TEXT NOT NULL UNIQUE,
                published_at TEXT NOT NULL,
                body TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS latest_anchor (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                body TEXT NOT NULL
            );",
        )
        .map_err(|e| db_error("Failed to create tables", e))?;

        Ok(Database {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::open(":memory:")
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|_| LedgerError::DatabaseError("Mutex poisoned".to_string()))
    }
}

fn db_error(context: &str, e: rusqlite::Error) -> LedgerError {
    LedgerError::DatabaseError(format!("{}: {}", context, e))
}

fn sqlite_code(e: &rusqlite::Error) -> Option<ErrorCode> {
    match e {
        rusqlite::Error::SqliteFailure(inner, _) => Some(inner.code),
        _ => None,
    }
}

/// Busy/locked and constraint failures mean another writer got there first.
fn is_conflict(e: &rusqlite::Error) -> bool {
    matches!(
        sqlite_code(e),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::ConstraintViolation)
    )
}

fn to_sql_index(index: u64) -> Result<i64, LedgerError> {
    i64::try_from(index)
        .map_err(|_| LedgerError::InvalidInput(format!("Index {} exceeds storage range", index)))
}

fn row_to_block(row: &rusqlite::Row<'_>) -> rusqlite::Result<Block> {
    let index: i64 = row.get(0)?;
    let action_type: String = row.get(4)?;
    let metadata_json: String = row.get(6)?;
    let metadata: Metadata = serde_json::from_str(&metadata_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(Block {
        index: index as u64,
        prev_hash: row.get(1)?,
        timestamp: row.get(2)?,
        user_id: row.get(3)?,
        action_type: action_type.into(),
        points: row.get(5)?,
        metadata,
        hash: row.get(7)?,
    })
}

fn read_tip(conn: &Connection) -> Result<Option<Tip>, LedgerError> {
    conn.query_row(
        "SELECT latest_hash, current_index FROM tip WHERE id = 1",
        [],
        |row| {
            let current_index: i64 = row.get(1)?;
            Ok(Tip {
                latest_hash: row.get(0)?,
                current_index: current_index as u64,
            })
        },
    )
    .optional()
    .map_err(|e| db_error("Failed to read tip", e))
}

fn write_tip(conn: &Connection, tip: &Tip) -> Result<(), LedgerError> {
    conn.execute(
        "INSERT INTO tip (id, latest_hash, current_index) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET latest_hash = excluded.latest_hash,
                                       current_index = excluded.current_index",
        params![tip.latest_hash, to_sql_index(tip.current_index)?],
    )
    .map_err(|e| db_error("Failed to write tip", e))?;
    Ok(())
}

fn query_blocks(
    conn: &Connection,
    sql: &str,
    args: impl rusqlite::Params,
) -> Result<Vec<Block>, LedgerError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| db_error("Failed to prepare query", e))?;
    let rows = stmt
        .query_map(args, row_to_block)
        .map_err(|e| db_error("Failed to query blocks", e))?;

    let mut blocks = Vec::new();
    for row in rows {
        blocks.push(row.map_err(|e| db_error("Failed to load block", e))?);
    }
    Ok(blocks)
}

impl Persistence for Database {
    fn load_tip(&self) -> Result<Option<Tip>, LedgerError> {
        let conn = self.lock()?;
        read_tip(&conn)
    }

    fn compare_and_append(
        &self,
        expected: Option<&Tip>,
        block: &Block,
    ) -> Result<CommitOutcome, LedgerError> {
        let metadata_json = serde_json::to_string(&block.metadata)?;
        let index = to_sql_index(block.index)?;

        let mut conn = self.lock()?;
        // IMMEDIATE takes the write lock up front so the tip read below is the
        // one the commit is conditioned on.
        let tx = match conn.transaction_with_behavior(TransactionBehavior::Immediate) {
            Ok(tx) => tx,
            Err(e) if is_conflict(&e) => return Ok(CommitOutcome::Conflict),
            Err(e) => return Err(db_error("Failed to start transaction", e)),
        };

        if read_tip(&tx)?.as_ref() != expected {
            return Ok(CommitOutcome::Conflict);
        }

        let inserted = tx.execute(
            &format!(
                "INSERT INTO blocks ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                BLOCK_COLUMNS
            ),
            params![
                index,
                block.prev_hash,
                block.timestamp,
                block.user_id,
                block.action_type.as_str(),
                block.points,
                metadata_json,
                block.hash,
            ],
        );
        match inserted {
            Ok(_) => {}
            Err(e) if is_conflict(&e) => return Ok(CommitOutcome::Conflict),
            Err(e) => return Err(db_error("Failed to save block", e)),
        }

        write_tip(&tx, &Tip::of(block))?;

        match tx.commit() {
            Ok(()) => Ok(CommitOutcome::Committed),
            Err(e) if is_conflict(&e) => Ok(CommitOutcome::Conflict),
            Err(e) => Err(db_error("Failed to commit transaction", e)),
        }
    }

    fn blocks_from(&self, start: u64, limit: usize) -> Result<Vec<Block>, LedgerError> {
        let conn = self.lock()?;
        query_blocks(
            &conn,
            &format!(
                "SELECT {} FROM blocks WHERE block_index >= ?1 ORDER BY block_index ASC LIMIT ?2",
                BLOCK_COLUMNS
            ),
            params![to_sql_index(start)?, limit as i64],
        )
    }

    fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>, LedgerError> {
        let conn = self.lock()?;
        let mut blocks = query_blocks(
            &conn,
            &format!(
                "SELECT {} FROM blocks ORDER BY block_index DESC LIMIT ?1",
                BLOCK_COLUMNS
            ),
            params![limit as i64],
        )?;
        blocks.reverse();
        Ok(blocks)
    }

    fn block_at(&self, index: u64) -> Result<Option<Block>, LedgerError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM blocks WHERE block_index = ?1", BLOCK_COLUMNS),
            params![to_sql_index(index)?],
            row_to_block,
        )
        .optional()
        .map_err(|e| db_error("Failed to load block", e))
    }

    fn block_count(&self) -> Result<u64, LedgerError> {
        let conn = self.lock()?;
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM blocks", [], |row| row.get(0))
            .map_err(|e| db_error("Failed to count blocks", e))?;
        Ok(count as u64)
    }

    fn sum_points(&self, min_index: u64) -> Result<i64, LedgerError> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COALESCE(SUM(points), 0) FROM blocks WHERE block_index >= ?1",
            params![to_sql_index(min_index)?],
            |row| row.get(0),
        )
        .map_err(|e| db_error("Failed to sum points", e))
    }

    fn update_block(&self, block: &Block) -> Result<(), LedgerError> {
        let metadata_json = serde_json::to_string(&block.metadata)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE blocks SET prev_hash = ?2, timestamp = ?3, user_id = ?4, action_type = ?5,
                                   points = ?6, metadata = ?7, hash = ?8
                 WHERE block_index = ?1",
                params![
                    to_sql_index(block.index)?,
                    block.prev_hash,
                    block.timestamp,
                    block.user_id,
                    block.action_type.as_str(),
                    block.points,
                    metadata_json,
                    block.hash,
                ],
            )
            .map_err(|e| db_error("Failed to update block", e))?;
        if changed == 0 {
            return Err(LedgerError::BlockNotFound(block.index));
        }
        Ok(())
    }

    fn set_tip(&self, tip: &Tip) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        write_tip(&conn, tip)
    }

    fn reset_genesis(&self) -> Result<(), LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| db_error("Failed to start transaction", e))?;
        tx.execute("DELETE FROM blocks WHERE block_index = 0", [])
            .map_err(|e| db_error("Failed to delete genesis block", e))?;
        tx.execute("DELETE FROM tip", [])
            .map_err(|e| db_error("Failed to clear tip", e))?;
        tx.commit()
            .map_err(|e| db_error("Failed to commit transaction", e))
    }

    fn save_anchor(&self, anchor: &Anchor) -> Result<(), LedgerError> {
        let body = serde_json::to_string(anchor)?;
        let mut conn = self.lock()?;
        let tx = conn
            .transaction()
            .map_err(|e| db_error("Failed to start transaction", e))?;
        tx.execute(
            "INSERT INTO anchors (anchor_id, published_at, body) VALUES (?1, ?2, ?3)",
            params![anchor.id, anchor.published_at, body],
        )
        .map_err(|e| db_error("Failed to save anchor", e))?;
        tx.execute(
            "INSERT INTO latest_anchor (id, body) VALUES (1, ?1)
             ON CONFLICT(id) DO UPDATE SET body = excluded.body",
            params![body],
        )
        .map_err(|e| db_error("Failed to update latest anchor", e))?;
        tx.commit()
            .map_err(|e| db_error("Failed to commit transaction", e))
    }

    fn latest_anchor(&self) -> Result<Option<Anchor>, LedgerError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row("SELECT body FROM latest_anchor WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(|e| db_error("Failed to read latest anchor", e))?;
        body.map(|b| serde_json::from_str(&b).map_err(LedgerError::from))
            .transpose()
    }

    fn list_anchors(&self, limit: usize) -> Result<Vec<Anchor>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT body FROM anchors ORDER BY seq DESC LIMIT ?1")
            .map_err(|e| db_error("Failed to prepare query", e))?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row.get::<_, String>(0))
            .map_err(|e| db_error("Failed to query anchors", e))?;

        let mut anchors = Vec::new();
        for row in rows {
            let body = row.map_err(|e| db_error("Failed to load anchor", e))?;
            anchors.push(serde_json::from_str(&body)?);
        }
        Ok(anchors)
    }
}

#[derive(Default)]
struct MemoryState {
    blocks: BTreeMap<u64, Block>,
    tip: Option<Tip>,
    anchors: Vec<Anchor>,
    latest_anchor: Option<Anchor>,
}

/// Simple in-memory persistence implementation useful for tests and ephemeral runs.
#[derive(Clone, Default)]
pub struct InMemoryPersistence {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>, LedgerError> {
        self.state
            .lock()
            .map_err(|_| LedgerError::DatabaseError("Mutex poisoned".to_string()))
    }
}

impl Persistence for InMemoryPersistence {
    fn load_tip(&self) -> Result<Option<Tip>, LedgerError> {
        Ok(self.lock()?.tip.clone())
    }

    fn compare_and_append(
        &self,
        expected: Option<&Tip>,
        block: &Block,
    ) -> Result<CommitOutcome, LedgerError> {
        let mut state = self.lock()?;
        if state.tip.as_ref() != expected || state.blocks.contains_key(&block.index) {
            return Ok(CommitOutcome::Conflict);
        }
        state.blocks.insert(block.index, block.clone());
        state.tip = Some(Tip::of(block));
        Ok(CommitOutcome::Committed)
    }

    fn blocks_from(&self, start: u64, limit: usize) -> Result<Vec<Block>, LedgerError> {
        Ok(self
            .lock()?
            .blocks
            .range(start..)
            .take(limit)
            .map(|(_, b)| b.clone())
            .collect())
    }

    fn recent_blocks(&self, limit: usize) -> Result<Vec<Block>, LedgerError> {
        let state = self.lock()?;
        let mut blocks: Vec<Block> = state.blocks.values().rev().take(limit).cloned().collect();
        blocks.reverse();
        Ok(blocks)
    }

    fn block_at(&self, index: u64) -> Result<Option<Block>, LedgerError> {
        Ok(self.lock()?.blocks.get(&index).cloned())
    }

    fn block_count(&self) -> Result<u64, LedgerError> {
        Ok(self.lock()?.blocks.len() as u64)
    }

    fn sum_points(&self, min_index: u64) -> Result<i64, LedgerError> {
        self.lock()?
            .blocks
            .range(min_index..)
            .try_fold(0i64, |total, (_, b)| total.checked_add(b.points))
            .ok_or_else(|| {
                LedgerError::DatabaseError("Failed to sum points: integer overflow".to_string())
            })
    }

    fn update_block(&self, block: &Block) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        match state.blocks.get_mut(&block.index) {
            Some(stored) => {
                *stored = block.clone();
                Ok(())
            }
            None => Err(LedgerError::BlockNotFound(block.index)),
        }
    }

    fn set_tip(&self, tip: &Tip) -> Result<(), LedgerError> {
        self.lock()?.tip = Some(tip.clone());
        Ok(())
    }

    fn reset_genesis(&self) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        state.blocks.remove(&0);
        state.tip = None;
        Ok(())
    }

    fn save_anchor(&self, anchor: &Anchor) -> Result<(), LedgerError> {
        let mut state = self.lock()?;
        state.anchors.push(anchor.clone());
        state.latest_anchor = Some(anchor.clone());
        Ok(())
    }

    fn latest_anchor(&self) -> Result<Option<Anchor>, LedgerError> {
        Ok(self.lock()?.latest_anchor.clone())
    }

    fn list_anchors(&self, limit: usize) -> Result<Vec<Anchor>, LedgerError> {
        Ok(self
            .lock()?
            .anchors
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ActionType, GENESIS_PREV_HASH};

    fn genesis() -> Block {
        Block::with_timestamp(
            0,
            GENESIS_PREV_HASH.to_string(),
            "2024-01-01T00:00:00.000Z".to_string(),
            "SYSTEM",
            ActionType::Genesis,
            0,
            Metadata::new(),
        )
    }

    fn child_of(parent: &Block, points: i64) -> Block {
        let mut metadata = Metadata::new();
        metadata.insert("submissionId".to_string(), format!("sub-{}", parent.index + 1).into());
        metadata.insert("weightKg".to_string(), 1.5.into());
        Block::with_timestamp(
            parent.index + 1,
            parent.hash.clone(),
            "2024-01-01T00:00:01.000Z".to_string(),
            "user-1",
            ActionType::WasteSubmission,
            points,
            metadata,
        )
    }

    fn backends() -> Vec<Box<dyn Persistence>> {
        vec![
            Box::new(Database::open_in_memory().unwrap()),
            Box::new(InMemoryPersistence::new()),
        ]
    }

    #[test]
    fn test_database_open() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.conn.lock().unwrap().is_autocommit());
    }

    #[test]
    fn test_compare_and_append_advances_tip() {
        for store in backends() {
            let g = genesis();
            assert_eq!(store.compare_and_append(None, &g).unwrap(), CommitOutcome::Committed);
            assert_eq!(store.load_tip().unwrap(), Some(Tip::of(&g)));

            let b1 = child_of(&g, 50);
            let tip = store.load_tip().unwrap();
            assert_eq!(
                store.compare_and_append(tip.as_ref(), &b1).unwrap(),
                CommitOutcome::Committed
            );
            assert_eq!(store.block_count().unwrap(), 2);
            assert_eq!(store.load_tip().unwrap().unwrap().current_index, 1);
        }
    }

    #[test]
    fn test_stale_tip_is_a_conflict() {
        for store in backends() {
            let g = genesis();
            store.compare_and_append(None, &g).unwrap();

            // A writer that still believes the ledger is empty.
            let rival = genesis();
            assert_eq!(store.compare_and_append(None, &rival).unwrap(), CommitOutcome::Conflict);

            let stale = Tip {
                latest_hash: "deadbeef".to_string(),
                current_index: 0,
            };
            let b1 = child_of(&g, 10);
            assert_eq!(
                store.compare_and_append(Some(&stale), &b1).unwrap(),
                CommitOutcome::Conflict
            );
            assert_eq!(store.block_count().unwrap(), 1);
            assert_eq!(store.load_tip().unwrap(), Some(Tip::of(&g)));
        }
    }

    #[test]
    fn test_blocks_round_trip_with_metadata() {
        for store in backends() {
            let g = genesis();
            store.compare_and_append(None, &g).unwrap();
            let b1 = child_of(&g, 25);
            store.compare_and_append(Some(&Tip::of(&g)), &b1).unwrap();

            let loaded = store.block_at(1).unwrap().unwrap();
            assert_eq!(loaded, b1);
            assert_eq!(loaded.calculate_hash(), loaded.hash);
            assert!(store.block_at(5).unwrap().is_none());
        }
    }

    #[test]
    fn test_paging_and_recent_window() {
        for store in backends() {
            let mut prev = genesis();
            store.compare_and_append(None, &prev).unwrap();
            for _ in 0..5 {
                let next = child_of(&prev, 1);
                store.compare_and_append(Some(&Tip::of(&prev)), &next).unwrap();
                prev = next;
            }

            let page: Vec<u64> = store.blocks_from(2, 3).unwrap().iter().map(|b| b.index).collect();
            assert_eq!(page, vec![2, 3, 4]);

            let recent: Vec<u64> = store.recent_blocks(2).unwrap().iter().map(|b| b.index).collect();
            assert_eq!(recent, vec![4, 5]);

            assert_eq!(store.sum_points(1).unwrap(), 5);
            assert_eq!(store.sum_points(0).unwrap(), 5);
        }
    }

    #[test]
    fn test_reset_genesis_clears_block_and_tip() {
        for store in backends() {
            store.compare_and_append(None, &genesis()).unwrap();
            store.reset_genesis().unwrap();
            assert!(store.load_tip().unwrap().is_none());
            assert_eq!(store.block_count().unwrap(), 0);
        }
    }

    #[test]
    fn test_update_missing_block_reports_not_found() {
        for store in backends() {
            let result = store.update_block(&genesis());
            assert!(matches!(result, Err(LedgerError::BlockNotFound(0))));
        }
    }

    #[test]
    fn test_points_overflow_is_an_error() {
        for store in backends() {
            let first = genesis();
            let big = child_of(&first, i64::MAX);
            let more = child_of(&big, 1);
            store.compare_and_append(None, &first).unwrap();
            store.compare_and_append(Some(&Tip::of(&first)), &big).unwrap();
            store.compare_and_append(Some(&Tip::of(&big)), &more).unwrap();

            assert!(matches!(store.sum_points(0), Err(LedgerError::DatabaseError(_))));
            assert_eq!(store.sum_points(1).ok(), None);
            assert_eq!(store.sum_points(2).unwrap(), 1);
        }
    }
}
