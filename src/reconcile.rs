//! Reconciliation of ledger totals against the operational transaction store,
//! and the combined integrity check built on top of it.
//!
//! The ledger is treated as the source of truth. A reader without access to
//! the external store is reported as [`ReconciliationStatus::Skipped`] by
//! [`Ledger::run_all_integrity_checks`], never as a mismatch.

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, OpenFlags};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::ledger::{current_timestamp, Ledger, VerificationReport};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError {
    #[error("insufficient privilege to read transactions: {0}")]
    InsufficientPrivilege(String),
    #[error("transaction store unavailable: {0}")]
    Unavailable(String),
}

impl From<SourceError> for LedgerError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::InsufficientPrivilege(msg) => LedgerError::InsufficientPrivilege(msg),
            SourceError::Unavailable(msg) => LedgerError::ExternalStore(msg),
        }
    }
}

/// The operational store whose point deltas the ledger is audited against.
pub trait TransactionSource: Send + Sync {
    /// Sum of every recorded point delta.
    fn total_points(&self) -> Result<i64, SourceError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointTransaction {
    pub id: String,
    pub user_id: String,
    pub points: i64,
}

/// Transaction list held in memory.
#[derive(Debug, Default)]
pub struct InMemoryTransactions {
    records: Mutex<Vec<PointTransaction>>,
}

impl InMemoryTransactions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: &str, user_id: &str, points: i64) {
        self.records.lock().push(PointTransaction {
            id: id.to_string(),
            user_id: user_id.to_string(),
            points,
        });
    }

    pub fn transactions(&self) -> Vec<PointTransaction> {
        self.records.lock().clone()
    }
}

impl TransactionSource for InMemoryTransactions {
    fn total_points(&self) -> Result<i64, SourceError> {
        self.records
            .lock()
            .iter()
            .try_fold(0i64, |total, t| total.checked_add(t.points))
            .ok_or_else(|| SourceError::Unavailable("transaction total overflows i64".into()))
    }
}

/// Reads `SUM(points)` from the `point_transactions` table of an operational
/// SQLite database, opened read-only.
pub struct SqliteTransactions {
    conn: Mutex<Connection>,
}

impl SqliteTransactions {
    pub fn open(path: &str) -> Result<Self, SourceError> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(source_error)?;
        Ok(SqliteTransactions {
            conn: Mutex::new(conn),
        })
    }

    /// Wraps an already open connection.
    pub fn from_connection(conn: Connection) -> Self {
        SqliteTransactions {
            conn: Mutex::new(conn),
        }
    }
}

fn source_error(e: rusqlite::Error) -> SourceError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if matches!(
                err.code,
                ErrorCode::PermissionDenied
                    | ErrorCode::AuthorizationForStatementDenied
                    | ErrorCode::ReadOnly
            ) =>
        {
            SourceError::InsufficientPrivilege(e.to_string())
        }
        _ => SourceError::Unavailable(e.to_string()),
    }
}

impl TransactionSource for SqliteTransactions {
    fn total_points(&self) -> Result<i64, SourceError> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(SUM(points), 0) FROM point_transactions",
            [],
            |row| row.get::<_, i64>(0),
        )
        .map_err(source_error)
    }
}

/// Denies every read. Stands in for callers without access to the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct Unprivileged;

impl TransactionSource for Unprivileged {
    fn total_points(&self) -> Result<i64, SourceError> {
        Err(SourceError::InsufficientPrivilege(
            "caller is not authorized to read point transactions".to_string(),
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub valid: bool,
    pub ledger_total: i64,
    pub transactions_total: i64,
    pub reason: String,
}

impl ReconciliationReport {
    pub fn difference(&self) -> i64 {
        self.ledger_total - self.transactions_total
    }

    /// Converts a mismatch into `ReconciliationMismatch`.
    pub fn into_result(self) -> Result<Self, LedgerError> {
        if self.valid {
            Ok(self)
        } else {
            Err(LedgerError::ReconciliationMismatch {
                ledger_total: self.ledger_total,
                transactions_total: self.transactions_total,
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Passed(ReconciliationReport),
    Failed(ReconciliationReport),
    /// Counted as passed when computing the aggregate.
    Skipped { reason: String },
}

impl ReconciliationStatus {
    pub fn is_passing(&self) -> bool {
        !matches!(self, ReconciliationStatus::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrityReport {
    pub valid: bool,
    pub chain: VerificationReport,
    pub reconciliation: ReconciliationStatus,
    pub checked_at: String,
}

impl Ledger {
    /// Sum of `points` over every block except genesis.
    pub fn ledger_points_total(&self) -> Result<i64, LedgerError> {
        self.persistence().sum_points(1)
    }

    /// Compares ledger totals with `source`. A mismatch is reported, not
    /// raised; a privilege failure surfaces as `InsufficientPrivilege`.
    pub fn reconcile_point_totals(
        &self,
        source: &dyn TransactionSource,
    ) -> Result<ReconciliationReport, LedgerError> {
        let ledger_total = self.ledger_points_total()?;
        let transactions_total = source.total_points()?;

        let valid = ledger_total == transactions_total;
        let reason = if valid {
            format!("Totals match: {} points", ledger_total)
        } else {
            format!(
                "Mismatch: ledger total {} vs transactions total {} (difference {})",
                ledger_total,
                transactions_total,
                ledger_total - transactions_total
            )
        };

        if valid {
            info!(ledger_total, "ledger.reconcile: totals match");
        } else {
            warn!(ledger_total, transactions_total, "ledger.reconcile: totals mismatch");
        }

        Ok(ReconciliationReport {
            valid,
            ledger_total,
            transactions_total,
            reason,
        })
    }

    /// Chain verification plus reconciliation. This is the only place where
    /// `InsufficientPrivilege` is downgraded to a skipped check.
    pub fn run_all_integrity_checks(
        &self,
        source: &dyn TransactionSource,
    ) -> Result<IntegrityReport, LedgerError> {
        let chain = self.verify_chain()?;

        let reconciliation = match self.reconcile_point_totals(source) {
            Ok(report) if report.valid => ReconciliationStatus::Passed(report),
            Ok(report) => ReconciliationStatus::Failed(report),
            Err(LedgerError::InsufficientPrivilege(reason)) => {
                info!(%reason, "ledger.integrity: reconciliation skipped");
                ReconciliationStatus::Skipped { reason }
            }
            Err(e) => return Err(e),
        };

        let valid = chain.valid && reconciliation.is_passing();
        info!(
            valid,
            chain_valid = chain.valid,
            blocks = chain.block_count,
            "ledger.integrity"
        );

        Ok(IntegrityReport {
            valid,
            chain,
            reconciliation,
            checked_at: current_timestamp(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::{ActionType, Metadata};
    use crate::persistence::{InMemoryPersistence, Persistence};
    use std::sync::Arc;

    fn seeded() -> (Ledger, Arc<InMemoryPersistence>) {
        let store = Arc::new(InMemoryPersistence::new());
        let ledger = Ledger::new(store.clone());
        ledger.create_genesis().unwrap();
        ledger
            .append("user-1", ActionType::WasteSubmission, 50, Metadata::new())
            .unwrap();
        ledger
            .append("user-1", ActionType::RewardRedemption, -20, Metadata::new())
            .unwrap();
        (ledger, store)
    }

    #[test]
    fn test_matching_totals() {
        let (ledger, _) = seeded();
        let txs = InMemoryTransactions::new();
        txs.record("t1", "user-1", 50);
        txs.record("t2", "user-1", -20);

        let report = ledger.reconcile_point_totals(&txs).unwrap();
        assert!(report.valid);
        assert_eq!(report.ledger_total, 30);
        assert_eq!(report.transactions_total, 30);
        assert!(report.clone().into_result().is_ok());
    }

    #[test]
    fn test_genesis_points_excluded() {
        let store = Arc::new(InMemoryPersistence::new());
        let ledger = Ledger::new(store.clone());
        let mut genesis = ledger.create_genesis().unwrap();
        genesis.points = 1_000;
        store.update_block(&genesis).unwrap();
        assert_eq!(ledger.ledger_points_total().unwrap(), 0);
    }

    #[test]
    fn test_mismatch_reports_both_totals() {
        let (ledger, _) = seeded();
        let txs = InMemoryTransactions::new();
        txs.record("t1", "user-1", 50);

        let report = ledger.reconcile_point_totals(&txs).unwrap();
        assert!(!report.valid);
        assert_eq!(report.ledger_total, 30);
        assert_eq!(report.transactions_total, 50);
        assert_eq!(report.difference(), -20);
        assert!(matches!(
            report.into_result(),
            Err(LedgerError::ReconciliationMismatch {
                ledger_total: 30,
                transactions_total: 50
            })
        ));
    }

    #[test]
    fn test_unprivileged_is_distinguished() {
        let (ledger, _) = seeded();
        assert!(matches!(
            ledger.reconcile_point_totals(&Unprivileged),
            Err(LedgerError::InsufficientPrivilege(_))
        ));
    }

    #[test]
    fn test_integrity_downgrades_privilege_failure() {
        let (ledger, _) = seeded();
        let report = ledger.run_all_integrity_checks(&Unprivileged).unwrap();
        assert!(report.valid);
        assert!(matches!(report.reconciliation, ReconciliationStatus::Skipped { .. }));
    }

    #[test]
    fn test_integrity_fails_on_mismatch_or_tamper() {
        let (ledger, store) = seeded();
        let txs = InMemoryTransactions::new();
        txs.record("t1", "user-1", 30);
        assert!(ledger.run_all_integrity_checks(&txs).unwrap().valid);

        txs.record("t2", "user-1", 1);
        let report = ledger.run_all_integrity_checks(&txs).unwrap();
        assert!(!report.valid);
        assert!(report.chain.valid);
        assert!(matches!(report.reconciliation, ReconciliationStatus::Failed(_)));

        let mut block = store.block_at(1).unwrap().unwrap();
        block.user_id = "mallory".to_string();
        store.update_block(&block).unwrap();
        let report = ledger.run_all_integrity_checks(&Unprivileged).unwrap();
        assert!(!report.valid);
        assert_eq!(report.chain.invalid_block_indices, vec![1]);
    }

    #[test]
    fn test_sqlite_transactions_sum() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE point_transactions (id TEXT PRIMARY KEY, user_id TEXT, points INTEGER);
             INSERT INTO point_transactions VALUES ('a', 'u', 50), ('b', 'u', -20);",
        )
        .unwrap();
        let source = SqliteTransactions::from_connection(conn);
        assert_eq!(source.total_points().unwrap(), 30);

        let (ledger, _) = seeded();
        assert!(ledger.reconcile_point_totals(&source).unwrap().valid);
    }

    #[test]
    fn test_sqlite_missing_table_is_unavailable() {
        let source = SqliteTransactions::from_connection(Connection::open_in_memory().unwrap());
        assert!(matches!(source.total_points(), Err(SourceError::Unavailable(_))));
    }

    #[test]
    fn test_in_memory_total_overflow_is_unavailable() {
        let source = InMemoryTransactions::new();
        source.record("t-1", "user-1", i64::MAX);
        source.record("t-2", "user-1", 1);
        assert!(matches!(source.total_points(), Err(SourceError::Unavailable(_))));
    }
}
