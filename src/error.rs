//! Error types for PointLedger

use thiserror::Error;

use crate::merkle::MerkleError;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// Concurrent appends kept moving the tip; the whole append may be retried.
    #[error("Ledger contention: append conflicted on all {attempts} attempts")]
    Contention { attempts: u32 },

    #[error("Chain invalid: {message}")]
    ChainInvalid {
        message: String,
        invalid_indices: Vec<u64>,
    },

    #[error("Ledger is empty: no genesis block has been created")]
    ChainEmpty,

    #[error(
        "Reconciliation mismatch: ledger total {ledger_total} != transactions total {transactions_total}"
    )]
    ReconciliationMismatch {
        ledger_total: i64,
        transactions_total: i64,
    },

    #[error("Insufficient privilege: {0}")]
    InsufficientPrivilege(String),

    #[error("Merkle generation failed: {0}")]
    MerkleGenerationFailure(#[from] MerkleError),

    #[error("Block not found at index {0}")]
    BlockNotFound(u64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("External store error: {0}")]
    ExternalStore(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    /// Only contention is worth retrying as a whole operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Contention { .. })
    }
}

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_contention_is_retryable() {
        assert!(LedgerError::Contention { attempts: 3 }.is_retryable());
        assert!(!LedgerError::ChainEmpty.is_retryable());
        assert!(!LedgerError::BlockNotFound(4).is_retryable());
    }

    #[test]
    fn test_display_includes_totals() {
        let err = LedgerError::ReconciliationMismatch {
            ledger_total: 50,
            transactions_total: 40,
        };
        assert_eq!(
            err.to_string(),
            "Reconciliation mismatch: ledger total 50 != transactions total 40"
        );
    }
}
