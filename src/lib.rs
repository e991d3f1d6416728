//! PointLedger - A tamper-evident, hash-chained ledger of rewards point events
//!
//! # Architecture
//!
//! The crate is organized into logical modules:
//!
//! ## Core Ledger
//! - [`ledger`] - Block model and hashing, atomic append, verification and repair
//! - [`persistence`] - Storage backends (SQLite and in-memory)
//!
//! ## Integrity
//! - [`merkle`] - Merkle trees and inclusion proofs over block summaries
//! - [`anchor`] - Published checkpoints and verification against them
//! - [`reconcile`] - Ledger totals vs. the operational transaction store
//! - [`audit`] - Exportable audit proof documents
//!
//! ## Integration
//! - [`api`] - REST API (feature `api`)
//!
//! ## Configuration & Utilities
//! - [`config`] - Configuration management
//! - [`error`] - Error types

#![forbid(unsafe_code)]

// ============================================================================
// Core Ledger
// ============================================================================
pub mod ledger;
pub mod persistence;

// ============================================================================
// Integrity
// ============================================================================
pub mod anchor;
pub mod audit;
pub mod merkle;
pub mod reconcile;

// ============================================================================
// Integration
// ============================================================================
#[cfg(feature = "api")]
pub mod api;

// ============================================================================
// Configuration & Utilities
// ============================================================================
pub mod config;
pub mod error;

pub use error::{LedgerError, Result};
pub use ledger::{ActionType, Block, Ledger, MetaValue, Metadata, Tip};
