// Thin re-export module: implementation lives in `ledger/core.rs`, split into
// the block model, append path, verification and repair.

pub mod core;
pub use self::core::*;
