// core.rs splits ledger responsibilities into submodules.
pub mod block;
pub mod chain;
pub mod repair;
pub mod validation;

pub use block::*;
pub use chain::*;
pub use repair::*;
pub use validation::*;
