//! Token accounting: model-aware counting and the persistent daily ledger.

pub mod counter;
pub mod ledger;

pub use counter::{count, count_lines};
pub use ledger::{DailyLedger, ReserveOutcome};
