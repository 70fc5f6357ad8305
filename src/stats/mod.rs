//! Per-procedure aggregate statistics.

pub mod aggregate;

// Re-export main types
pub use aggregate::{AggregateStats, UnitSummary};
