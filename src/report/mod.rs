//! Outbound reporting.
//!
//! This module handles:
//! - Result rows (one per visible statement)
//! - Per-line profiles over the procedure source
//! - Versioned report and region-dump documents

pub mod schema;
pub mod statements;

// Re-export main types
pub use schema::{LineRow, ProfileReport, RegionDump, StatementRow};
pub use statements::{prepare_line_profile, prepare_result, to_report};
