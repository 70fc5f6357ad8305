//! Outbound row and report definitions.
//!
//! This module defines what the reporting layer receives and what we
//! write to disk. Reports are versioned to allow future evolution.

use crate::coverage::CoverageReport;
use crate::stats::UnitSummary;
use crate::store::{Chunk, RegionInfo};
use serde::{Deserialize, Serialize};

/// One statement of one incarnation, flattened
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementRow {
    pub natural_id: usize,

    /// `None` for the root statement
    pub parent_natural_id: Option<usize>,

    /// Which list of the parent holds this statement ("then body", "elsif 2", ...)
    pub block_label: Option<String>,

    /// 1-based position within that list
    pub block_num: usize,

    pub line_number: i32,

    /// Statement type name (e.g. "assignment", "FOR over SELECT rows")
    pub statement_kind: String,

    pub exec_count: u64,
    pub exec_count_err: u64,

    /// Self time, excluding nested statements
    pub total_time_us: u64,
    pub max_time_us: u64,

    /// Rows processed by the statement's query
    pub rows: u64,

    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub query_fingerprint: Option<u64>,
}

/// One source line with the statements starting on it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineRow {
    /// 1-based source line
    pub line_number: i32,

    /// Same as `line_number` when a statement starts here
    pub stmt_line: Option<i32>,

    pub cmds_on_row: usize,
    pub exec_count: u64,
    pub total_time_us: u64,

    /// Per statement on the line, in source order
    pub max_times_us: Vec<u64>,
    pub processed_rows: Vec<u64>,

    pub source: String,
}

/// Everything known about one incarnation, written to JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileReport {
    /// Schema version for compatibility checking
    pub version: String,

    /// Timestamp when the report was generated
    pub generated_at: String,

    pub unit_id: u32,
    pub owner_db_id: u32,
    pub name: String,

    pub statements: Vec<StatementRow>,

    /// Present when the caller supplied the procedure source
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub lines: Vec<LineRow>,

    pub coverage: CoverageReport,

    /// Call statistics; absent if the procedure never finished a profiled call
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub summary: Option<UnitSummary>,
}

/// Raw contents of a chunk region
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionDump {
    pub version: String,
    pub generated_at: String,
    pub info: RegionInfo,
    pub chunks: Vec<Chunk>,

    #[serde(default)]
    pub units: Vec<UnitSummary>,
}
