//! Result rows and per-line profiles.
//!
//! Rows are produced from a snapshot of stored records; no lock is held
//! while walking.

use super::schema::{LineRow, ProfileReport, StatementRow};
use crate::coverage::CoverageReport;
use crate::model::CompiledUnit;
use crate::profiler::{walk, PrepareResult, StatementMap, Walk};
use crate::stats::UnitSummary;
use crate::store::StatementRecord;
use crate::utils::config::REPORT_SCHEMA_VERSION;
use crate::utils::error::WalkError;
use log::debug;
use std::collections::HashMap;

/// Flatten stored records into one row per visible statement
///
/// **Public** - `records` is `None` for a never-profiled incarnation, which
/// yields rows with zero counters
///
/// # Errors
/// * `WalkError::CursorDesync` / `WalkError::CursorExhausted` - stored
///   chunks don't match the statement map
/// * `WalkError::StaleRecord` - a stored record belongs to another line
pub fn prepare_result(
    unit: &CompiledUnit,
    map: &StatementMap,
    records: Option<&[StatementRecord]>,
) -> Result<Vec<StatementRow>, WalkError> {
    let mut ctx = PrepareResult::new(map, records);
    walk(&unit.body, &mut Walk::PrepareResult(&mut ctx))?;

    let rows = ctx.into_rows();
    debug!("Prepared {} result rows for {}", rows.len(), unit.name);
    Ok(rows)
}

/// Fold statement rows onto the lines of `source`
///
/// **Public** - every source line gets a row, with or without statements
pub fn prepare_line_profile(rows: &[StatementRow], source: &str) -> Vec<LineRow> {
    let mut by_line: HashMap<i32, Vec<&StatementRow>> = HashMap::new();
    for row in rows {
        by_line.entry(row.line_number).or_default().push(row);
    }

    source
        .lines()
        .enumerate()
        .map(|(i, text)| {
            let line_number = i as i32 + 1;
            let stmts = by_line.get(&line_number).map(Vec::as_slice).unwrap_or_default();

            LineRow {
                line_number,
                stmt_line: (!stmts.is_empty()).then_some(line_number),
                cmds_on_row: stmts.len(),
                exec_count: stmts.iter().map(|s| s.exec_count).sum(),
                total_time_us: stmts.iter().map(|s| s.total_time_us).sum(),
                max_times_us: stmts.iter().map(|s| s.max_time_us).collect(),
                processed_rows: stmts.iter().map(|s| s.rows).collect(),
                source: text.to_string(),
            }
        })
        .collect()
}

/// Assemble a versioned report
pub fn to_report(
    unit: &CompiledUnit,
    statements: Vec<StatementRow>,
    lines: Vec<LineRow>,
    coverage: CoverageReport,
    summary: Option<UnitSummary>,
) -> ProfileReport {
    ProfileReport {
        version: REPORT_SCHEMA_VERSION.to_string(),
        generated_at: chrono::Utc::now().to_rfc3339(),
        unit_id: unit.unit_id,
        owner_db_id: unit.owner_db_id,
        name: unit.name.clone(),
        statements,
        lines,
        coverage,
        summary,
    }
}
