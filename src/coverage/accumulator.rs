//! Statement and branch coverage of one incarnation.

use crate::model::CompiledUnit;
use crate::profiler::{walk, CollectCoverage, StatementMap, Walk};
use crate::store::StatementRecord;
use crate::utils::error::WalkError;
use serde::{Deserialize, Serialize};

/// Counters filled by the `CollectCoverage` walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageCounts {
    /// Visible statements
    pub statements: u64,
    pub executed_statements: u64,

    /// Branch units: loop bodies and conditional arms
    pub branches: u64,
    pub executed_branches: u64,

    /// Implicit-else counts that came out negative and were clamped
    pub anomalies: u64,
}

impl CoverageCounts {
    pub fn add_statement(&mut self, exec_count: u64) {
        self.statements += 1;
        if exec_count > 0 {
            self.executed_statements += 1;
        }
    }

    pub fn add_branch(&mut self, exec_count: u64) {
        self.branches += 1;
        if exec_count > 0 {
            self.executed_branches += 1;
        }
    }

    /// Executed share of statements; 1.0 when there is nothing to count
    pub fn statement_ratio(&self) -> f64 {
        ratio(self.executed_statements, self.statements)
    }

    /// Executed share of branch units; 1.0 when there is nothing to count
    pub fn branch_ratio(&self) -> f64 {
        ratio(self.executed_branches, self.branches)
    }
}

fn ratio(executed: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        executed as f64 / total as f64
    }
}

/// Coverage of one procedure as reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageReport {
    pub unit_id: u32,
    pub name: String,
    #[serde(flatten)]
    pub counts: CoverageCounts,
    pub statement_ratio: f64,
    pub branch_ratio: f64,
}

impl CoverageReport {
    pub fn new(unit: &CompiledUnit, counts: CoverageCounts) -> Self {
        Self {
            unit_id: unit.unit_id,
            name: unit.name.clone(),
            counts,
            statement_ratio: counts.statement_ratio(),
            branch_ratio: counts.branch_ratio(),
        }
    }
}

/// Run the coverage walk over stored records (`None` = never profiled)
///
/// **Public** - `ProfilerSession::coverage` snapshots the records first
pub fn collect(
    unit: &CompiledUnit,
    map: &StatementMap,
    records: Option<&[StatementRecord]>,
) -> Result<CoverageReport, WalkError> {
    let mut ctx = CollectCoverage::new(map, records);
    walk(&unit.body, &mut Walk::CollectCoverage(&mut ctx))?;

    Ok(CoverageReport::new(unit, ctx.into_counts()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoopKind, SimpleKind, Stmt};

    #[test]
    fn test_empty_counts_are_fully_covered() {
        let counts = CoverageCounts::default();
        assert_eq!(counts.statement_ratio(), 1.0);
        assert_eq!(counts.branch_ratio(), 1.0);
    }

    #[test]
    fn test_ratios() {
        let mut counts = CoverageCounts::default();
        counts.add_statement(3);
        counts.add_statement(0);
        counts.add_branch(1);
        counts.add_branch(0);
        counts.add_branch(0);
        counts.add_branch(7);

        assert_eq!(counts.statement_ratio(), 0.5);
        assert_eq!(counts.branch_ratio(), 0.5);
    }

    #[test]
    fn test_never_profiled_unit() {
        let body = Stmt::block(
            1,
            vec![Stmt::looping(2, LoopKind::While, vec![Stmt::simple(3, SimpleKind::Assign)])],
        );
        let unit = CompiledUnit::compile("cold", 30, 1, 1, body);
        let map = StatementMap::build(&unit).unwrap();

        let report = collect(&unit, &map, None).unwrap();
        assert_eq!(report.counts.statements, 3);
        assert_eq!(report.counts.executed_statements, 0);
        assert_eq!(report.counts.branches, 1);
        assert_eq!(report.statement_ratio, 0.0);
        assert_eq!(report.branch_ratio, 0.0);
    }
}
