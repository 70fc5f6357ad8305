//! Generic statement walker.
//!
//! One recursive descent serves four jobs, selected by `Walk`:
//!
//! - `AssignIds` numbers statements in pre-order (statement map build)
//! - `FoldTime` turns inclusive per-statement times into self times
//! - `PrepareResult` flattens stored records into result rows
//! - `CollectCoverage` counts executed statements and branches
//!
//! Children are always visited before the parent is finalized, so a parent
//! sees the summed totals of its nested lists.

use super::call_buffer::LocalCallBuffer;
use super::statement_map::{MapBuilder, StatementMap};
use crate::coverage::CoverageCounts;
use crate::model::{Stmt, StmtKind};
use crate::report::StatementRow;
use crate::store::StatementRecord;
use crate::utils::error::WalkError;
use log::{debug, warn};
use std::fmt;

/// Walk mode with its mutable context
pub enum Walk<'m, 'd> {
    AssignIds(&'m mut MapBuilder),
    FoldTime(&'m mut FoldTime<'d>),
    PrepareResult(&'m mut PrepareResult<'d>),
    CollectCoverage(&'m mut CollectCoverage<'d>),
}

/// Context of the `FoldTime` walk
pub struct FoldTime<'d> {
    pub(crate) map: &'d StatementMap,
    pub(crate) buffer: &'d mut LocalCallBuffer,
}

impl<'d> FoldTime<'d> {
    pub fn new(map: &'d StatementMap, buffer: &'d mut LocalCallBuffer) -> Self {
        Self { map, buffer }
    }
}

/// Context of the `PrepareResult` walk
pub struct PrepareResult<'d> {
    pub(crate) map: &'d StatementMap,
    pub(crate) cursor: RecordCursor<'d>,
    pub(crate) rows: Vec<StatementRow>,
}

impl<'d> PrepareResult<'d> {
    pub fn new(map: &'d StatementMap, records: Option<&'d [StatementRecord]>) -> Self {
        Self {
            map,
            cursor: RecordCursor::new(records),
            rows: Vec::with_capacity(map.len()),
        }
    }

    pub fn into_rows(self) -> Vec<StatementRow> {
        self.rows
    }
}

/// Context of the `CollectCoverage` walk
pub struct CollectCoverage<'d> {
    pub(crate) map: &'d StatementMap,
    pub(crate) cursor: RecordCursor<'d>,
    pub(crate) counts: CoverageCounts,
}

impl<'d> CollectCoverage<'d> {
    pub fn new(map: &'d StatementMap, records: Option<&'d [StatementRecord]>) -> Self {
        Self {
            map,
            cursor: RecordCursor::new(records),
            counts: CoverageCounts::default(),
        }
    }

    pub fn into_counts(self) -> CoverageCounts {
        self.counts
    }
}

/// Reads stored records strictly in visitation order.
///
/// `records` is `None` for an incarnation that was never folded; every
/// statement then reads as zero.
pub struct RecordCursor<'d> {
    records: Option<&'d [StatementRecord]>,
    position: usize,
}

impl<'d> RecordCursor<'d> {
    pub fn new(records: Option<&'d [StatementRecord]>) -> Self {
        Self {
            records,
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Advance by exactly one record, which must belong to `stmt`
    fn next(&mut self, natural_id: usize, stmt: &Stmt) -> Result<Option<&'d StatementRecord>, WalkError> {
        if self.position != natural_id {
            return Err(WalkError::CursorDesync {
                expected: natural_id,
                found: self.position,
            });
        }
        self.position += 1;

        let Some(records) = self.records else {
            return Ok(None);
        };
        let record = records
            .get(natural_id)
            .ok_or(WalkError::CursorExhausted(natural_id))?;

        if record.line_number != stmt.line_number {
            return Err(WalkError::StaleRecord {
                natural_id,
                expected: stmt.line_number,
                found: record.line_number,
            });
        }
        Ok(Some(record))
    }
}

/// Result of visiting one statement or list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Visit {
    /// Inclusive time (FoldTime only)
    pub total_us: u64,

    /// Execution count of the statement, or of the first statement of a
    /// list (cursor modes only)
    pub exec_count: u64,
}

/// Which child list of its parent a statement belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockNote {
    Body,
    Exception(usize),
    ThenBody,
    Elsif(usize),
    ElseBody,
    CaseWhen(usize),
    CaseElse,
    LoopBody,
}

impl fmt::Display for BlockNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockNote::Body => write!(f, "body"),
            BlockNote::Exception(n) => write!(f, "exception {}", n),
            BlockNote::ThenBody => write!(f, "then body"),
            BlockNote::Elsif(n) => write!(f, "elsif {}", n),
            BlockNote::ElseBody => write!(f, "else body"),
            BlockNote::CaseWhen(n) => write!(f, "case when {}", n),
            BlockNote::CaseElse => write!(f, "case else"),
            BlockNote::LoopBody => write!(f, "loop body"),
        }
    }
}

#[derive(Clone, Copy)]
struct Parent {
    natural_id: usize,
    note: BlockNote,
}

/// Walk the tree rooted at `root` in `mode`
///
/// **Public** - the only tree recursion in the crate
pub fn walk(root: &Stmt, mode: &mut Walk<'_, '_>) -> Result<Visit, WalkError> {
    visit(root, None, 1, mode)
}

fn visit(stmt: &Stmt, parent: Option<Parent>, block_num: usize, mode: &mut Walk<'_, '_>) -> Result<Visit, WalkError> {
    let (natural_id, exec_count) = enter(stmt, parent, block_num, mode)?;

    let mut nested_us = 0u64;
    let mut child = |list: &[Stmt], note: BlockNote, mode: &mut Walk<'_, '_>| {
        let visited = visit_list(list, Parent { natural_id, note }, mode);
        if let Ok(visited) = &visited {
            nested_us += visited.total_us;
        }
        visited
    };

    match &stmt.kind {
        StmtKind::Block { body, handlers, .. } => {
            child(body, BlockNote::Body, mode)?;
            for (i, handler) in handlers.iter().enumerate() {
                child(handler, BlockNote::Exception(i + 1), mode)?;
            }
        }
        StmtKind::If {
            then_body,
            elsifs,
            else_body,
        } => {
            let then = child(then_body, BlockNote::ThenBody, mode)?;
            branch(mode, then.exec_count);
            let mut taken = then.exec_count;

            for (i, elsif) in elsifs.iter().enumerate() {
                let visited = child(elsif, BlockNote::Elsif(i + 1), mode)?;
                branch(mode, visited.exec_count);
                taken += visited.exec_count;
            }

            match else_body {
                Some(else_body) => {
                    let visited = child(else_body, BlockNote::ElseBody, mode)?;
                    branch(mode, visited.exec_count);
                }
                None => {
                    let implicit = implicit_else(stmt, exec_count, taken, mode);
                    branch(mode, implicit);
                }
            }
        }
        StmtKind::Case { whens, else_body } => {
            for (i, when) in whens.iter().enumerate() {
                let visited = child(when, BlockNote::CaseWhen(i + 1), mode)?;
                branch(mode, visited.exec_count);
            }
            if let Some(else_body) = else_body {
                let visited = child(else_body, BlockNote::CaseElse, mode)?;
                branch(mode, visited.exec_count);
            }
        }
        StmtKind::Loop { body, .. } => {
            let visited = child(body, BlockNote::LoopBody, mode)?;
            branch(mode, visited.exec_count);
        }
        StmtKind::Simple { .. } => {}
    }

    let total_us = leave(stmt, natural_id, nested_us, mode);
    Ok(Visit {
        total_us,
        exec_count,
    })
}

/// Visit a child list; the result carries the summed time and the
/// execution count of the list's first statement
fn visit_list(list: &[Stmt], parent: Parent, mode: &mut Walk<'_, '_>) -> Result<Visit, WalkError> {
    let mut result = Visit::default();
    for (i, stmt) in list.iter().enumerate() {
        let visited = visit(stmt, Some(parent), i + 1, mode)?;
        if i == 0 {
            result.exec_count = visited.exec_count;
        }
        result.total_us += visited.total_us;
    }
    Ok(result)
}

/// Pre-order action; returns the natural id and the stored execution count
fn enter(
    stmt: &Stmt,
    parent: Option<Parent>,
    block_num: usize,
    mode: &mut Walk<'_, '_>,
) -> Result<(usize, u64), WalkError> {
    match mode {
        Walk::AssignIds(builder) => Ok((builder.assign(stmt)?, 0)),
        Walk::FoldTime(ctx) => Ok((ctx.map.natural_id(stmt)?, 0)),
        Walk::PrepareResult(ctx) => {
            let natural_id = ctx.map.natural_id(stmt)?;
            let record = ctx.cursor.next(natural_id, stmt)?.copied().unwrap_or_default();

            if stmt.is_visible() {
                ctx.rows.push(StatementRow {
                    natural_id,
                    parent_natural_id: parent.map(|p| p.natural_id),
                    block_label: parent.map(|p| p.note.to_string()),
                    block_num,
                    line_number: stmt.line_number,
                    statement_kind: stmt.typename().to_string(),
                    exec_count: record.exec_count,
                    exec_count_err: record.exec_count_err,
                    total_time_us: record.total_time_us,
                    max_time_us: record.max_time_us,
                    rows: record.rows_processed,
                    query_fingerprint: stmt.query_fingerprint(),
                });
            }
            Ok((natural_id, record.exec_count))
        }
        Walk::CollectCoverage(ctx) => {
            let natural_id = ctx.map.natural_id(stmt)?;
            let exec_count = ctx
                .cursor
                .next(natural_id, stmt)?
                .map_or(0, |record| record.exec_count);

            if stmt.is_visible() {
                ctx.counts.add_statement(exec_count);
            }
            Ok((natural_id, exec_count))
        }
    }
}

/// Post-order action; returns the inclusive time of the statement
fn leave(stmt: &Stmt, natural_id: usize, nested_us: u64, mode: &mut Walk<'_, '_>) -> u64 {
    let Walk::FoldTime(ctx) = mode else {
        return 0;
    };
    let Some(entry) = ctx.buffer.statement_mut(natural_id) else {
        return nested_us;
    };

    if !stmt.is_compound() {
        return entry.elapsed_accum_us;
    }

    let measured = entry.elapsed_accum_us;
    if measured < nested_us {
        debug!(
            "Statement on line {} measured {}us but its children {}us",
            stmt.line_number, measured, nested_us
        );
    }
    let own = measured.saturating_sub(nested_us);

    entry.elapsed_accum_us = own;
    // an inclusive max can't be split into self time
    entry.max_elapsed_us = if entry.exec_count == 1 { own } else { 0 };

    nested_us + own
}

fn branch(mode: &mut Walk<'_, '_>, exec_count: u64) {
    if let Walk::CollectCoverage(ctx) = mode {
        ctx.counts.add_branch(exec_count);
    }
}

/// Executions that took neither the then branch nor any elsif
fn implicit_else(stmt: &Stmt, if_exec: u64, taken: u64, mode: &mut Walk<'_, '_>) -> u64 {
    if !matches!(mode, Walk::CollectCoverage(_)) {
        return 0;
    }

    match if_exec.checked_sub(taken) {
        Some(implicit) => implicit,
        None => {
            warn!(
                "IF on line {} executed {} times but its branches {} times, counting implicit else as 0",
                stmt.line_number, if_exec, taken
            );
            if let Walk::CollectCoverage(ctx) = mode {
                ctx.counts.anomalies += 1;
            }
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CompiledUnit, LoopKind, SimpleKind};
    use pretty_assertions::assert_eq;

    fn unit() -> CompiledUnit {
        let body = Stmt::block(
            0,
            vec![Stmt::block(
                1,
                vec![
                    Stmt::simple(2, SimpleKind::Assign),
                    Stmt::if_then(
                        3,
                        vec![Stmt::simple(4, SimpleKind::Perform)],
                        vec![vec![Stmt::simple(6, SimpleKind::Perform)]],
                        None,
                    ),
                    Stmt::looping(8, LoopKind::While, vec![Stmt::simple(9, SimpleKind::Assign)]),
                    Stmt::simple(11, SimpleKind::Return),
                ],
            )],
        );
        CompiledUnit::compile("walk_me", 10, 1, 1, body)
    }

    fn record(line: i32, exec_count: u64) -> StatementRecord {
        let mut record = StatementRecord::new(line);
        record.exec_count = exec_count;
        record.total_time_us = exec_count * 10;
        record
    }

    fn stored() -> Vec<StatementRecord> {
        vec![
            record(0, 1),
            record(1, 8),
            record(2, 8),
            record(3, 8),
            record(4, 5),
            record(6, 1),
            record(8, 8),
            record(9, 0),
            record(11, 8),
        ]
    }

    #[test]
    fn test_assign_ids_is_preorder() {
        let unit = unit();
        let map = StatementMap::build(&unit).unwrap();

        assert_eq!(map.lines(), &[0, 1, 2, 3, 4, 6, 8, 9, 11]);
    }

    #[test]
    fn test_prepare_result_rows() {
        let unit = unit();
        let map = StatementMap::build(&unit).unwrap();
        let records = stored();

        let mut ctx = PrepareResult::new(&map, Some(&records));
        walk(&unit.body, &mut Walk::PrepareResult(&mut ctx)).unwrap();
        let rows = ctx.into_rows();

        // the synthetic outer block has no row
        assert_eq!(rows.len(), 8);
        assert_eq!(rows[0].natural_id, 1);
        assert_eq!(rows[0].parent_natural_id, Some(0));

        let elsif = rows.iter().find(|r| r.line_number == 6).unwrap();
        assert_eq!(elsif.parent_natural_id, Some(3));
        assert_eq!(elsif.block_label.as_deref(), Some("elsif 1"));
        assert_eq!(elsif.block_num, 1);

        let ret = rows.iter().find(|r| r.line_number == 11).unwrap();
        assert_eq!(ret.block_label.as_deref(), Some("body"));
        assert_eq!(ret.block_num, 4);
        assert_eq!(ret.statement_kind, "RETURN");
        assert_eq!(ret.exec_count, 8);
        assert_eq!(ret.total_time_us, 80);
    }

    #[test]
    fn test_prepare_result_without_profile() {
        let unit = unit();
        let map = StatementMap::build(&unit).unwrap();

        let mut ctx = PrepareResult::new(&map, None);
        walk(&unit.body, &mut Walk::PrepareResult(&mut ctx)).unwrap();
        let rows = ctx.into_rows();

        assert_eq!(rows.len(), 8);
        assert!(rows.iter().all(|r| r.exec_count == 0 && r.total_time_us == 0));
    }

    #[test]
    fn test_stale_record_is_fatal() {
        let unit = unit();
        let map = StatementMap::build(&unit).unwrap();
        let mut records = stored();
        records[4].line_number = 5;

        let mut ctx = PrepareResult::new(&map, Some(&records));
        let result = walk(&unit.body, &mut Walk::PrepareResult(&mut ctx));

        assert!(matches!(
            result,
            Err(WalkError::StaleRecord {
                natural_id: 4,
                expected: 4,
                found: 5
            })
        ));
    }

    #[test]
    fn test_short_profile_is_fatal() {
        let unit = unit();
        let map = StatementMap::build(&unit).unwrap();
        let records = &stored()[..5];

        let mut ctx = CollectCoverage::new(&map, Some(records));
        let result = walk(&unit.body, &mut Walk::CollectCoverage(&mut ctx));

        assert!(matches!(result, Err(WalkError::CursorExhausted(5))));
    }

    #[test]
    fn test_coverage_counts_implicit_else() {
        let unit = unit();
        let map = StatementMap::build(&unit).unwrap();
        let records = stored();

        let mut ctx = CollectCoverage::new(&map, Some(&records));
        walk(&unit.body, &mut Walk::CollectCoverage(&mut ctx)).unwrap();
        let counts = ctx.into_counts();

        // 8 visible statements, the loop body never ran
        assert_eq!(counts.statements, 8);
        assert_eq!(counts.executed_statements, 7);

        // then, elsif, implicit else (8 - 5 - 1 = 2), loop body
        assert_eq!(counts.branches, 4);
        assert_eq!(counts.executed_branches, 3);
        assert_eq!(counts.anomalies, 0);
    }

    #[test]
    fn test_negative_implicit_else_is_clamped() {
        let unit = unit();
        let map = StatementMap::build(&unit).unwrap();
        let mut records = stored();
        records[3].exec_count = 4;

        let mut ctx = CollectCoverage::new(&map, Some(&records));
        walk(&unit.body, &mut Walk::CollectCoverage(&mut ctx)).unwrap();
        let counts = ctx.into_counts();

        assert_eq!(counts.anomalies, 1);
        assert_eq!(counts.branches, 4);
        assert_eq!(counts.executed_branches, 2);
    }

    #[test]
    fn test_fold_time_subtracts_children() {
        let body = Stmt::block(
            1,
            vec![
                Stmt::simple(2, SimpleKind::Assign),
                Stmt::looping(3, LoopKind::Loop, vec![Stmt::simple(4, SimpleKind::Perform)]),
            ],
        );
        let unit = CompiledUnit::compile("fold", 11, 1, 1, body);
        let map = StatementMap::build(&unit).unwrap();

        let mut buffer = LocalCallBuffer::new(&map, 0);
        // block 100us once; assign 10us; loop 60us once; body 3 x 15us
        buffer.record(0, 100, 100, 1);
        buffer.record(1, 10, 10, 1);
        buffer.record(2, 60, 60, 1);
        buffer.record(3, 45, 20, 3);

        let mut ctx = FoldTime::new(&map, &mut buffer);
        let visit = walk(&unit.body, &mut Walk::FoldTime(&mut ctx)).unwrap();
        assert_eq!(visit.total_us, 100);

        let records = buffer.to_records();
        let totals: Vec<u64> = records.iter().map(|r| r.total_time_us).collect();
        let maxes: Vec<u64> = records.iter().map(|r| r.max_time_us).collect();
        assert_eq!(totals, vec![30, 10, 15, 45]);
        assert_eq!(maxes, vec![30, 10, 15, 20]);
    }

    #[test]
    fn test_fold_time_compound_executed_twice_has_no_max() {
        let body = Stmt::looping(1, LoopKind::Loop, vec![Stmt::simple(2, SimpleKind::Perform)]);
        let unit = CompiledUnit::compile("twice", 12, 1, 1, body);
        let map = StatementMap::build(&unit).unwrap();

        let mut buffer = LocalCallBuffer::new(&map, 0);
        buffer.record(0, 50, 30, 2);
        buffer.record(1, 20, 10, 2);

        let mut ctx = FoldTime::new(&map, &mut buffer);
        walk(&unit.body, &mut Walk::FoldTime(&mut ctx)).unwrap();

        let records = buffer.to_records();
        assert_eq!(records[0].total_time_us, 30);
        assert_eq!(records[0].max_time_us, 0);
        assert_eq!(records[1].max_time_us, 10);
    }
}
