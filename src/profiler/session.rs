//! Host-facing profiler session.
//!
//! The host calls the hooks synchronously while interpreting:
//!
//! 1. `on_unit_begin` - get the statement map, allocate a call buffer
//! 2. `Invocation::on_statement_begin` / `on_statement_end` - timers
//! 3. `on_unit_end` - fold nested time, record call statistics, merge
//!    into the store
//!
//! Reporting (`prepare_result`, `coverage`, ...) reads a snapshot of the
//! store and never blocks profiling for longer than the copy.

use super::call_buffer::LocalCallBuffer;
use super::statement_map::{StatementMap, StatementMapCache};
use super::walker::{walk, FoldTime, Walk};
use crate::coverage::{self, CoverageReport};
use crate::model::{CompiledUnit, Stmt, UnitKey};
use crate::report::{self, LineRow, ProfileReport, StatementRow};
use crate::stats::{AggregateStats, UnitSummary};
use crate::store::{ProfilerStore, ResetScope};
use crate::utils::error::{ProfilerError, WalkError};
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Microsecond time source
pub trait Clock: Send + Sync {
    fn now_us(&self) -> u64;
}

/// Monotonic wall clock, counted from construction
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_us(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, now_us: u64) {
        self.now.store(now_us, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_us: u64) {
        self.now.fetch_add(delta_us, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// One in-flight profiled call
pub struct Invocation {
    unit: Arc<CompiledUnit>,
    map: Arc<StatementMap>,
    buffer: LocalCallBuffer,
    clock: Arc<dyn Clock>,
}

impl Invocation {
    pub fn unit(&self) -> &CompiledUnit {
        &self.unit
    }

    pub fn buffer(&self) -> &LocalCallBuffer {
        &self.buffer
    }

    /// Statement-begin hook
    pub fn on_statement_begin(&mut self, stmt: &Stmt) -> Result<(), WalkError> {
        let natural_id = self.map.natural_id(stmt)?;
        self.buffer.begin_statement(natural_id, self.clock.now_us());
        Ok(())
    }

    /// Statement-end hook; `errored` marks a statement left by an error
    pub fn on_statement_end(&mut self, stmt: &Stmt, rows: u64, errored: bool) -> Result<(), WalkError> {
        let natural_id = self.map.natural_id(stmt)?;
        self.buffer
            .end_statement(natural_id, self.clock.now_us(), rows, errored);
        Ok(())
    }
}

/// Profiler state of one process
///
/// **Public** - the host holds one session and calls its hooks
pub struct ProfilerSession {
    store: Arc<ProfilerStore>,
    maps: StatementMapCache,
    clock: Arc<dyn Clock>,
    enabled: AtomicBool,
}

impl ProfilerSession {
    pub fn new(store: Arc<ProfilerStore>) -> Self {
        Self {
            store,
            maps: StatementMapCache::new(),
            clock: Arc::new(MonotonicClock::new()),
            enabled: AtomicBool::new(true),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &ProfilerStore {
        &self.store
    }

    /// Call statistics, shared with every process attached to the store
    pub fn stats(&self) -> AggregateStats<'_> {
        self.store.stats()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Unit-begin hook. `None` when profiling is off or the unit is an
    /// anonymous block.
    pub fn on_unit_begin(&self, unit: &Arc<CompiledUnit>) -> Result<Option<Invocation>, ProfilerError> {
        if !self.is_enabled() || unit.is_anonymous() {
            return Ok(None);
        }

        let map = self.maps.build_or_get(unit)?;
        let buffer = LocalCallBuffer::new(&map, self.clock.now_us());

        Ok(Some(Invocation {
            unit: Arc::clone(unit),
            map,
            buffer,
            clock: Arc::clone(&self.clock),
        }))
    }

    /// Unit-end hook; `aborted` when the call ended with an error
    ///
    /// # Errors
    /// * `StoreError::ResourceExhausted` - no room for a new incarnation;
    ///   this call's statement counts are dropped
    /// * `StoreError::UnitTableFull` - no room for the procedure's call
    ///   statistics; statement counts are still stored
    /// * any other variant - internal consistency violation
    pub fn on_unit_end(&self, mut invocation: Invocation, aborted: bool) -> Result<(), ProfilerError> {
        let now = invocation.clock.now_us();
        invocation.buffer.close_open(now);
        invocation.buffer.credit_entry(now);

        let unit = &invocation.unit;
        let map = &invocation.map;

        let mut fold = FoldTime::new(map, &mut invocation.buffer);
        walk(&unit.body, &mut Walk::FoldTime(&mut fold))?;

        let elapsed = now.saturating_sub(invocation.buffer.started_at());
        let recorded = self
            .store
            .stats()
            .record(map.identity().unit_key(), elapsed, aborted);

        self.store.fold(map.identity(), &invocation.buffer.to_records())?;
        recorded?;
        debug!("Folded call of {} ({}us)", unit.name, elapsed);
        Ok(())
    }

    /// Cache-invalidation signal. A changed procedure loses its cached maps
    /// and its stored chunks; `None` drops every cached map.
    pub fn invalidate(&self, unit: Option<UnitKey>) -> Result<usize, ProfilerError> {
        match unit {
            Some(key) => {
                let dropped = self.maps.invalidate(Some(key));
                let removed = self.store.reset(ResetScope::Unit(key))?;
                debug!(
                    "Invalidated unit {}: {} maps, {} chunks",
                    key.unit_id, dropped, removed
                );
                Ok(removed)
            }
            None => Ok(self.maps.invalidate(None)),
        }
    }

    /// Administrative reset of stored chunks and call statistics
    pub fn reset(&self, scope: ResetScope) -> Result<usize, ProfilerError> {
        match scope {
            ResetScope::All => {
                self.stats().reset(None)?;
            }
            ResetScope::Unit(key) => {
                self.stats().reset(Some(key))?;
            }
            ResetScope::Incarnation(_) => {}
        }
        Ok(self.store.reset(scope)?)
    }

    /// Result rows of one incarnation
    pub fn prepare_result(&self, unit: &CompiledUnit) -> Result<Vec<StatementRow>, ProfilerError> {
        let map = self.maps.build_or_get(unit)?;
        let records = self.store.read_records(map.identity())?;

        Ok(report::prepare_result(unit, &map, records.as_deref())?)
    }

    /// Per-line profile of one incarnation over its source text
    pub fn prepare_line_profile(&self, unit: &CompiledUnit, source: &str) -> Result<Vec<LineRow>, ProfilerError> {
        let rows = self.prepare_result(unit)?;
        Ok(report::prepare_line_profile(&rows, source))
    }

    pub fn coverage(&self, unit: &CompiledUnit) -> Result<CoverageReport, ProfilerError> {
        let map = self.maps.build_or_get(unit)?;
        let records = self.store.read_records(map.identity())?;

        Ok(coverage::collect(unit, &map, records.as_deref())?)
    }

    /// Call statistics of procedures owned by `current_db`
    pub fn aggregate_summaries(&self, current_db: u32) -> Result<Vec<UnitSummary>, ProfilerError> {
        Ok(self.stats().read_all(current_db)?)
    }

    /// Rows, coverage and call statistics in one document
    pub fn report(&self, unit: &CompiledUnit, source: Option<&str>) -> Result<ProfileReport, ProfilerError> {
        info!("Building profile report for {}", unit.name);

        let map = self.maps.build_or_get(unit)?;
        let records = self.store.read_records(map.identity())?;

        let statements = report::prepare_result(unit, &map, records.as_deref())?;
        let lines = source
            .map(|source| report::prepare_line_profile(&statements, source))
            .unwrap_or_default();
        let coverage = coverage::collect(unit, &map, records.as_deref())?;
        let summary = self
            .stats()
            .get(UnitKey::new(unit.unit_id, unit.owner_db_id))?;

        Ok(report::to_report(unit, statements, lines, coverage, summary))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoopKind, SimpleKind};
    use pretty_assertions::assert_eq;

    fn session() -> (ProfilerSession, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(ProfilerStore::local(64).unwrap());
        let session = ProfilerSession::new(store).with_clock(clock.clone());
        (session, clock)
    }

    fn unit() -> Arc<CompiledUnit> {
        let body = Stmt::block(
            0,
            vec![
                Stmt::simple(2, SimpleKind::Assign),
                Stmt::looping(3, LoopKind::ForInt, vec![Stmt::simple(4, SimpleKind::Perform)]),
            ],
        );
        Arc::new(CompiledUnit::compile("session_fn", 40, 1, 1, body))
    }

    fn children(unit: &CompiledUnit) -> (&Stmt, &Stmt, &Stmt) {
        let crate::model::StmtKind::Block { body, .. } = &unit.body.kind else {
            panic!("expected block");
        };
        let crate::model::StmtKind::Loop { body: inner, .. } = &body[1].kind else {
            panic!("expected loop");
        };
        (&body[0], &body[1], &inner[0])
    }

    #[test]
    fn test_hooks_fold_self_time() {
        let (session, clock) = session();
        let unit = unit();
        let (assign, looping, perform) = children(&unit);

        let mut inv = session.on_unit_begin(&unit).unwrap().unwrap();
        inv.on_statement_begin(assign).unwrap();
        clock.advance(5);
        inv.on_statement_end(assign, 0, false).unwrap();

        inv.on_statement_begin(looping).unwrap();
        for _ in 0..2 {
            inv.on_statement_begin(perform).unwrap();
            clock.advance(10);
            inv.on_statement_end(perform, 1, false).unwrap();
        }
        clock.advance(3);
        inv.on_statement_end(looping, 0, false).unwrap();
        clock.advance(2);
        session.on_unit_end(inv, false).unwrap();

        let rows = session.prepare_result(&unit).unwrap();
        let totals: Vec<(i32, u64, u64)> = rows
            .iter()
            .map(|r| (r.line_number, r.exec_count, r.total_time_us))
            .collect();
        assert_eq!(totals, vec![(2, 1, 5), (3, 1, 3), (4, 2, 20)]);

        // the root was never reported: one synthesized execution of 30us,
        // 28us of which belong to its children
        let records = session
            .store()
            .read_records(&crate::model::IdentityKey::of(&unit))
            .unwrap()
            .unwrap();
        assert_eq!(records[0].exec_count, 1);
        assert_eq!(records[0].total_time_us, 2);

        let summary = session.stats().get(UnitKey::new(40, 1)).unwrap().unwrap();
        assert_eq!(summary.total_time_us, 30);
    }

    #[test]
    fn test_disabled_and_anonymous_are_skipped() {
        let (session, _) = session();
        session.set_enabled(false);
        assert!(session.on_unit_begin(&unit()).unwrap().is_none());

        session.set_enabled(true);
        let anonymous = Arc::new(CompiledUnit::compile("inline", 0, 1, 1, Stmt::block(0, vec![])));
        assert!(session.on_unit_begin(&anonymous).unwrap().is_none());
    }

    #[test]
    fn test_aborted_call_closes_open_statements() {
        let (session, clock) = session();
        let unit = unit();
        let (_, looping, perform) = children(&unit);

        let mut inv = session.on_unit_begin(&unit).unwrap().unwrap();
        inv.on_statement_begin(looping).unwrap();
        inv.on_statement_begin(perform).unwrap();
        clock.advance(7);
        session.on_unit_end(inv, true).unwrap();

        let rows = session.prepare_result(&unit).unwrap();
        let perform_row = rows.iter().find(|r| r.line_number == 4).unwrap();
        assert_eq!(perform_row.exec_count, 1);
        assert_eq!(perform_row.exec_count_err, 1);
        assert_eq!(perform_row.total_time_us, 7);

        let summary = session.stats().get(UnitKey::new(40, 1)).unwrap().unwrap();
        assert_eq!(summary.exec_count_err, 1);
    }

    #[test]
    fn test_invalidate_reclaims_chunks() {
        let (session, _) = session();
        let unit = unit();

        let inv = session.on_unit_begin(&unit).unwrap().unwrap();
        session.on_unit_end(inv, false).unwrap();
        assert_eq!(session.store().info().used_chunks, 1);

        assert_eq!(session.invalidate(Some(UnitKey::new(40, 1))).unwrap(), 1);
        assert_eq!(session.store().info().used_chunks, 0);

        // never-profiled again: zero rows counters
        let rows = session.prepare_result(&unit).unwrap();
        assert!(rows.iter().all(|r| r.exec_count == 0));
    }

    #[test]
    fn test_report_includes_lines() {
        let (session, _) = session();
        let unit = unit();

        let inv = session.on_unit_begin(&unit).unwrap().unwrap();
        session.on_unit_end(inv, false).unwrap();

        let source = "begin\n  x := 1;\n  for i in 1..2 loop\n    perform f();\n  end loop;\nend";
        let report = session.report(&unit, Some(source)).unwrap();

        assert_eq!(report.lines.len(), 6);
        assert_eq!(report.statements.len(), 3);
        assert_eq!(report.coverage.counts.statements, 3);
        assert_eq!(report.summary.map(|s| s.exec_count), Some(1));
    }
}
