//! Per-invocation statement timers.
//!
//! A buffer belongs to exactly one in-flight call and is folded into the
//! store when the call ends. Times are inclusive here; `FoldTime` later
//! subtracts nested time.

use super::statement_map::StatementMap;
use crate::store::StatementRecord;
use crate::utils::config::MAX_OPEN_STATEMENTS;
use log::{debug, warn};

/// Timers of one statement during one call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStatement {
    pub line_number: i32,
    pub fingerprint: Option<u64>,
    pub elapsed_accum_us: u64,
    pub max_elapsed_us: u64,
    pub rows: u64,
    pub exec_count: u64,
    pub exec_count_err: u64,
    started_at: Option<u64>,
}

impl CallStatement {
    pub fn is_open(&self) -> bool {
        self.started_at.is_some()
    }
}

/// Statement timers of one call, indexed by natural id
#[derive(Debug)]
pub struct LocalCallBuffer {
    statements: Vec<CallStatement>,

    /// Natural ids of statements that began and have not ended yet
    open: Vec<usize>,

    /// Running statements that began while `open` was full
    untracked: usize,

    overflow_logged: bool,

    started_at: u64,
}

impl LocalCallBuffer {
    pub fn new(map: &StatementMap, started_at: u64) -> Self {
        let statements = map
            .lines()
            .iter()
            .zip(map.fingerprints())
            .map(|(&line_number, &fingerprint)| CallStatement {
                line_number,
                fingerprint,
                ..CallStatement::default()
            })
            .collect();

        Self {
            statements,
            open: Vec::new(),
            untracked: 0,
            overflow_logged: false,
            started_at,
        }
    }

    pub fn started_at(&self) -> u64 {
        self.started_at
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn statement(&self, natural_id: usize) -> Option<&CallStatement> {
        self.statements.get(natural_id)
    }

    pub(crate) fn statement_mut(&mut self, natural_id: usize) -> Option<&mut CallStatement> {
        self.statements.get_mut(natural_id)
    }

    /// Start the timer of a statement.
    ///
    /// A statement that is still running from an earlier begin was left by
    /// an error; that execution is counted first.
    pub fn begin_statement(&mut self, natural_id: usize, now: u64) {
        let Some(entry) = self.statements.get(natural_id) else {
            return;
        };
        if entry.is_open() {
            self.end_statement(natural_id, now, 0, true);
        }
        self.statements[natural_id].started_at = Some(now);

        if self.open.len() < MAX_OPEN_STATEMENTS {
            self.open.push(natural_id);
            return;
        }

        self.untracked += 1;
        if !self.overflow_logged {
            self.overflow_logged = true;
            warn!(
                "More than {} nested statements open, deeper ones are closed with their enclosing statement",
                MAX_OPEN_STATEMENTS
            );
        }
    }

    /// Stop the timer of a statement and count the execution.
    ///
    /// Statements opened after this one and still running were skipped by
    /// an exception; they are closed first, as errors.
    pub fn end_statement(&mut self, natural_id: usize, now: u64, rows: u64, is_error: bool) {
        match self.open.iter().rposition(|&id| id == natural_id) {
            Some(pos) => {
                let orphans: Vec<usize> = self.open.drain(pos..).skip(1).collect();
                for orphan in orphans.into_iter().rev() {
                    self.close(orphan, now, 0, true);
                }

                // statements beyond the stack all began inside this one
                if self.untracked > 0 {
                    self.close_untracked(natural_id, now);
                }
            }
            None => {
                if self.statements.get(natural_id).is_some_and(CallStatement::is_open) {
                    self.untracked = self.untracked.saturating_sub(1);
                }
            }
        }

        self.close(natural_id, now, rows, is_error);
    }

    /// Close, as errors, running statements that are not on the stack
    fn close_untracked(&mut self, except: usize, now: u64) -> usize {
        let mut closed = 0;

        for natural_id in 0..self.statements.len() {
            if natural_id != except
                && !self.open.contains(&natural_id)
                && self.close(natural_id, now, 0, true)
            {
                closed += 1;
            }
        }

        self.untracked = 0;
        closed
    }

    /// Close every statement still running (abnormal unwind)
    pub fn close_open(&mut self, now: u64) -> usize {
        let mut closed = 0;

        while let Some(natural_id) = self.open.pop() {
            if self.close(natural_id, now, 0, true) {
                closed += 1;
            }
        }

        if self.untracked > 0 {
            closed += self.close_untracked(usize::MAX, now);
        }

        if closed > 0 {
            debug!("Closed {} statements left open by an error", closed);
        }
        closed
    }

    /// Credit the root statement with one execution spanning the whole call
    /// when the host never reported it
    pub fn credit_entry(&mut self, now: u64) {
        let elapsed = now.saturating_sub(self.started_at);

        if let Some(entry) = self.statements.first_mut() {
            if entry.exec_count == 0 {
                entry.exec_count = 1;
                entry.elapsed_accum_us = elapsed;
                entry.max_elapsed_us = elapsed;
            }
        }
    }

    /// Records in natural order, ready for `ProfilerStore::fold`
    pub fn to_records(&self) -> Vec<StatementRecord> {
        self.statements
            .iter()
            .map(|stmt| {
                let mut record = StatementRecord::new(stmt.line_number).with_fingerprint(stmt.fingerprint);
                record.max_time_us = stmt.max_elapsed_us;
                record.total_time_us = stmt.elapsed_accum_us;
                record.rows_processed = stmt.rows;
                record.exec_count = stmt.exec_count;
                record.exec_count_err = stmt.exec_count_err;
                record
            })
            .collect()
    }

    /// Returns false if the statement was not running
    fn close(&mut self, natural_id: usize, now: u64, rows: u64, is_error: bool) -> bool {
        let Some(entry) = self.statements.get_mut(natural_id) else {
            return false;
        };
        let Some(started_at) = entry.started_at.take() else {
            return false;
        };

        let elapsed = now.saturating_sub(started_at);
        entry.elapsed_accum_us += elapsed;
        entry.max_elapsed_us = entry.max_elapsed_us.max(elapsed);
        entry.rows += rows;
        entry.exec_count += 1;
        if is_error {
            entry.exec_count_err += 1;
        }
        true
    }

    /// Seed timers directly
    #[cfg(test)]
    pub(crate) fn record(&mut self, natural_id: usize, elapsed_us: u64, max_us: u64, exec_count: u64) {
        let entry = &mut self.statements[natural_id];
        entry.elapsed_accum_us = elapsed_us;
        entry.max_elapsed_us = max_us;
        entry.exec_count = exec_count;
    }
}
