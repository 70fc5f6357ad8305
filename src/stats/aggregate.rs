//! Per-procedure call statistics.
//!
//! One record per logical procedure (`UnitKey`), shared by all of its
//! incarnations and by every process attached to the region. Records live
//! in the region's unit table; each has its own mutex word, and the table
//! lock is only taken for writing when a procedure is seen for the first
//! time.

use crate::model::UnitKey;
use crate::store::region::ChunkRegion;
use crate::utils::error::StoreError;
use log::{debug, info};
use serde::{Deserialize, Serialize};

/// Running call statistics of one procedure, as stored in the region
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub(crate) struct UnitStats {
    exec_count: u64,
    exec_count_err: u64,
    total_time_us: u64,
    /// Youngs-Cramer sum of squared deviations
    sum_sq_dev: f64,
    min_time_us: u64,
    max_time_us: u64,
}

impl UnitStats {
    fn record(&mut self, elapsed_us: u64, is_error: bool) {
        self.exec_count += 1;
        self.total_time_us += elapsed_us;

        if self.exec_count > 1 {
            let n = self.exec_count as f64;
            let tmp = elapsed_us as f64 * n - self.total_time_us as f64;
            self.sum_sq_dev += tmp * tmp / (n * (n - 1.0));
            self.min_time_us = self.min_time_us.min(elapsed_us);
            self.max_time_us = self.max_time_us.max(elapsed_us);
        } else {
            self.sum_sq_dev = 0.0;
            self.min_time_us = elapsed_us;
            self.max_time_us = elapsed_us;
        }

        if is_error {
            self.exec_count_err += 1;
        }
    }
}

/// Aggregate statistics of one procedure as reported
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub unit_id: u32,
    pub owner_db_id: u32,
    pub exec_count: u64,
    pub exec_count_err: u64,
    pub total_time_us: u64,
    pub mean_time_us: f64,
    /// Population standard deviation
    pub stddev_time_us: f64,
    pub min_time_us: u64,
    pub max_time_us: u64,
}

impl UnitSummary {
    fn new(key: UnitKey, stats: &UnitStats) -> Self {
        let n = stats.exec_count as f64;
        let (mean, stddev) = if stats.exec_count > 0 {
            (stats.total_time_us as f64 / n, (stats.sum_sq_dev / n).sqrt())
        } else {
            (0.0, 0.0)
        };

        Self {
            unit_id: key.unit_id,
            owner_db_id: key.owner_db_id,
            exec_count: stats.exec_count,
            exec_count_err: stats.exec_count_err,
            total_time_us: stats.total_time_us,
            mean_time_us: mean,
            stddev_time_us: stddev,
            min_time_us: stats.min_time_us,
            max_time_us: stats.max_time_us,
        }
    }
}

/// View of the call-statistics table of one store
///
/// **Public** - obtained from `ProfilerStore::stats`
pub struct AggregateStats<'a> {
    region: &'a ChunkRegion,
}

impl<'a> AggregateStats<'a> {
    pub(crate) fn new(region: &'a ChunkRegion) -> Self {
        Self { region }
    }

    /// Account one finished call of a procedure
    ///
    /// # Errors
    /// * `StoreError::UnitTableFull` - no slot left for a new procedure
    pub fn record(&self, key: UnitKey, elapsed_us: u64, is_error: bool) -> Result<(), StoreError> {
        loop {
            {
                let table = self.region.lock_shared()?;
                if let Some(index) = self.region.find_unit(&table, &key) {
                    let guard = self.region.lock_unit(index);
                    let mut stats = self.region.read_unit(&guard, index);
                    stats.record(elapsed_us, is_error);
                    self.region.write_unit(&guard, index, &stats);
                    return Ok(());
                }
            }

            let table = self.region.lock_exclusive()?;
            // another process may have added it between the two locks
            if self.region.find_unit(&table, &key).is_none() {
                debug!("New statistics record for unit {}", key.unit_id);
                let index = self.region.insert_unit(&table, &key)?;
                let mut stats = UnitStats::default();
                stats.record(elapsed_us, is_error);
                self.region.write_unit(&table, index, &stats);
                return Ok(());
            }
        }
    }

    pub fn get(&self, key: UnitKey) -> Result<Option<UnitSummary>, StoreError> {
        let table = self.region.lock_shared()?;
        let Some(index) = self.region.find_unit(&table, &key) else {
            return Ok(None);
        };

        let guard = self.region.lock_unit(index);
        Ok(Some(UnitSummary::new(key, &self.region.read_unit(&guard, index))))
    }

    /// Summaries of every procedure, ordered by database and unit id
    pub fn snapshot(&self) -> Result<Vec<UnitSummary>, StoreError> {
        let table = self.region.lock_shared()?;

        let mut summaries: Vec<UnitSummary> = (0..self.region.unit_capacity())
            .filter_map(|index| {
                let key = self.region.unit_key_at(&table, index)?;
                let guard = self.region.lock_unit(index);
                Some(UnitSummary::new(key, &self.region.read_unit(&guard, index)))
            })
            .collect();

        summaries.sort_by_key(|s| (s.owner_db_id, s.unit_id));
        Ok(summaries)
    }

    /// Summaries of procedures owned by `current_db`, ordered by unit id
    pub fn read_all(&self, current_db: u32) -> Result<Vec<UnitSummary>, StoreError> {
        let mut summaries = self.snapshot()?;
        summaries.retain(|s| s.owner_db_id == current_db);
        Ok(summaries)
    }

    /// Forget one procedure (`Some`) or all of them; returns the number removed
    pub fn reset(&self, key: Option<UnitKey>) -> Result<usize, StoreError> {
        let table = self.region.lock_exclusive()?;

        let removed = match key {
            Some(key) => match self.region.find_unit(&table, &key) {
                Some(index) => {
                    self.region.remove_unit(&table, index);
                    1
                }
                None => 0,
            },
            None => {
                let removed = self.region.units_used();
                self.region.clear_units(&table);
                removed
            }
        };

        info!("Call statistics reset: removed {} records", removed);
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.region.units_used()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
