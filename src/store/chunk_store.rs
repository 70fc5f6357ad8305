//! Chunked persistent statement store.
//!
//! Statistics of one incarnation live in chunks `1..=K`, 30 records each,
//! in natural statement order. Concurrency follows two tiers:
//!
//! - the table lock, shared for lookups and exclusive for structural
//!   changes (insert/remove);
//! - the mutex of chunk 1, which serializes counter merges of every chunk
//!   of that incarnation.
//!
//! All locks are scope guards, so a failing fold releases whatever it holds.

use super::locks::{ExclusiveGuard, SharedGuard, TableAccess};
use super::record::{chunks_needed, Chunk, ChunkKey, StatementRecord};
use super::region::{ChunkRecords, ChunkRegion};
use crate::model::{IdentityKey, UnitKey};
use crate::stats::AggregateStats;
use crate::utils::config::{StoreConfig, STATEMENTS_PER_CHUNK};
use crate::utils::error::StoreError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What `ProfilerStore::reset` removes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetScope {
    /// Every chunk in the table
    All,

    /// Every chunk of one incarnation
    Incarnation(IdentityKey),

    /// Every chunk of every incarnation of one procedure
    Unit(UnitKey),
}

/// Summary of the backing region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionInfo {
    pub shared: bool,
    pub format_version: u32,
    pub capacity: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
    pub unit_capacity: usize,
    pub used_units: usize,
}

/// Handle to the chunk table
///
/// **Public** - passed to every profiling and reporting operation
pub struct ProfilerStore {
    region: ChunkRegion,
}

impl ProfilerStore {
    /// Open the store described by `config`.
    ///
    /// A shared region that cannot be opened degrades to session-local
    /// memory with the same capacities.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        if let Some(path) = &config.region_path {
            match Self::shared_with(path, config) {
                Ok(store) => return Ok(store),
                Err(e) => warn!(
                    "Shared profiler region {} unavailable ({}), using local memory",
                    path.display(),
                    e
                ),
            }
        }

        Ok(Self {
            region: ChunkRegion::anonymous(config.capacity, config.unit_capacity)?,
        })
    }

    /// Session-local store
    pub fn local(capacity: usize) -> Result<Self, StoreError> {
        Self::open(&StoreConfig::local().with_capacity(capacity))
    }

    /// Shared store backed by `path`; creates and initializes the file
    /// when it is empty. No fallback.
    pub fn shared(path: impl AsRef<Path>, capacity: usize) -> Result<Self, StoreError> {
        Self::shared_with(path, &StoreConfig::default().with_capacity(capacity))
    }

    /// Like `shared`, taking both capacities from `config`. An existing
    /// region keeps the capacities it was created with.
    pub fn shared_with(path: impl AsRef<Path>, config: &StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            region: ChunkRegion::open_file(path.as_ref(), config.capacity, config.unit_capacity)?,
        })
    }

    /// Attach to an already initialized shared region
    pub fn attach(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Ok(Self {
            region: ChunkRegion::attach(path.as_ref())?,
        })
    }

    /// Flush and release the mapping
    pub fn close(self) -> Result<(), StoreError> {
        self.region.flush()
    }

    pub fn is_shared(&self) -> bool {
        self.region.is_file_backed()
    }

    pub fn info(&self) -> RegionInfo {
        let capacity = self.region.capacity();
        let used_chunks = self.region.used();

        RegionInfo {
            shared: self.is_shared(),
            format_version: self.region.format_version(),
            capacity,
            used_chunks,
            free_chunks: capacity.saturating_sub(used_chunks),
            unit_capacity: self.region.unit_capacity(),
            used_units: self.region.units_used(),
        }
    }

    /// Per-procedure call statistics kept in the same region
    pub fn stats(&self) -> AggregateStats<'_> {
        AggregateStats::new(&self.region)
    }

    /// Copy of one chunk, if present
    ///
    /// **Public** - takes only the shared table lock
    pub fn find_chunk(&self, identity: &IdentityKey, chunk_number: i16) -> Result<Option<Chunk>, StoreError> {
        let key = ChunkKey::new(*identity, chunk_number);
        let table = self.region.lock_shared()?;
        let Some(index) = self.region.find(&table, &key) else {
            return Ok(None);
        };

        // chunk 1 is the incarnation's mutex holder for every chunk
        let first = if chunk_number == 1 {
            Some(index)
        } else {
            self.region.find(&table, &ChunkKey::first(*identity))
        };
        let Some(first) = first else {
            return Ok(None);
        };
        let guard = self.region.lock_chunk(first);

        Ok(Some(Chunk {
            key,
            records: self.region.read_records(&guard, index).to_vec(),
        }))
    }

    /// Insert an empty chunk. Inserting an existing chunk is a consistency
    /// error.
    pub fn insert_chunk(&self, identity: &IdentityKey, chunk_number: i16) -> Result<Chunk, StoreError> {
        let key = ChunkKey::new(*identity, chunk_number);
        let table = self.region.lock_exclusive()?;
        let index = self.region.insert(&table, &key)?;

        Ok(Chunk {
            key,
            records: self.region.read_records(&table, index).to_vec(),
        })
    }

    /// Merge one call's per-statement records (natural order) into the
    /// stored profile of `identity`
    ///
    /// **Public** - called at function end
    ///
    /// # Errors
    /// * `StoreError::ResourceExhausted` - first fold found no room; nothing
    ///   is stored for this call
    /// * `StoreError::MissingChunk`, `StoreError::UnexpectedChunk`,
    ///   `StoreError::RecordMismatch` - stored profile does not belong to
    ///   this statement layout; nothing is merged
    pub fn fold(&self, identity: &IdentityKey, records: &[StatementRecord]) -> Result<(), StoreError> {
        let first = ChunkKey::first(*identity);

        loop {
            {
                let table = self.region.lock_shared()?;
                if let Some(index) = self.region.find(&table, &first) {
                    return self.merge_existing(&table, index, &first, records);
                }
            }

            let table = self.region.lock_exclusive()?;
            // another process may have created it between the two locks
            if self.region.find(&table, &first).is_none() {
                return self.create_all(&table, &first, records);
            }
        }
    }

    /// First fold of an incarnation: create every chunk while holding the
    /// exclusive lock, so nobody sees a partially chunked incarnation
    fn create_all(
        &self,
        table: &ExclusiveGuard<'_>,
        first: &ChunkKey,
        records: &[StatementRecord],
    ) -> Result<(), StoreError> {
        let needed = chunks_needed(records.len());
        let mut created = Vec::with_capacity(needed);
        let mut key = *first;

        for part in 0..needed {
            let index = match self.region.insert(table, &key) {
                Ok(index) => index,
                Err(e) => {
                    for index in created {
                        self.region.remove(table, index);
                    }
                    return Err(e);
                }
            };
            created.push(index);

            let mut page: ChunkRecords = [StatementRecord::UNUSED; STATEMENTS_PER_CHUNK];
            let local = page_of(records, part);
            page[..local.len()].copy_from_slice(local);
            self.region.write_records(table, index, &page);

            key = key.next();
        }

        debug!(
            "Created {} chunks for unit {} ({} statements)",
            needed,
            first.identity.unit_id,
            records.len()
        );
        Ok(())
    }

    /// Merge into existing chunks. Every page is checked against the local
    /// layout before any is written back.
    fn merge_existing(
        &self,
        table: &SharedGuard<'_>,
        first_index: usize,
        first: &ChunkKey,
        records: &[StatementRecord],
    ) -> Result<(), StoreError> {
        let guard = self.region.lock_chunk(first_index);
        let needed = chunks_needed(records.len());
        let mut merged = Vec::with_capacity(needed);
        let mut key = *first;

        for part in 0..needed {
            let index = if part == 0 {
                first_index
            } else {
                key = key.next();
                self.find_required(table, &key)?
            };

            let local = page_of(records, part);
            let mut page = self.region.read_records(&guard, index);
            for (stored, local) in page.iter_mut().zip(local) {
                if stored.line_number != local.line_number {
                    return Err(StoreError::RecordMismatch {
                        expected: local.line_number,
                        found: stored.line_number,
                    });
                }
                stored.merge(local);
            }

            // the stored layout must end where the local one does
            if let Some(extra) = page.get(local.len()) {
                if extra.line_number != StatementRecord::UNUSED.line_number {
                    return Err(StoreError::RecordMismatch {
                        expected: StatementRecord::UNUSED.line_number,
                        found: extra.line_number,
                    });
                }
            }
            merged.push((index, page));
        }

        let beyond = key.next();
        if self.region.find(table, &beyond).is_some() {
            return Err(StoreError::UnexpectedChunk {
                unit_id: beyond.identity.unit_id,
                chunk_number: beyond.chunk_number,
            });
        }

        for (index, page) in &merged {
            self.region.write_records(&guard, *index, page);
        }
        Ok(())
    }

    fn find_required(&self, table: &impl TableAccess, key: &ChunkKey) -> Result<usize, StoreError> {
        self.region.find(table, key).ok_or(StoreError::MissingChunk {
            unit_id: key.identity.unit_id,
            chunk_number: key.chunk_number,
        })
    }

    /// Consistent copy of every stored record of an incarnation, chunk by
    /// chunk (unused tail slots included). `None` if it was never folded.
    pub fn read_records(&self, identity: &IdentityKey) -> Result<Option<Vec<StatementRecord>>, StoreError> {
        let first = ChunkKey::first(*identity);
        let table = self.region.lock_shared()?;
        let Some(first_index) = self.region.find(&table, &first) else {
            return Ok(None);
        };
        let guard = self.region.lock_chunk(first_index);

        let mut records = Vec::new();
        let mut key = first;
        let mut index = Some(first_index);

        while let Some(current) = index {
            records.extend_from_slice(&self.region.read_records(&guard, current));
            key = key.next();
            index = self.region.find(&table, &key);
        }

        Ok(Some(records))
    }

    /// Remove stored chunks; returns how many were removed. Call statistics
    /// are reset separately through `stats()`.
    ///
    /// **Public** - administrative entry point and invalidation path
    pub fn reset(&self, scope: ResetScope) -> Result<usize, StoreError> {
        let table = self.region.lock_exclusive()?;

        let removed = match scope {
            ResetScope::All => {
                let used = self.region.used();
                self.region.clear(&table);
                used
            }
            ResetScope::Incarnation(identity) => {
                let mut key = ChunkKey::first(identity);
                let mut removed = 0;
                while let Some(index) = self.region.find(&table, &key) {
                    self.region.remove(&table, index);
                    removed += 1;
                    key = key.next();
                }
                removed
            }
            ResetScope::Unit(unit) => {
                let mut removed = 0;
                for index in 0..self.region.capacity() {
                    let matches = self
                        .region
                        .key_at(&table, index)
                        .is_some_and(|key| key.identity.unit_key() == unit);
                    if matches {
                        self.region.remove(&table, index);
                        removed += 1;
                    }
                }
                removed
            }
        };

        info!("Profiler reset ({:?}): removed {} chunks", scope, removed);
        Ok(removed)
    }

    /// Snapshot of every stored chunk, ordered by identity and chunk number
    pub fn dump(&self) -> Result<Vec<Chunk>, StoreError> {
        let table = self.region.lock_exclusive()?;

        let mut chunks: Vec<Chunk> = (0..self.region.capacity())
            .filter_map(|index| {
                self.region.key_at(&table, index).map(|key| Chunk {
                    key,
                    records: self.region.read_records(&table, index).to_vec(),
                })
            })
            .collect();

        chunks.sort_by_key(|c| {
            let id = c.key.identity;
            (id.owner_db_id, id.unit_id, id.version_stamp, id.physical_location, c.key.chunk_number)
        });
        Ok(chunks)
    }
}

/// Slice of `records` stored in chunk `part` (0-based)
fn page_of(records: &[StatementRecord], part: usize) -> &[StatementRecord] {
    let from = (part * STATEMENTS_PER_CHUNK).min(records.len());
    let to = (from + STATEMENTS_PER_CHUNK).min(records.len());
    &records[from..to]
}
