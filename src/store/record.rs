//! Persisted record layout.
//!
//! Chunks are read by mapping the region directly, so every type here is
//! `repr(C)` with explicit padding. Changing any of them requires bumping
//! `REGION_FORMAT_VERSION`.

use crate::model::IdentityKey;
use crate::utils::config::STATEMENTS_PER_CHUNK;
use serde::{Deserialize, Serialize};

/// Statistics of one statement of one incarnation
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementRecord {
    /// Source line, or -1 for an unused slot
    pub line_number: i32,
    #[serde(skip)]
    _pad0: u32,
    /// Fingerprint of the statement's query (0 = none)
    pub query_fingerprint: u64,
    pub has_fingerprint: bool,
    #[serde(skip)]
    _pad1: [u8; 7],
    pub max_time_us: u64,
    pub total_time_us: u64,
    pub rows_processed: u64,
    pub exec_count: u64,
    pub exec_count_err: u64,
}

const _: () = assert!(std::mem::size_of::<StatementRecord>() == 64);

impl StatementRecord {
    /// Unused-slot sentinel
    pub const UNUSED: StatementRecord = StatementRecord {
        line_number: -1,
        _pad0: 0,
        query_fingerprint: 0,
        has_fingerprint: false,
        _pad1: [0; 7],
        max_time_us: 0,
        total_time_us: 0,
        rows_processed: 0,
        exec_count: 0,
        exec_count_err: 0,
    };

    /// Empty record for a statement on `line_number`
    pub fn new(line_number: i32) -> Self {
        Self {
            line_number,
            ..Self::UNUSED
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: Option<u64>) -> Self {
        self.query_fingerprint = fingerprint.unwrap_or(0);
        self.has_fingerprint = fingerprint.is_some();
        self
    }

    pub fn fingerprint(&self) -> Option<u64> {
        self.has_fingerprint.then_some(self.query_fingerprint)
    }

    /// Merge counters of another call of the same statement
    pub fn merge(&mut self, other: &StatementRecord) {
        self.max_time_us = self.max_time_us.max(other.max_time_us);
        self.total_time_us += other.total_time_us;
        self.rows_processed += other.rows_processed;
        self.exec_count += other.exec_count;
        self.exec_count_err += other.exec_count_err;

        if !self.has_fingerprint && other.has_fingerprint {
            self.query_fingerprint = other.query_fingerprint;
            self.has_fingerprint = true;
        }
    }
}

impl Default for StatementRecord {
    fn default() -> Self {
        Self::UNUSED
    }
}

/// Hash key of one chunk
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub identity: IdentityKey,
    /// 1-based; chunk 1 carries the incarnation mutex
    pub chunk_number: i16,
    #[serde(skip)]
    _pad: [u8; 6],
}

const _: () = assert!(std::mem::size_of::<ChunkKey>() == 32);

impl ChunkKey {
    pub fn new(identity: IdentityKey, chunk_number: i16) -> Self {
        Self {
            identity,
            chunk_number,
            _pad: [0; 6],
        }
    }

    pub fn first(identity: IdentityKey) -> Self {
        Self::new(identity, 1)
    }

    pub fn next(&self) -> Self {
        Self::new(self.identity, self.chunk_number + 1)
    }

    /// Stable hash used for slot placement. Must be identical in every
    /// process attached to a region, so no per-process random state.
    pub(crate) fn slot_hash(&self) -> u64 {
        let id = &self.identity;
        let mut h = splitmix(u64::from(id.unit_id) << 32 | u64::from(id.owner_db_id));
        h = splitmix(h ^ id.version_stamp);
        h = splitmix(h ^ id.physical_location);
        splitmix(h ^ self.chunk_number as u16 as u64)
    }
}

pub(crate) fn splitmix(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Copy of one chunk, detached from the region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub key: ChunkKey,
    pub records: Vec<StatementRecord>,
}

impl Chunk {
    /// Records in use (up to the first sentinel)
    pub fn used_records(&self) -> impl Iterator<Item = &StatementRecord> {
        self.records.iter().take_while(|r| r.line_number != -1)
    }
}

/// Number of chunks needed for `nstatements` records
pub fn chunks_needed(nstatements: usize) -> usize {
    nstatements.div_ceil(STATEMENTS_PER_CHUNK).max(1)
}
