//! Configuration and constants for the profiler.

use std::path::PathBuf;

/// Number of statement records held by one chunk
pub const STATEMENTS_PER_CHUNK: usize = 30;

/// Default capacity of the chunk region.
// 15000 chunks x 30 statements is enough for ~450K profiled statements
pub const MAX_SHARED_CHUNKS: usize = 15_000;

/// Default capacity of the call-statistics table (one slot per procedure)
pub const MAX_UNIT_STATS: usize = 10_000;

/// Statement maps kept per process before the least recently used go
pub const MAX_CACHED_MAPS: usize = 1024;

/// Depth of the explicit open-statement stack kept per invocation
pub const MAX_OPEN_STATEMENTS: usize = 64;

/// Magic bytes at the start of every chunk region
pub const REGION_MAGIC: &[u8; 8] = b"PLPROF\0\x01";

/// Layout version of the chunk region. Bump on any record/chunk change.
pub const REGION_FORMAT_VERSION: u32 = 2;

/// Current output schema version for JSON reports
pub const REPORT_SCHEMA_VERSION: &str = "1.0.0";

/// Environment variable naming the shared region file
pub const REGION_PATH_ENV: &str = "PLPROFILER_REGION";

/// Where the chunk store keeps its records.
///
/// **Public** - passed to `ProfilerStore::open`
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// File backing the shared region. `None` selects session-local memory.
    pub region_path: Option<PathBuf>,

    /// Maximum number of chunks the region can hold
    pub capacity: usize,

    /// Maximum number of procedures with call statistics
    pub unit_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            region_path: None,
            capacity: MAX_SHARED_CHUNKS,
            unit_capacity: MAX_UNIT_STATS,
        }
    }
}

impl StoreConfig {
    pub fn local() -> Self {
        Self::default()
    }

    pub fn shared(path: impl Into<PathBuf>) -> Self {
        Self {
            region_path: Some(path.into()),
            ..Self::default()
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_unit_capacity(mut self, unit_capacity: usize) -> Self {
        self.unit_capacity = unit_capacity;
        self
    }
}
