//! Error types for the entire crate.
//!
//! We use `thiserror` for library-style errors with custom types,
//! and `anyhow` for application-level error propagation in main.rs and commands.
//!
//! Everything except `ResourceExhausted`, `UnitTableFull` and `Io` is an
//! internal consistency violation: the current operation stops and the error is never retried.

use thiserror::Error;

/// Errors raised by the chunk store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("chunk region is full ({capacity} chunks)")]
    ResourceExhausted { capacity: usize },

    #[error("broken consistency of profiler chunks: chunk {chunk_number} of unit {unit_id} already exists")]
    DuplicateChunk { unit_id: u32, chunk_number: i16 },

    #[error("broken consistency of profiler chunks: chunk {chunk_number} of unit {unit_id} is missing")]
    MissingChunk { unit_id: u32, chunk_number: i16 },

    #[error("broken consistency of profiler chunks: chunk {chunk_number} of unit {unit_id} lies beyond the statement layout")]
    UnexpectedChunk { unit_id: u32, chunk_number: i16 },

    #[error("broken consistency of profiler chunks: stored line {found}, merged line {expected}")]
    RecordMismatch { expected: i32, found: i32 },

    #[error("incompatible chunk region: {0}")]
    FormatMismatch(String),

    #[error("call statistics table is full ({capacity} procedures)")]
    UnitTableFull { capacity: usize },

    #[error("chunk region must hold at least one chunk and one procedure")]
    RegionTooSmall,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while walking a statement tree
#[derive(Error, Debug)]
pub enum WalkError {
    #[error("broken statement map: visited statement {expected}, cursor at {found}")]
    CursorDesync { expected: usize, found: usize },

    #[error("broken statement map: profile ended before statement {0}")]
    CursorExhausted(usize),

    #[error("broken statement map: cannot find statement on line {line}")]
    UnmappedStatement { line: i32 },

    #[error("broken statement map: native id {0} assigned twice")]
    DuplicateNativeId(u32),

    #[error("broken consistency of profile: statement {natural_id} is on line {expected}, stored record on line {found}")]
    StaleRecord {
        natural_id: usize,
        expected: i32,
        found: i32,
    },

    #[error("broken statement map: tree has {found} statements, interpreter reported {expected}")]
    StatementCountMismatch { expected: usize, found: usize },
}

/// Top-level profiler error
#[derive(Error, Debug)]
pub enum ProfilerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Walk(#[from] WalkError),
}

impl ProfilerError {
    /// Resource exhaustion is the only failure a caller may reasonably
    /// ignore; every other variant means shared state can't be trusted.
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            ProfilerError::Store(StoreError::ResourceExhausted { .. } | StoreError::UnitTableFull { .. })
        )
    }
}

/// Errors that can occur during file output
#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Failed to write file: {0}")]
    WriteFailed(#[from] std::io::Error),

    #[error("Failed to serialize JSON: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    #[error("Invalid output path: {0}")]
    InvalidPath(String),
}
