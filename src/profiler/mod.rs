//! Execution profiling.
//!
//! This module handles:
//! - Mapping host statements to natural (source-order) ids
//! - The generic statement walker and its four modes
//! - Per-call statement timers
//! - The host hook surface (`ProfilerSession`)

pub mod call_buffer;
pub mod session;
pub mod statement_map;
pub mod walker;

// Re-export main types
pub use call_buffer::{CallStatement, LocalCallBuffer};
pub use session::{Clock, Invocation, ManualClock, MonotonicClock, ProfilerSession};
pub use statement_map::{StatementMap, StatementMapCache};
pub use walker::{walk, CollectCoverage, FoldTime, PrepareResult, RecordCursor, Visit, Walk};
