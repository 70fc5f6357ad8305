//! plprofiler
//!
//! Per-statement execution profiling and coverage for an embedded
//! procedural-language interpreter.
//!
//! The host interpreter drives a `ProfilerSession` through four hooks
//! (unit begin/end, statement begin/end). Statistics are kept per compiled
//! incarnation in a fixed-capacity chunk store, shared between processes
//! through a mapped file or kept in session-local memory.
//!
//! ## Getting Started
//!
//! ```ignore
//! let store = Arc::new(ProfilerStore::open(&StoreConfig::local())?);
//! let session = ProfilerSession::new(store);
//!
//! if let Some(mut call) = session.on_unit_begin(&unit)? {
//!     call.on_statement_begin(stmt)?;
//!     call.on_statement_end(stmt, rows, false)?;
//!     session.on_unit_end(call, false)?;
//! }
//! let rows = session.prepare_result(&unit)?;
//! ```

pub mod commands;
pub mod coverage;
pub mod model;
pub mod output;
pub mod profiler;
pub mod report;
pub mod stats;
pub mod store;
pub mod utils;

pub use profiler::ProfilerSession;
pub use store::ProfilerStore;
pub use utils::config::StoreConfig;
pub use utils::error::ProfilerError;
