//! Persistent statement statistics.
//!
//! This module handles:
//! - The persisted record and chunk layout
//! - The fixed-capacity region (shared file mapping or local memory)
//! - Folding per-call statistics into stored chunks
//! - Per-procedure call statistics slots
//! - Resetting stored profiles

mod chunk_store;
mod locks;
pub mod record;
pub(crate) mod region;

// Re-export main types
pub use chunk_store::{ProfilerStore, RegionInfo, ResetScope};
pub use record::{chunks_needed, Chunk, ChunkKey, StatementRecord};
