//! Coverage accumulation.
//!
//! A thin consumer of the walker's `CollectCoverage` mode.

pub mod accumulator;

// Re-export main types
pub use accumulator::{collect, CoverageCounts, CoverageReport};
