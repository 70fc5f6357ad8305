//! Output writers for reports and region dumps.
//!
//! This module handles writing data to disk as pretty-printed JSON.

pub mod json;

// Re-export main functions
pub use json::{read_dump, read_report, write_dump, write_report};
