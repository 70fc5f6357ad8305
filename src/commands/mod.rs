//! CLI command implementations.
//!
//! Each command is implemented in its own module.
//! Commands orchestrate the various library components to perform user tasks.

pub mod region;
pub mod utils;

// Re-export main command functions
pub use region::{execute_dump, execute_info, execute_init, execute_reset};
pub use utils::{display_schema, display_version};
