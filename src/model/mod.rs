//! Host-facing model: statement trees, compiled units and identity keys.

pub mod identity;
pub mod stmt;
pub mod unit;

// Re-export main types
pub use identity::{IdentityKey, UnitKey};
pub use stmt::{LoopKind, SimpleKind, Stmt, StmtKind};
pub use unit::{CompiledUnit, IncarnationHandle};
