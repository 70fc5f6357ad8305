//! Compiled procedure incarnations.

use super::stmt::Stmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-local handle of one compiled copy of a procedure.
///
/// Two processes compiling the same source get different handles but the
/// same `IdentityKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IncarnationHandle(pub u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

impl IncarnationHandle {
    pub fn next() -> Self {
        Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
    }
}

/// One compiled incarnation of a procedure.
///
/// Not `Clone`: statement maps may identify statements by address, so a
/// copy of the tree under the same handle would not resolve.
#[derive(Debug)]
pub struct CompiledUnit {
    pub handle: IncarnationHandle,

    /// Object id of the procedure; 0 marks anonymous code blocks
    pub unit_id: u32,

    /// Database owning the procedure
    pub owner_db_id: u32,

    /// Changes on every source edit
    pub version_stamp: u64,

    /// Physical location of the definition row
    pub physical_location: u64,

    pub name: String,

    /// Statement count as reported by the interpreter
    pub nstatements: usize,

    /// Root statement (usually an outer block)
    pub body: Stmt,
}

impl CompiledUnit {
    /// Compile a unit, counting its statements from the tree
    ///
    /// **Public** - what a host adapter calls after compiling a procedure
    pub fn compile(
        name: impl Into<String>,
        unit_id: u32,
        owner_db_id: u32,
        version_stamp: u64,
        body: Stmt,
    ) -> Self {
        let nstatements = body.count();

        Self {
            handle: IncarnationHandle::next(),
            unit_id,
            owner_db_id,
            version_stamp,
            physical_location: 0,
            name: name.into(),
            nstatements,
            body,
        }
    }

    pub fn with_physical_location(mut self, location: u64) -> Self {
        self.physical_location = location;
        self
    }

    /// Anonymous blocks have no stable identity and are never profiled
    pub fn is_anonymous(&self) -> bool {
        self.unit_id == 0
    }
}
