//! Identity keys for stored statistics.
//!
//! An `IdentityKey` names one compiled incarnation; a `UnitKey` names the
//! logical procedure across all of its incarnations.

use super::unit::CompiledUnit;
use serde::{Deserialize, Serialize};

/// Identity of one compiled incarnation.
///
/// Laid out with `repr(C)` because it is embedded in every chunk of the
/// mapped region.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub unit_id: u32,
    pub owner_db_id: u32,
    pub version_stamp: u64,
    pub physical_location: u64,
}

impl IdentityKey {
    /// Derive the key of a compiled incarnation
    ///
    /// **Public** - pure, no I/O
    pub fn of(unit: &CompiledUnit) -> Self {
        Self {
            unit_id: unit.unit_id,
            owner_db_id: unit.owner_db_id,
            version_stamp: unit.version_stamp,
            physical_location: unit.physical_location,
        }
    }

    pub fn unit_key(&self) -> UnitKey {
        UnitKey {
            unit_id: self.unit_id,
            owner_db_id: self.owner_db_id,
        }
    }
}

/// Incarnation-independent procedure key
///
/// `repr(C)`: embedded in the call-statistics slots of the region.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub unit_id: u32,
    pub owner_db_id: u32,
}

impl UnitKey {
    pub fn new(unit_id: u32, owner_db_id: u32) -> Self {
        Self {
            unit_id,
            owner_db_id,
        }
    }
}
