//! Statement identity mapping.
//!
//! The interpreter's statement ids are not in source order (and older hosts
//! have none), so every incarnation gets a map from host statement to
//! "natural" id: the statement's pre-order position in the source tree.
//! Natural ids index both the per-call buffer and the stored records.

use super::walker::{walk, Walk};
use crate::model::{CompiledUnit, IdentityKey, IncarnationHandle, Stmt, UnitKey};
use crate::utils::config::MAX_CACHED_MAPS;
use crate::utils::error::WalkError;
use log::debug;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Marks a host id that no statement uses
const GAP: i32 = -1;

/// Index from host statement to natural id
#[derive(Debug, Clone)]
enum MapIndex {
    /// `natural_of[native_id - 1]`, with `GAP` for unused host ids
    Native(Vec<i32>),

    /// Hosts without native ids: statements are identified by address,
    /// bucketed by line number
    Lines(LineIndex),
}

#[derive(Debug, Clone, Default)]
struct LineIndex {
    entries: Vec<LineEntry>,
    by_line: HashMap<i32, Vec<usize>>,
}

#[derive(Debug, Clone)]
struct LineEntry {
    stmt_addr: usize,
    natural_id: usize,
}

impl LineIndex {
    fn insert(&mut self, stmt: &Stmt, natural_id: usize) {
        let entry = self.entries.len();
        self.entries.push(LineEntry {
            stmt_addr: stmt_addr(stmt),
            natural_id,
        });
        self.by_line.entry(stmt.line_number).or_default().push(entry);
    }

    fn get(&self, stmt: &Stmt) -> Option<usize> {
        let addr = stmt_addr(stmt);
        self.by_line
            .get(&stmt.line_number)?
            .iter()
            .map(|&entry| &self.entries[entry])
            .find(|entry| entry.stmt_addr == addr)
            .map(|entry| entry.natural_id)
    }
}

// The tree is immutable and owned by the compiled unit for as long as the
// map is cached, so its nodes never move.
fn stmt_addr(stmt: &Stmt) -> usize {
    stmt as *const Stmt as usize
}

/// Natural-id map of one incarnation. Immutable once built.
#[derive(Debug, Clone)]
pub struct StatementMap {
    identity: IdentityKey,
    index: MapIndex,
    /// (native id, natural id) in visitation order
    pairs: Vec<(Option<u32>, usize)>,
    lines: Vec<i32>,
    fingerprints: Vec<Option<u64>>,
}

impl StatementMap {
    /// Walk the unit's tree once and assign natural ids
    ///
    /// **Public** - use `StatementMapCache::build_or_get` on the hot path
    ///
    /// # Errors
    /// * `WalkError::StatementCountMismatch` - tree disagrees with the
    ///   interpreter's statement count
    /// * `WalkError::DuplicateNativeId` - host reused a statement id
    pub fn build(unit: &CompiledUnit) -> Result<Self, WalkError> {
        let mut builder = MapBuilder::new(unit);
        walk(&unit.body, &mut Walk::AssignIds(&mut builder))?;

        let map = builder.finish(unit)?;
        debug!(
            "Built statement map for {} ({} statements, {})",
            unit.name,
            map.len(),
            if map.uses_native_ids() { "native ids" } else { "line index" }
        );
        Ok(map)
    }

    pub fn identity(&self) -> &IdentityKey {
        &self.identity
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn uses_native_ids(&self) -> bool {
        matches!(self.index, MapIndex::Native(_))
    }

    /// (native id, natural id) pairs in natural order
    pub fn pairs(&self) -> &[(Option<u32>, usize)] {
        &self.pairs
    }

    /// Source line of each statement, by natural id
    pub fn lines(&self) -> &[i32] {
        &self.lines
    }

    pub fn fingerprints(&self) -> &[Option<u64>] {
        &self.fingerprints
    }

    /// Natural id of a statement of this incarnation
    pub fn natural_id(&self, stmt: &Stmt) -> Result<usize, WalkError> {
        let found = match &self.index {
            MapIndex::Native(natural_of) => stmt
                .native_id
                .and_then(|id| natural_of.get((id as usize).checked_sub(1)?))
                .filter(|&&natural| natural != GAP)
                .map(|&natural| natural as usize),
            MapIndex::Lines(lines) => lines.get(stmt),
        };

        found.ok_or(WalkError::UnmappedStatement {
            line: stmt.line_number,
        })
    }
}

/// Builder state for the `AssignIds` walk
#[derive(Debug)]
pub struct MapBuilder {
    index: MapIndex,
    pairs: Vec<(Option<u32>, usize)>,
    lines: Vec<i32>,
    fingerprints: Vec<Option<u64>>,
}

impl MapBuilder {
    pub(crate) fn new(unit: &CompiledUnit) -> Self {
        let index = if unit.body.native_id.is_some() {
            MapIndex::Native(vec![GAP; unit.nstatements])
        } else {
            MapIndex::Lines(LineIndex::default())
        };

        Self {
            index,
            pairs: Vec::with_capacity(unit.nstatements),
            lines: Vec::with_capacity(unit.nstatements),
            fingerprints: Vec::with_capacity(unit.nstatements),
        }
    }

    /// Give `stmt` the next natural id
    pub(crate) fn assign(&mut self, stmt: &Stmt) -> Result<usize, WalkError> {
        let natural_id = self.lines.len();

        match &mut self.index {
            MapIndex::Native(natural_of) => {
                let native = stmt.native_id.ok_or(WalkError::UnmappedStatement {
                    line: stmt.line_number,
                })?;
                let slot = (native as usize)
                    .checked_sub(1)
                    .ok_or(WalkError::UnmappedStatement {
                        line: stmt.line_number,
                    })?;

                // tolerate hosts whose ids exceed the reported count
                if slot >= natural_of.len() {
                    natural_of.resize(slot + 1, GAP);
                }
                if natural_of[slot] != GAP {
                    return Err(WalkError::DuplicateNativeId(native));
                }
                natural_of[slot] = natural_id as i32;
            }
            MapIndex::Lines(lines) => lines.insert(stmt, natural_id),
        }

        self.pairs.push((stmt.native_id, natural_id));
        self.lines.push(stmt.line_number);
        self.fingerprints.push(stmt.query_fingerprint());
        Ok(natural_id)
    }

    pub(crate) fn finish(self, unit: &CompiledUnit) -> Result<StatementMap, WalkError> {
        if self.lines.len() != unit.nstatements {
            return Err(WalkError::StatementCountMismatch {
                expected: unit.nstatements,
                found: self.lines.len(),
            });
        }

        Ok(StatementMap {
            identity: IdentityKey::of(unit),
            index: self.index,
            pairs: self.pairs,
            lines: self.lines,
            fingerprints: self.fingerprints,
        })
    }
}

/// Per-process cache of statement maps, keyed by incarnation handle.
///
/// Holds at most `limit` maps; once full, the least recently used go first.
#[derive(Debug)]
pub struct StatementMapCache {
    state: Mutex<CacheState>,
    limit: usize,
}

#[derive(Debug, Default)]
struct CacheState {
    maps: HashMap<IncarnationHandle, CachedMap>,
    /// Bumped on every lookup
    tick: u64,
}

#[derive(Debug)]
struct CachedMap {
    map: Arc<StatementMap>,
    last_used: u64,
}

impl Default for StatementMapCache {
    fn default() -> Self {
        Self::with_limit(MAX_CACHED_MAPS)
    }
}

impl StatementMapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(limit: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            limit: limit.max(1),
        }
    }

    /// Return the cached map of `unit`, building it on first use
    pub fn build_or_get(&self, unit: &CompiledUnit) -> Result<Arc<StatementMap>, WalkError> {
        {
            let mut state = self.state.lock();
            state.tick += 1;
            let tick = state.tick;
            if let Some(entry) = state.maps.get_mut(&unit.handle) {
                entry.last_used = tick;
                return Ok(Arc::clone(&entry.map));
            }
        }

        // built outside the lock; a racing builder produces the same map
        let map = Arc::new(StatementMap::build(unit)?);

        let mut state = self.state.lock();
        state.tick += 1;
        let last_used = state.tick;
        let map = Arc::clone(
            &state
                .maps
                .entry(unit.handle)
                .or_insert(CachedMap { map, last_used })
                .map,
        );
        self.evict(&mut state);
        Ok(map)
    }

    fn evict(&self, state: &mut CacheState) {
        if state.maps.len() <= self.limit {
            return;
        }

        let excess = state.maps.len() - self.limit;
        let mut by_age: Vec<(IncarnationHandle, u64)> = state
            .maps
            .iter()
            .map(|(handle, entry)| (*handle, entry.last_used))
            .collect();
        by_age.sort_by_key(|&(_, last_used)| last_used);

        for (handle, _) in by_age.into_iter().take(excess) {
            state.maps.remove(&handle);
        }
        debug!("Evicted {} least recently used statement maps", excess);
    }

    /// Drop cached maps of one procedure (`Some`) or of all
    pub fn invalidate(&self, unit: Option<UnitKey>) -> usize {
        let mut state = self.state.lock();
        let before = state.maps.len();
        match unit {
            Some(key) => state
                .maps
                .retain(|_, entry| entry.map.identity().unit_key() != key),
            None => state.maps.clear(),
        }
        before - state.maps.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LoopKind, SimpleKind};

    /// Host-style ids: assigned after the children, so not in source order
    fn native_tree() -> Stmt {
        Stmt::block(
            0,
            vec![
                Stmt::simple(2, SimpleKind::Assign).with_native_id(1),
                Stmt::looping(
                    3,
                    LoopKind::While,
                    vec![Stmt::simple(4, SimpleKind::Perform).with_native_id(2)],
                )
                .with_native_id(3),
                Stmt::simple(6, SimpleKind::Return).with_native_id(4),
            ],
        )
        .with_native_id(5)
    }

    #[test]
    fn test_native_ids_inverted() {
        let unit = CompiledUnit::compile("f", 1, 1, 1, native_tree());
        let map = StatementMap::build(&unit).unwrap();

        assert!(map.uses_native_ids());
        assert_eq!(map.len(), 5);
        assert_eq!(map.lines(), &[0, 2, 3, 4, 6]);
        assert_eq!(map.natural_id(&unit.body).unwrap(), 0);

        let pairs: Vec<(Option<u32>, usize)> = map.pairs().to_vec();
        assert_eq!(
            pairs,
            vec![(Some(5), 0), (Some(1), 1), (Some(3), 2), (Some(2), 3), (Some(4), 4)]
        );
    }

    #[test]
    fn test_gaps_are_tolerated() {
        let body = Stmt::block(
            1,
            vec![Stmt::simple(2, SimpleKind::Return).with_native_id(7)],
        )
        .with_native_id(3);
        let unit = CompiledUnit::compile("f", 1, 1, 1, body);
        let map = StatementMap::build(&unit).unwrap();

        assert_eq!(map.len(), 2);
        let orphan = Stmt::simple(9, SimpleKind::Return).with_native_id(1);
        assert!(matches!(
            map.natural_id(&orphan),
            Err(WalkError::UnmappedStatement { line: 9 })
        ));
    }

    #[test]
    fn test_line_index_distinguishes_same_line() {
        let body = Stmt::block(
            1,
            vec![
                Stmt::simple(2, SimpleKind::Assign),
                Stmt::simple(2, SimpleKind::Assign),
            ],
        );
        let unit = CompiledUnit::compile("f", 1, 1, 1, body);
        let map = StatementMap::build(&unit).unwrap();

        assert!(!map.uses_native_ids());
        let crate::model::StmtKind::Block { body, .. } = &unit.body.kind else {
            panic!("expected block");
        };
        assert_eq!(map.natural_id(&body[0]).unwrap(), 1);
        assert_eq!(map.natural_id(&body[1]).unwrap(), 2);

        // an equal-looking statement from another tree is not ours
        let stranger = Stmt::simple(2, SimpleKind::Assign);
        assert!(map.natural_id(&stranger).is_err());
    }

    #[test]
    fn test_count_mismatch_is_fatal() {
        let mut unit = CompiledUnit::compile("f", 1, 1, 1, native_tree());
        unit.nstatements = 6;

        assert!(matches!(
            StatementMap::build(&unit),
            Err(WalkError::StatementCountMismatch {
                expected: 6,
                found: 5
            })
        ));
    }

    #[test]
    fn test_duplicate_native_id() {
        let body = Stmt::block(
            1,
            vec![Stmt::simple(2, SimpleKind::Return).with_native_id(1)],
        )
        .with_native_id(1);
        let unit = CompiledUnit::compile("f", 1, 1, 1, body);

        assert!(matches!(
            StatementMap::build(&unit),
            Err(WalkError::DuplicateNativeId(1))
        ));
    }

    #[test]
    fn test_cache_keyed_by_handle() {
        let cache = StatementMapCache::new();
        let a = CompiledUnit::compile("f", 1, 1, 1, native_tree());
        let b = CompiledUnit::compile("f", 1, 1, 1, native_tree());

        let first = cache.build_or_get(&a).unwrap();
        let again = cache.build_or_get(&a).unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        cache.build_or_get(&b).unwrap();
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.invalidate(Some(UnitKey::new(1, 1))), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_invalidate_matches_owner_database() {
        let cache = StatementMapCache::new();
        let here = CompiledUnit::compile("f", 1, 1, 1, native_tree());
        let elsewhere = CompiledUnit::compile("f", 1, 2, 1, native_tree());
        cache.build_or_get(&here).unwrap();
        cache.build_or_get(&elsewhere).unwrap();

        assert_eq!(cache.invalidate(Some(UnitKey::new(1, 2))), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.build_or_get(&here).unwrap().identity().owner_db_id, 1);
    }

    #[test]
    fn test_least_recently_used_map_is_evicted() {
        let cache = StatementMapCache::with_limit(2);
        let a = CompiledUnit::compile("a", 1, 1, 1, native_tree());
        let b = CompiledUnit::compile("b", 2, 1, 1, native_tree());
        let c = CompiledUnit::compile("c", 3, 1, 1, native_tree());

        let first_a = cache.build_or_get(&a).unwrap();
        cache.build_or_get(&b).unwrap();
        cache.build_or_get(&a).unwrap();
        cache.build_or_get(&c).unwrap();

        assert_eq!(cache.len(), 2);
        // `b` went; `a` is still the same cached map
        assert!(Arc::ptr_eq(&first_a, &cache.build_or_get(&a).unwrap()));
        assert_eq!(cache.invalidate(Some(UnitKey::new(2, 1))), 0);
    }
}
