//! Fixed-capacity chunk region.
//!
//! Layout: a 64-byte header, `capacity` chunk slots and `unit_capacity`
//! call-statistics slots. Both slot tables use open addressing. The region
//! is either a shared file mapping (visible to every attached process) or
//! an anonymous private mapping used as session-local fallback. Both use
//! the same layout, so the store code above it has one path.
//!
//! Memory is only touched through raw pointers derived once from the
//! mapping. Slot keys change under the exclusive table lock; records change
//! under the exclusive table lock or the mutex word owning them.

use super::locks::{self, ExclusiveGuard, MutexGuard, OwnerToken, RecordAccess, SharedGuard, TableAccess, TableLock};
use super::record::{splitmix, ChunkKey, StatementRecord};
use crate::model::UnitKey;
use crate::stats::aggregate::UnitStats;
use crate::utils::config::{REGION_FORMAT_VERSION, REGION_MAGIC, STATEMENTS_PER_CHUNK};
use crate::utils::error::StoreError;
use fs2::FileExt;
use log::{debug, info};
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const HEADER_SIZE: usize = 64;

const SLOT_EMPTY: u32 = 0;
const SLOT_USED: u32 = 1;
const SLOT_DELETED: u32 = 2;

pub(crate) type ChunkRecords = [StatementRecord; STATEMENTS_PER_CHUNK];

#[repr(C)]
struct RegionHeader {
    magic: [u8; 8],
    format_version: u32,
    slot_size: u32,
    capacity: u64,
    unit_capacity: u32,
    unit_slot_size: u32,
    next_owner: AtomicU32,
    _reserved: u32,
    used: AtomicU64,
    units_used: AtomicU64,
}

const _: () = assert!(std::mem::size_of::<RegionHeader>() <= HEADER_SIZE);

#[repr(C)]
struct ChunkSlot {
    state: AtomicU32,
    /// Meaningful only in chunk 1 of an incarnation
    mutex: AtomicU32,
    key: ChunkKey,
    records: ChunkRecords,
}

#[repr(C)]
struct UnitSlot {
    state: AtomicU32,
    mutex: AtomicU32,
    key: UnitKey,
    stats: UnitStats,
}

const SLOT_SIZE: usize = std::mem::size_of::<ChunkSlot>();
const UNIT_SLOT_SIZE: usize = std::mem::size_of::<UnitSlot>();

const _: () = assert!(SLOT_SIZE % 8 == 0);
const _: () = assert!(UNIT_SLOT_SIZE % 8 == 0);

fn region_len(capacity: usize, unit_capacity: usize) -> usize {
    HEADER_SIZE + capacity * SLOT_SIZE + unit_capacity * UNIT_SLOT_SIZE
}

/// Outcome of an open-addressing lookup
enum Lookup {
    Found(usize),
    /// First reusable slot on the search path, if any
    Vacant(Option<usize>),
}

fn scan_slots(len: usize, start: usize, state: impl Fn(usize) -> u32, matches: impl Fn(usize) -> bool) -> Lookup {
    let mut vacant = None;

    for step in 0..len {
        let index = (start + step) % len;
        match state(index) {
            SLOT_EMPTY => {
                vacant.get_or_insert(index);
                break;
            }
            SLOT_DELETED => {
                vacant.get_or_insert(index);
            }
            _ => {
                if matches(index) {
                    return Lookup::Found(index);
                }
            }
        }
    }

    Lookup::Vacant(vacant)
}

fn unit_hash(key: &UnitKey) -> u64 {
    splitmix(u64::from(key.unit_id) << 32 | u64::from(key.owner_db_id))
}

pub(crate) struct ChunkRegion {
    // Keeps the mapping alive; never dereferenced after construction.
    mmap: MmapMut,
    base: *mut u8,
    capacity: usize,
    unit_capacity: usize,
    table: TableLock,
    /// `None` for anonymous regions
    owner: Option<OwnerToken>,
}

// SAFETY: all access to the mapped bytes goes through atomics or happens
// while holding the table lock or the mutex word owning the bytes.
unsafe impl Send for ChunkRegion {}
unsafe impl Sync for ChunkRegion {}

impl ChunkRegion {
    /// Session-local region backed by anonymous memory
    pub(crate) fn anonymous(capacity: usize, unit_capacity: usize) -> Result<Self, StoreError> {
        check_capacity(capacity, unit_capacity)?;

        let mut mmap = MmapOptions::new()
            .len(region_len(capacity, unit_capacity))
            .map_anon()?;
        init_header(&mut mmap, capacity, unit_capacity);

        debug!(
            "Created local chunk region with {} slots, {} unit slots",
            capacity, unit_capacity
        );
        Ok(Self::from_mmap(mmap, capacity, unit_capacity, TableLock::local()))
    }

    /// Open a shared region file, initializing it when empty.
    ///
    /// Creation runs under an exclusive file lock, so concurrent openers see
    /// either no header or a complete one.
    pub(crate) fn open_file(path: &Path, capacity: usize, unit_capacity: usize) -> Result<Self, StoreError> {
        check_capacity(capacity, unit_capacity)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        FileExt::lock_exclusive(&file)?;
        let mapped = if file.metadata()?.len() == 0 {
            create_file_mapping(&file, capacity, unit_capacity).map(|mmap| {
                info!(
                    "Initialized shared chunk region {} ({} slots, {} unit slots)",
                    path.display(),
                    capacity,
                    unit_capacity
                );
                (mmap, capacity, unit_capacity)
            })
        } else {
            map_validated(&file, path)
        };
        FileExt::unlock(&file)?;

        let (mmap, capacity, unit_capacity) = mapped?;
        Self::from_file(mmap, capacity, unit_capacity, file, path)
    }

    /// Attach to an existing, initialized region file
    pub(crate) fn attach(path: &Path) -> Result<Self, StoreError> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        FileExt::lock_shared(&file)?;
        let mapped = map_validated(&file, path);
        FileExt::unlock(&file)?;

        let (mmap, capacity, unit_capacity) = mapped?;
        debug!("Attached chunk region {} ({} slots)", path.display(), capacity);
        Self::from_file(mmap, capacity, unit_capacity, file, path)
    }

    fn from_file(
        mmap: MmapMut,
        capacity: usize,
        unit_capacity: usize,
        file: File,
        path: &Path,
    ) -> Result<Self, StoreError> {
        let mut region = Self::from_mmap(mmap, capacity, unit_capacity, TableLock::file(file));
        region.owner = Some(OwnerToken::acquire(path, &region.header().next_owner)?);
        Ok(region)
    }

    fn from_mmap(
        mut mmap: MmapMut,
        capacity: usize,
        unit_capacity: usize,
        table: TableLock,
    ) -> Self {
        let base = mmap.as_mut_ptr();
        Self {
            mmap,
            base,
            capacity,
            unit_capacity,
            table,
            owner: None,
        }
    }

    fn header(&self) -> &RegionHeader {
        // SAFETY: initialized or validated at construction; afterwards only
        // the atomic fields change.
        unsafe { &*(self.base as *const RegionHeader) }
    }

    fn slot(&self, index: usize) -> *mut ChunkSlot {
        debug_assert!(index < self.capacity);
        // SAFETY: index < capacity keeps the pointer inside the mapping
        unsafe { self.base.add(HEADER_SIZE + index * SLOT_SIZE) as *mut ChunkSlot }
    }

    fn unit_slot(&self, index: usize) -> *mut UnitSlot {
        debug_assert!(index < self.unit_capacity);
        // SAFETY: index < unit_capacity keeps the pointer inside the mapping
        unsafe {
            self.base
                .add(HEADER_SIZE + self.capacity * SLOT_SIZE + index * UNIT_SLOT_SIZE) as *mut UnitSlot
        }
    }

    fn slot_state(&self, index: usize) -> &AtomicU32 {
        // SAFETY: atomics may be shared freely
        unsafe { &(*self.slot(index)).state }
    }

    fn unit_state(&self, index: usize) -> &AtomicU32 {
        // SAFETY: atomics may be shared freely
        unsafe { &(*self.unit_slot(index)).state }
    }

    pub(crate) fn is_file_backed(&self) -> bool {
        self.owner.is_some()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn unit_capacity(&self) -> usize {
        self.unit_capacity
    }

    pub(crate) fn format_version(&self) -> u32 {
        self.header().format_version
    }

    pub(crate) fn used(&self) -> usize {
        self.header().used.load(Ordering::Acquire) as usize
    }

    pub(crate) fn units_used(&self) -> usize {
        self.header().units_used.load(Ordering::Acquire) as usize
    }

    pub(crate) fn lock_shared(&self) -> Result<SharedGuard<'_>, StoreError> {
        self.table.shared()
    }

    pub(crate) fn lock_exclusive(&self) -> Result<ExclusiveGuard<'_>, StoreError> {
        self.table.exclusive()
    }

    fn lock_word<'a>(&'a self, word: &'a AtomicU32) -> MutexGuard<'a> {
        match &self.owner {
            Some(owner) => locks::lock_mutex(word, owner.id(), |holder| owner.is_alive(holder)),
            None => locks::lock_mutex(word, locks::LOCAL_OWNER, |_| true),
        }
    }

    /// Lock the incarnation mutex stored in chunk slot `index`
    pub(crate) fn lock_chunk(&self, index: usize) -> MutexGuard<'_> {
        // SAFETY: atomics may be shared freely
        self.lock_word(unsafe { &(*self.slot(index)).mutex })
    }

    /// Lock the record mutex of unit slot `index`
    pub(crate) fn lock_unit(&self, index: usize) -> MutexGuard<'_> {
        // SAFETY: atomics may be shared freely
        self.lock_word(unsafe { &(*self.unit_slot(index)).mutex })
    }

    fn home_slot(&self, key: &ChunkKey) -> usize {
        (key.slot_hash() % self.capacity as u64) as usize
    }

    /// Key of a used slot
    pub(crate) fn key_at(&self, _lock: &impl TableAccess, index: usize) -> Option<ChunkKey> {
        if self.slot_state(index).load(Ordering::Acquire) != SLOT_USED {
            return None;
        }
        // SAFETY: keys only change under the exclusive table lock, which
        // cannot be held while the caller holds any table access.
        Some(unsafe { ptr::read(ptr::addr_of!((*self.slot(index)).key)) })
    }

    /// Find the slot holding `key`
    pub(crate) fn find(&self, lock: &impl TableAccess, key: &ChunkKey) -> Option<usize> {
        let found = scan_slots(
            self.capacity,
            self.home_slot(key),
            |index| self.slot_state(index).load(Ordering::Acquire),
            |index| self.key_at(lock, index).as_ref() == Some(key),
        );

        match found {
            Lookup::Found(index) => Some(index),
            Lookup::Vacant(_) => None,
        }
    }

    /// Insert a chunk filled with unused-slot sentinels
    pub(crate) fn insert(&self, lock: &ExclusiveGuard<'_>, key: &ChunkKey) -> Result<usize, StoreError> {
        let found = scan_slots(
            self.capacity,
            self.home_slot(key),
            |index| self.slot_state(index).load(Ordering::Acquire),
            |index| self.key_at(lock, index).as_ref() == Some(key),
        );

        let index = match found {
            Lookup::Found(_) => {
                return Err(StoreError::DuplicateChunk {
                    unit_id: key.identity.unit_id,
                    chunk_number: key.chunk_number,
                })
            }
            Lookup::Vacant(vacant) => vacant.ok_or(StoreError::ResourceExhausted {
                capacity: self.capacity,
            })?,
        };

        let slot = self.slot(index);
        // SAFETY: exclusive table lock held; nobody else can reach this slot
        unsafe {
            ptr::write(ptr::addr_of_mut!((*slot).key), *key);
            ptr::write(
                ptr::addr_of_mut!((*slot).records),
                [StatementRecord::UNUSED; STATEMENTS_PER_CHUNK],
            );
            (*slot).mutex.store(0, Ordering::Relaxed);
        }
        self.slot_state(index).store(SLOT_USED, Ordering::Release);
        self.header().used.fetch_add(1, Ordering::AcqRel);

        Ok(index)
    }

    pub(crate) fn remove(&self, _lock: &ExclusiveGuard<'_>, index: usize) {
        if self
            .slot_state(index)
            .compare_exchange(SLOT_USED, SLOT_DELETED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.header().used.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Drop every chunk, tombstones included
    pub(crate) fn clear(&self, _lock: &ExclusiveGuard<'_>) {
        for index in 0..self.capacity {
            self.slot_state(index).store(SLOT_EMPTY, Ordering::Release);
        }
        self.header().used.store(0, Ordering::Release);
    }

    pub(crate) fn read_records(&self, _access: &impl RecordAccess, index: usize) -> ChunkRecords {
        // SAFETY: writers need the same access token, so the copy is not torn
        unsafe { ptr::read(ptr::addr_of!((*self.slot(index)).records)) }
    }

    pub(crate) fn write_records(&self, _access: &impl RecordAccess, index: usize, records: &ChunkRecords) {
        // SAFETY: see `read_records`
        unsafe { ptr::write(ptr::addr_of_mut!((*self.slot(index)).records), *records) }
    }

    /// Key of a used unit slot
    pub(crate) fn unit_key_at(&self, _lock: &impl TableAccess, index: usize) -> Option<UnitKey> {
        if self.unit_state(index).load(Ordering::Acquire) != SLOT_USED {
            return None;
        }
        // SAFETY: see `key_at`
        Some(unsafe { ptr::read(ptr::addr_of!((*self.unit_slot(index)).key)) })
    }

    fn lookup_unit(&self, lock: &impl TableAccess, key: &UnitKey) -> Lookup {
        scan_slots(
            self.unit_capacity,
            (unit_hash(key) % self.unit_capacity as u64) as usize,
            |index| self.unit_state(index).load(Ordering::Acquire),
            |index| self.unit_key_at(lock, index).as_ref() == Some(key),
        )
    }

    pub(crate) fn find_unit(&self, lock: &impl TableAccess, key: &UnitKey) -> Option<usize> {
        match self.lookup_unit(lock, key) {
            Lookup::Found(index) => Some(index),
            Lookup::Vacant(_) => None,
        }
    }

    /// Insert zeroed statistics for `key`
    pub(crate) fn insert_unit(&self, lock: &ExclusiveGuard<'_>, key: &UnitKey) -> Result<usize, StoreError> {
        let index = match self.lookup_unit(lock, key) {
            Lookup::Found(index) => return Ok(index),
            Lookup::Vacant(vacant) => vacant.ok_or(StoreError::UnitTableFull {
                capacity: self.unit_capacity,
            })?,
        };

        let slot = self.unit_slot(index);
        // SAFETY: exclusive table lock held; nobody else can reach this slot
        unsafe {
            ptr::write(ptr::addr_of_mut!((*slot).key), *key);
            ptr::write(ptr::addr_of_mut!((*slot).stats), UnitStats::default());
            (*slot).mutex.store(0, Ordering::Relaxed);
        }
        self.unit_state(index).store(SLOT_USED, Ordering::Release);
        self.header().units_used.fetch_add(1, Ordering::AcqRel);

        Ok(index)
    }

    pub(crate) fn remove_unit(&self, _lock: &ExclusiveGuard<'_>, index: usize) {
        if self
            .unit_state(index)
            .compare_exchange(SLOT_USED, SLOT_DELETED, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            self.header().units_used.fetch_sub(1, Ordering::AcqRel);
        }
    }

    pub(crate) fn clear_units(&self, _lock: &ExclusiveGuard<'_>) {
        for index in 0..self.unit_capacity {
            self.unit_state(index).store(SLOT_EMPTY, Ordering::Release);
        }
        self.header().units_used.store(0, Ordering::Release);
    }

    pub(crate) fn read_unit(&self, _access: &impl RecordAccess, index: usize) -> UnitStats {
        // SAFETY: see `read_records`
        unsafe { ptr::read(ptr::addr_of!((*self.unit_slot(index)).stats)) }
    }

    pub(crate) fn write_unit(&self, _access: &impl RecordAccess, index: usize, stats: &UnitStats) {
        // SAFETY: see `read_records`
        unsafe { ptr::write(ptr::addr_of_mut!((*self.unit_slot(index)).stats), *stats) }
    }

    /// Push dirty pages of a file-backed region to disk
    pub(crate) fn flush(&self) -> Result<(), StoreError> {
        if self.is_file_backed() {
            self.mmap.flush()?;
        }
        Ok(())
    }
}

fn check_capacity(capacity: usize, unit_capacity: usize) -> Result<(), StoreError> {
    if capacity == 0 || unit_capacity == 0 {
        return Err(StoreError::RegionTooSmall);
    }
    Ok(())
}

fn init_header(mmap: &mut MmapMut, capacity: usize, unit_capacity: usize) {
    let header = RegionHeader {
        magic: *REGION_MAGIC,
        format_version: REGION_FORMAT_VERSION,
        slot_size: SLOT_SIZE as u32,
        capacity: capacity as u64,
        unit_capacity: unit_capacity as u32,
        unit_slot_size: UNIT_SLOT_SIZE as u32,
        next_owner: AtomicU32::new(locks::LOCAL_OWNER),
        _reserved: 0,
        used: AtomicU64::new(0),
        units_used: AtomicU64::new(0),
    };

    // SAFETY: the mapping is at least HEADER_SIZE long and page aligned,
    // and nobody else can see it yet
    unsafe { ptr::write(mmap.as_mut_ptr() as *mut RegionHeader, header) };
}

/// Size and initialize an empty region file. Caller holds the exclusive
/// file lock.
fn create_file_mapping(file: &File, capacity: usize, unit_capacity: usize) -> Result<MmapMut, StoreError> {
    file.set_len(region_len(capacity, unit_capacity) as u64)?;

    // SAFETY: the file stays open for the duration of the call and the
    // mapping owns its own reference afterwards.
    let mut mmap = unsafe { MmapOptions::new().map_mut(file)? };
    init_header(&mut mmap, capacity, unit_capacity);
    mmap.flush()?;
    Ok(mmap)
}

/// Map an initialized region file and check its header. Caller holds a
/// file lock, so no initialization runs concurrently.
fn map_validated(file: &File, path: &Path) -> Result<(MmapMut, usize, usize), StoreError> {
    let file_len = file.metadata()?.len() as usize;
    if file_len < HEADER_SIZE {
        return Err(StoreError::FormatMismatch(format!(
            "{} is too short to be a chunk region",
            path.display()
        )));
    }

    // SAFETY: see `create_file_mapping`
    let mmap = unsafe { MmapOptions::new().map_mut(file)? };

    // SAFETY: length checked above, the mapping is page aligned
    let header = unsafe { &*(mmap.as_ptr() as *const RegionHeader) };
    if &header.magic != REGION_MAGIC {
        return Err(StoreError::FormatMismatch("bad magic".to_string()));
    }
    if header.format_version != REGION_FORMAT_VERSION {
        return Err(StoreError::FormatMismatch(format!(
            "format version {}, expected {}",
            header.format_version, REGION_FORMAT_VERSION
        )));
    }
    if header.slot_size as usize != SLOT_SIZE || header.unit_slot_size as usize != UNIT_SLOT_SIZE {
        return Err(StoreError::FormatMismatch(format!(
            "slot sizes {}/{}, expected {}/{}",
            header.slot_size, header.unit_slot_size, SLOT_SIZE, UNIT_SLOT_SIZE
        )));
    }

    let capacity = header.capacity as usize;
    let unit_capacity = header.unit_capacity as usize;
    if capacity == 0 || unit_capacity == 0 || file_len != region_len(capacity, unit_capacity) {
        return Err(StoreError::FormatMismatch(format!(
            "file length {} does not match capacity {}/{}",
            file_len, capacity, unit_capacity
        )));
    }

    Ok((mmap, capacity, unit_capacity))
}
