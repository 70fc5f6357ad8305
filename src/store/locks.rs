//! Locks guarding the chunk region.
//!
//! The table lock has two layers: a `parking_lot::RwLock` for threads of
//! this process and an `fs2` lock on the region file for other processes.
//! The kernel drops a file lock when its holder exits, so a crashed process
//! never leaves the table locked.
//!
//! Incarnation and unit-record mutexes are words in the mapping holding the
//! owner id of the attach that locked them. Every attach to a shared region
//! keeps an `OwnerToken`; a waiter that finds the token of the holder gone
//! takes the mutex over.

use crate::utils::error::StoreError;
use fs2::FileExt;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::hint;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

/// Owner id of regions only this process can see
pub(crate) const LOCAL_OWNER: u32 = 1;

const SPINS_BEFORE_YIELD: u32 = 64;

/// Failed acquisitions between two liveness checks of the holder
const LIVENESS_CHECK_INTERVAL: u32 = 1024;

/// Spin briefly, then give the CPU away
struct Backoff {
    spins: u32,
}

impl Backoff {
    fn new() -> Self {
        Self { spins: 0 }
    }

    fn snooze(&mut self) {
        if self.spins < SPINS_BEFORE_YIELD {
            self.spins += 1;
            hint::spin_loop();
        } else {
            thread::yield_now();
        }
    }
}

/// Proof that the table lock is held, in either mode
pub(crate) trait TableAccess {}

/// Proof that records may be read and written: either the table is locked
/// exclusively or the owning mutex is held.
pub(crate) trait RecordAccess {}

/// Reader/writer lock over the slot tables of one attach
pub(crate) struct TableLock {
    local: RwLock<()>,

    /// Region file; `None` for anonymous regions
    file: Option<File>,

    /// Readers of this attach sharing the file lock
    readers: Mutex<usize>,
}

impl TableLock {
    pub(crate) fn local() -> Self {
        Self {
            local: RwLock::new(()),
            file: None,
            readers: Mutex::new(0),
        }
    }

    pub(crate) fn file(file: File) -> Self {
        Self {
            file: Some(file),
            ..Self::local()
        }
    }

    /// Acquire in shared mode
    pub(crate) fn shared(&self) -> Result<SharedGuard<'_>, StoreError> {
        let local = self.local.read();

        if let Some(file) = &self.file {
            let mut readers = self.readers.lock();
            if *readers == 0 {
                FileExt::lock_shared(file)?;
            }
            *readers += 1;
        }

        Ok(SharedGuard {
            lock: self,
            _local: local,
        })
    }

    /// Acquire in exclusive mode
    pub(crate) fn exclusive(&self) -> Result<ExclusiveGuard<'_>, StoreError> {
        let local = self.local.write();

        if let Some(file) = &self.file {
            FileExt::lock_exclusive(file)?;
        }

        Ok(ExclusiveGuard {
            lock: self,
            _local: local,
        })
    }
}

/// Table lock held in shared mode
pub(crate) struct SharedGuard<'a> {
    lock: &'a TableLock,
    _local: RwLockReadGuard<'a, ()>,
}

/// Table lock held in exclusive mode
pub(crate) struct ExclusiveGuard<'a> {
    lock: &'a TableLock,
    _local: RwLockWriteGuard<'a, ()>,
}

impl TableAccess for SharedGuard<'_> {}
impl TableAccess for ExclusiveGuard<'_> {}
impl RecordAccess for ExclusiveGuard<'_> {}

impl Drop for SharedGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = &self.lock.file {
            let mut readers = self.lock.readers.lock();
            *readers -= 1;
            if *readers == 0 {
                unlock_file(file);
            }
        }
    }
}

impl Drop for ExclusiveGuard<'_> {
    fn drop(&mut self) {
        if let Some(file) = &self.lock.file {
            unlock_file(file);
        }
    }
}

fn unlock_file(file: &File) {
    if let Err(e) = FileExt::unlock(file) {
        warn!("Failed to release region file lock: {}", e);
    }
}

/// Liveness token of one attach to a shared region.
///
/// Holds an exclusive `fs2` lock on `<region>.owner-<id>` for as long as the
/// attach lives. The file is removed on drop, or by the first waiter that
/// finds it unlocked.
pub(crate) struct OwnerToken {
    id: u32,
    region: PathBuf,
    path: PathBuf,
    file: File,
}

impl OwnerToken {
    /// Take the next free owner id of the region at `region`
    pub(crate) fn acquire(region: &Path, next_owner: &AtomicU32) -> Result<Self, StoreError> {
        loop {
            let id = next_owner.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if id <= LOCAL_OWNER {
                continue;
            }

            let path = owner_path(region, id);
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(false)
                .open(&path)?;

            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => {
                    return Ok(Self {
                        id,
                        region: region.to_path_buf(),
                        path,
                        file,
                    })
                }
                Err(e) => debug!("Owner id {} still taken ({}), trying the next one", id, e),
            }
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    /// Whether the attach holding `owner` still runs
    pub(crate) fn is_alive(&self, owner: u32) -> bool {
        if owner == self.id {
            return true;
        }

        let path = owner_path(&self.region, owner);
        let file = match OpenOptions::new().write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return false,
            Err(e) => {
                debug!("Cannot check owner {} ({}), assuming it runs", owner, e);
                return true;
            }
        };

        if FileExt::try_lock_exclusive(&file).is_err() {
            return true;
        }

        unlock_file(&file);
        // a stale token is only ever removed by whoever found it unlocked
        let _ = fs::remove_file(&path);
        false
    }
}

impl Drop for OwnerToken {
    fn drop(&mut self) {
        unlock_file(&self.file);
        if let Err(e) = fs::remove_file(&self.path) {
            debug!("Owner token {} already gone: {}", self.path.display(), e);
        }
    }
}

fn owner_path(region: &Path, owner: u32) -> PathBuf {
    let mut path = OsString::from(region.as_os_str());
    path.push(format!(".owner-{}", owner));
    PathBuf::from(path)
}

/// Mutex word held by `owner`
pub(crate) struct MutexGuard<'a> {
    word: &'a AtomicU32,
}

impl RecordAccess for MutexGuard<'_> {}

/// Lock a mutex word for `owner`. A holder for which `is_alive` returns
/// false loses the mutex to the waiter.
pub(crate) fn lock_mutex<'a>(word: &'a AtomicU32, owner: u32, is_alive: impl Fn(u32) -> bool) -> MutexGuard<'a> {
    let mut backoff = Backoff::new();
    let mut failures: u32 = 0;

    loop {
        let holder = match word.compare_exchange_weak(0, owner, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return MutexGuard { word },
            Err(holder) => holder,
        };

        failures = failures.wrapping_add(1);
        if holder != 0
            && holder != owner
            && failures % LIVENESS_CHECK_INTERVAL == 0
            && !is_alive(holder)
            && word
                .compare_exchange(holder, owner, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
        {
            warn!("Took over a profiler mutex held by exited owner {}", holder);
            return MutexGuard { word };
        }

        backoff.snooze();
    }
}

impl Drop for MutexGuard<'_> {
    fn drop(&mut self) {
        self.word.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_shared_guards_stack() {
        let lock = TableLock::local();
        let a = lock.shared().unwrap();
        let b = lock.shared().unwrap();
        drop(a);
        drop(b);
        let _writer = lock.exclusive().unwrap();
    }

    #[test]
    fn test_file_lock_excludes_other_handles() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        fs::write(&path, b"x").unwrap();

        let open = || OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let first = TableLock::file(open());
        let second = Arc::new(TableLock::file(open()));

        let writer = first.exclusive().unwrap();
        let (tx, rx) = mpsc::channel();
        let reader = {
            let second = Arc::clone(&second);
            thread::spawn(move || {
                let _guard = second.shared().unwrap();
                tx.send(()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        drop(writer);
        assert!(rx.recv_timeout(Duration::from_secs(10)).is_ok());
        reader.join().unwrap();
    }

    #[test]
    fn test_file_readers_share_one_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("table");
        fs::write(&path, b"x").unwrap();

        let lock = TableLock::file(OpenOptions::new().read(true).write(true).open(&path).unwrap());
        let a = lock.shared().unwrap();
        let b = lock.shared().unwrap();
        drop(a);
        // the file lock stays until the last reader leaves
        assert_eq!(*lock.readers.lock(), 1);
        drop(b);
        assert_eq!(*lock.readers.lock(), 0);
        let _writer = lock.exclusive().unwrap();
    }

    #[test]
    fn test_mutex_released_on_panic() {
        let word = Arc::new(AtomicU32::new(0));
        let cloned = Arc::clone(&word);

        let result = thread::spawn(move || {
            let _guard = lock_mutex(&cloned, LOCAL_OWNER, |_| true);
            panic!("fold failed");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_mutex_excludes_threads() {
        let word = Arc::new(AtomicU32::new(0));
        let counter = Arc::new(AtomicU32::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let word = Arc::clone(&word);
                let counter = Arc::clone(&counter);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let _guard = lock_mutex(&word, LOCAL_OWNER, |_| true);
                        // split load/store: only the mutex makes this safe
                        let v = counter.load(Ordering::Relaxed);
                        counter.store(v + 1, Ordering::Relaxed);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.load(Ordering::SeqCst), 8000);
    }

    #[test]
    fn test_mutex_of_exited_owner_is_taken_over() {
        let word = AtomicU32::new(7);

        let guard = lock_mutex(&word, 3, |holder| holder != 7);
        assert_eq!(word.load(Ordering::SeqCst), 3);
        drop(guard);
        assert_eq!(word.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_owner_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let region = dir.path().join("region");
        let next = AtomicU32::new(LOCAL_OWNER);

        let a = OwnerToken::acquire(&region, &next).unwrap();
        let b = OwnerToken::acquire(&region, &next).unwrap();
        assert_ne!(a.id(), b.id());
        assert!(a.id() > LOCAL_OWNER);

        let b_id = b.id();
        assert!(a.is_alive(b_id));
        drop(b);
        assert!(!a.is_alive(b_id));
        assert!(!owner_path(&region, b_id).exists());
    }

    #[test]
    fn test_unlocked_token_file_is_dead() {
        let dir = tempfile::tempdir().unwrap();
        let region = dir.path().join("region");
        let next = AtomicU32::new(LOCAL_OWNER);
        let token = OwnerToken::acquire(&region, &next).unwrap();

        // what a process killed mid-call leaves behind
        fs::write(owner_path(&region, 40), b"").unwrap();

        assert!(!token.is_alive(40));
        assert!(!owner_path(&region, 40).exists());
    }
}
