use plprofiler::model::{CompiledUnit, IdentityKey, SimpleKind, Stmt, UnitKey};
use plprofiler::profiler::{ManualClock, ProfilerSession};
use plprofiler::store::{ProfilerStore, StatementRecord};
use plprofiler::utils::error::StoreError;
use plprofiler::StoreConfig;
use std::sync::Arc;
use std::thread;

fn identity(unit_id: u32) -> IdentityKey {
    IdentityKey {
        unit_id,
        owner_db_id: 1,
        version_stamp: 1,
        physical_location: 0,
    }
}

fn one_exec(lines: &[i32]) -> Vec<StatementRecord> {
    lines
        .iter()
        .map(|&line| {
            let mut record = StatementRecord::new(line);
            record.exec_count = 1;
            record.total_time_us = 2;
            record
        })
        .collect()
}

#[test]
fn test_concurrent_folds_lose_no_updates() {
    const THREADS: usize = 8;
    const CALLS: usize = 50;

    let store = Arc::new(ProfilerStore::local(16).unwrap());
    let records = one_exec(&[1, 2, 3]);

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = Arc::clone(&store);
            let records = records.clone();
            thread::spawn(move || {
                for _ in 0..CALLS {
                    store.fold(&identity(1), &records).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stored = store.read_records(&identity(1)).unwrap().unwrap();
    assert_eq!(stored[0].exec_count, (THREADS * CALLS) as u64);
    assert_eq!(stored[2].total_time_us, (THREADS * CALLS * 2) as u64);
    assert_eq!(store.info().used_chunks, 1);
}

#[test]
fn test_concurrent_sessions_share_one_incarnation() {
    const THREADS: usize = 6;

    let store = Arc::new(ProfilerStore::local(16).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                // every "process" compiles its own copy of the same source
                let unit = Arc::new(CompiledUnit::compile(
                    "shared_fn",
                    9,
                    1,
                    1,
                    Stmt::block(1, vec![Stmt::simple(2, SimpleKind::Perform)]),
                ));
                let session = ProfilerSession::new(store).with_clock(Arc::new(ManualClock::new()));

                let call = session.on_unit_begin(&unit).unwrap().unwrap();
                session.on_unit_end(call, false).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let stored = store.read_records(&identity(9)).unwrap().unwrap();
    assert_eq!(stored[0].exec_count, THREADS as u64);
    assert_eq!(store.stats().get(UnitKey::new(9, 1)).unwrap().unwrap().exec_count, THREADS as u64);
}

#[test]
fn test_call_statistics_are_shared_between_mappings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profiler.region");
    let key = UnitKey::new(12, 1);

    let first = Arc::new(ProfilerStore::shared(&path, 8).unwrap());
    let second = Arc::new(ProfilerStore::attach(&path).unwrap());

    let handles: Vec<_> = [(Arc::clone(&first), 10), (Arc::clone(&second), 30)]
        .into_iter()
        .map(|(store, elapsed)| {
            thread::spawn(move || {
                for _ in 0..50 {
                    store.stats().record(key, elapsed, false).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for store in [&first, &second] {
        let summary = store.stats().get(key).unwrap().unwrap();
        assert_eq!(summary.exec_count, 100);
        assert_eq!(summary.total_time_us, 50 * 10 + 50 * 30);
        assert_eq!((summary.min_time_us, summary.max_time_us), (10, 30));
    }
    assert_eq!(second.info().used_units, 1);

    // a later attach sees the same record
    drop(first);
    drop(second);
    let reopened = ProfilerStore::attach(&path).unwrap();
    assert_eq!(reopened.stats().read_all(1).unwrap()[0].exec_count, 100);
}

#[test]
fn test_shared_region_is_seen_by_every_mapping() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("profiler.region");

    let first = Arc::new(ProfilerStore::shared(&path, 32).unwrap());
    let second = Arc::new(ProfilerStore::attach(&path).unwrap());
    assert!(first.is_shared());

    let handles: Vec<_> = [Arc::clone(&first), Arc::clone(&second)]
        .into_iter()
        .map(|store| {
            thread::spawn(move || {
                let records = one_exec(&[1, 2]);
                for _ in 0..100 {
                    store.fold(&identity(3), &records).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(second.read_records(&identity(3)).unwrap().unwrap()[1].exec_count, 200);
    assert_eq!(first.info().used_chunks, 1);
}

#[test]
fn test_exhaustion_stores_nothing() {
    let store = ProfilerStore::local(2).unwrap();
    let big: Vec<i32> = (1..=61).collect();

    // 61 statements need 3 chunks
    let result = store.fold(&identity(1), &one_exec(&big));
    assert!(matches!(result, Err(StoreError::ResourceExhausted { capacity: 2 })));
    assert_eq!(store.info().used_chunks, 0);

    store.fold(&identity(2), &one_exec(&[1])).unwrap();
    assert_eq!(store.info().used_chunks, 1);
}

#[test]
fn test_mismatched_layout_is_fatal() {
    let store = ProfilerStore::local(4).unwrap();
    store.fold(&identity(1), &one_exec(&[1, 2])).unwrap();

    let result = store.fold(&identity(1), &one_exec(&[1, 3]));
    assert!(matches!(
        result,
        Err(StoreError::RecordMismatch { expected: 3, found: 2 })
    ));
}

#[test]
fn test_unusable_region_falls_back_to_local() {
    let dir = tempfile::tempdir().unwrap();
    // a directory can't be mapped as a region
    let config = StoreConfig::shared(dir.path()).with_capacity(4);

    let store = ProfilerStore::open(&config).unwrap();
    assert!(!store.is_shared());
    assert_eq!(store.info().capacity, 4);
}
