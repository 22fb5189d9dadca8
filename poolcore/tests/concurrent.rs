use std::thread;

use poolcore::*;

fn policy() -> LockPolicy {
    LockPolicy {
        timeout:        Duration::from_secs(10),
        backoff_min:    Duration::from_millis(1),
        backoff_max:    Duration::from_millis(3),
        ..LockPolicy::default()
    }
}

fn config() -> AllocatorConfig {
    AllocatorConfig {
        lock:   policy(),
        ..AllocatorConfig::default()
    }
}

fn assert_disjoint(blocks: &[Block]) {
    let mut live = blocks.iter()
        .filter(|b| b.reserves())
        .map(|b| b.range.clone())
        .collect_vec();
    live.sort();
    for (a, b) in live.iter().tuple_windows() {
        assert!(a.end <= b.start, "{a} overlaps {b}");
    }
}

#[test]
fn racing_workers_never_overlap() {
    let store = Arc::new(MemoryStore::new());
    let lock = Arc::new(MemoryLock::new());
    let puzzle = BigRange::from_u64(0, 10_000).unwrap();
    let sizes = SizePolicy::new(KeyInt::from(10u8), KeyInt::from(50u8));

    thread::scope(|s| {
        for w in 0..8u64 {
            let (store, lock, puzzle, sizes) = (store.clone(), lock.clone(), &puzzle, &sizes);
            s.spawn(move || {
                // One coordinator per worker, as if each lived in its own
                // process.
                let pool = AllocationCoordinator::new(store, lock, config()).with_seed(w);
                let owner = OwnerToken(format!("worker-{w}"));
                for _ in 0..10 {
                    let b = pool.allocate(&owner, puzzle, sizes).unwrap();
                    assert!(b.range.lies_within(puzzle));
                }
            });
        }
    });

    let blocks = store.list_blocks(&[]).unwrap();
    assert_eq!(blocks.len(), 80);
    assert_disjoint(&blocks);
}

#[test]
fn last_fitting_block_goes_to_exactly_one_worker() {
    let store = Arc::new(MemoryStore::new());
    let lock = Arc::new(MemoryLock::new());
    let puzzle = BigRange::from_u64(0x40, 0x4a).unwrap();
    let sizes = SizePolicy::fixed(KeyInt::from(6u8));
    let request = SizeRequest::Exact(KeyInt::from(6u8));

    let outcomes = thread::scope(|s| {
        let handles = (0..2)
            .map(|w| {
                let pool = AllocationCoordinator::new(store.clone(), lock.clone(), config());
                let (puzzle, sizes, request) = (&puzzle, &sizes, &request);
                s.spawn(move || pool.allocate_sized(&OwnerToken(format!("w{w}")), puzzle, sizes, request))
            })
            .collect_vec();
        handles.into_iter()
            .map(|h| h.join().unwrap())
            .collect_vec()
    });

    let (won, lost): (Vec<_>, Vec<_>) = outcomes.into_iter().partition(|o| o.is_ok());
    assert_eq!((won.len(), lost.len()), (1, 1));
    assert!(matches!(lost[0], Err(PoolError::NoAvailableSegment { .. })));
    assert_eq!(store.list_blocks(&[]).unwrap().len(), 1);
}

#[test]
fn completion_and_expiry_race_cleanly() {
    let store = Arc::new(MemoryStore::new());
    let lock = Arc::new(MemoryLock::new());
    let pool = AllocationCoordinator::new(store.clone(), lock, config()).with_seed(1);
    let puzzle = BigRange::from_u64(0, 1 << 20).unwrap();
    let sizes = SizePolicy::fixed(KeyInt::from(100u8));
    let ids = (0..60)
        .map(|i| pool.allocate(&OwnerToken(format!("w{i}")), &puzzle, &sizes).unwrap().id)
        .collect_vec();

    let far_future = Utc::now() + chrono::Duration::days(365);
    let (completed, expired) = thread::scope(|s| {
        let completer = s.spawn(|| {
            ids.iter()
                .filter(|id| pool.complete(id, "ok").is_ok())
                .count()
        });
        let sweeper = s.spawn(|| {
            let mut n = 0;
            for _ in 0..5 {
                n += pool.expire_stale(far_future).unwrap();
            }
            n
        });
        (completer.join().unwrap(), sweeper.join().unwrap())
    });

    // Every block went exactly one way.
    assert_eq!(completed + expired, ids.len());
    let blocks = store.list_blocks(&[]).unwrap();
    assert_eq!(blocks.iter().filter(|b| b.status == BlockStatus::Completed).count(), completed);
    assert_eq!(blocks.iter().filter(|b| b.status == BlockStatus::Expired).count(), expired);
    assert!(blocks.iter().all(|b| b.status.is_terminal()));
}
