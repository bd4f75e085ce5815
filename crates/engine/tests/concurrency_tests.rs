//! Concurrency Tests
//!
//! Conflict detection between overlapping transactions, resolution
//! strategies, retries, and locking across threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempo_engine::{
    BranchName, Conflict, ConflictResolutionStrategy, ConflictResolver, Database, ManualClock, Resolution,
    RetryConfig, TempoError, TransactionState,
};

fn setup() -> (Arc<Database>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(100));
    let db = Database::builder().clock(clock.clone()).open().unwrap();
    (db, clock)
}

fn get(db: &Database, key: &str) -> Option<Vec<u8>> {
    db.begin(&BranchName::master()).unwrap().get("kv", key).unwrap()
}

#[test]
fn test_overlapping_writes_conflict_by_default() {
    let (db, _clock) = setup();
    let master = BranchName::master();
    db.transaction(&master, |tx| tx.put("kv", "x", b"base".to_vec())).unwrap();

    let mut first = db.begin(&master).unwrap();
    let mut second = db.begin(&master).unwrap();
    first.put("kv", "x", b"first".to_vec()).unwrap();
    second.put("kv", "x", b"second".to_vec()).unwrap();
    first.commit(None).unwrap();

    let err = second.commit(None).unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(second.state(), TransactionState::Aborted);
    assert_eq!(get(&db, "x"), Some(b"first".to_vec()));
}

#[test]
fn test_disjoint_keys_do_not_conflict() {
    let (db, _clock) = setup();
    let master = BranchName::master();
    let mut first = db.begin(&master).unwrap();
    let mut second = db.begin(&master).unwrap();
    first.put("kv", "a", b"1".to_vec()).unwrap();
    second.put("kv", "b", b"2".to_vec()).unwrap();
    let t1 = first.commit(None).unwrap();
    let t2 = second.commit(None).unwrap();
    assert!(t2 > t1);
}

#[test]
fn test_overwrite_strategies() {
    let (db, _clock) = setup();
    let master = BranchName::master();

    let mut first = db.begin(&master).unwrap();
    let mut second = db.begin(&master).unwrap();
    first.put("kv", "x", b"first".to_vec()).unwrap();
    second.put("kv", "x", b"second".to_vec()).unwrap();
    second.with_conflict_resolution(ConflictResolutionStrategy::OverwriteWithSource);
    first.commit(None).unwrap();
    second.commit(None).unwrap();
    assert_eq!(get(&db, "x"), Some(b"second".to_vec()));

    let mut third = db.begin(&master).unwrap();
    let mut fourth = db.begin(&master).unwrap();
    third.put("kv", "x", b"third".to_vec()).unwrap();
    fourth.put("kv", "x", b"fourth".to_vec()).unwrap();
    fourth.put("kv", "y", b"fourth".to_vec()).unwrap();
    db.set_conflict_resolution(ConflictResolutionStrategy::OverwriteWithTarget);
    third.commit(None).unwrap();
    fourth.commit(None).unwrap();
    assert_eq!(get(&db, "x"), Some(b"third".to_vec()));
    assert_eq!(get(&db, "y"), Some(b"fourth".to_vec()));
}

struct Concatenate;

impl ConflictResolver for Concatenate {
    fn resolve(&self, conflict: &Conflict) -> Resolution {
        let mut merged = conflict.existing_value.clone().unwrap_or_default();
        merged.extend_from_slice(conflict.incoming_value.as_deref().unwrap_or_default());
        Resolution::Replace(Some(merged))
    }
}

#[test]
fn test_custom_resolver_merges_values() {
    let clock = Arc::new(ManualClock::new(100));
    let db = Database::builder()
        .clock(clock)
        .conflict_resolver(Arc::new(Concatenate))
        .open()
        .unwrap();
    let master = BranchName::master();

    let mut first = db.begin(&master).unwrap();
    let mut second = db.begin(&master).unwrap();
    first.put("kv", "x", b"ab".to_vec()).unwrap();
    second.put("kv", "x", b"cd".to_vec()).unwrap();
    first.commit(None).unwrap();
    second.commit(None).unwrap();
    assert_eq!(get(&db, "x"), Some(b"abcd".to_vec()));
}

#[test]
fn test_retry_rereads_after_conflict() {
    let (db, _clock) = setup();
    let master = BranchName::master();
    db.transaction(&master, |tx| tx.put("kv", "counter", b"0".to_vec())).unwrap();

    let threads: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let master = BranchName::master();
                let config = RetryConfig::new()
                    .with_max_retries(100)
                    .with_backoff(Duration::from_millis(1), Duration::from_millis(5));
                for _ in 0..10 {
                    db.transaction_with_retry(&master, config.clone(), |tx| {
                        let current: u64 = String::from_utf8(tx.get("kv", "counter")?.unwrap_or_default())
                            .unwrap()
                            .parse()
                            .unwrap();
                        tx.put("kv", "counter", (current + 1).to_string().into_bytes())
                    })
                    .unwrap();
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }
    assert_eq!(get(&db, "counter"), Some(b"40".to_vec()));
}

#[test]
fn test_commits_on_different_branches_run_in_parallel() {
    let (db, _clock) = setup();
    let master = BranchName::master();
    let names: Vec<BranchName> = (0..4).map(|i| BranchName::new(format!("b{}", i)).unwrap()).collect();
    for name in &names {
        db.create_branch(name, &master).unwrap();
    }

    let threads: Vec<_> = names
        .iter()
        .cloned()
        .map(|branch| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..25 {
                    db.transaction(&branch, |tx| tx.put("kv", &format!("k{}", i), vec![i as u8]))
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in threads {
        handle.join().unwrap();
    }

    for name in &names {
        let tx = db.begin(name).unwrap();
        assert_eq!(tx.key_set("kv").unwrap().len(), 25);
    }
    assert!(get(&db, "k0").is_none());
}

#[test]
fn test_lock_upgrade_is_rejected() {
    let (db, _clock) = setup();
    let master = BranchName::master();
    let _branch = db.locks().branch(&master).unwrap();
    let err = db.delete_branch(&BranchName::new("anything").unwrap()).unwrap_err();
    assert!(matches!(err, TempoError::InvalidOperation { .. }));
}

#[test]
fn test_closed_transaction_rejects_use() {
    let (db, _clock) = setup();
    let master = BranchName::master();
    let mut tx = db.begin(&master).unwrap();
    tx.put("kv", "x", b"1".to_vec()).unwrap();
    tx.commit(None).unwrap();

    assert!(matches!(tx.get("kv", "x").unwrap_err(), TempoError::InvalidOperation { .. }));
    assert!(matches!(tx.put("kv", "y", b"2".to_vec()).unwrap_err(), TempoError::InvalidOperation { .. }));
    assert!(matches!(tx.put("", "y", b"2".to_vec()), Err(TempoError::InvalidOperation { .. })));

    let mut fresh = db.begin(&master).unwrap();
    assert!(matches!(fresh.put("kv", "", b"2".to_vec()).unwrap_err(), TempoError::InvalidArgument { .. }));
}

#[test]
fn test_metrics_track_outcomes() {
    let (db, _clock) = setup();
    let master = BranchName::master();
    db.transaction(&master, |tx| tx.put("kv", "x", b"1".to_vec())).unwrap();
    let _ = db.transaction(&master, |tx| {
        tx.put("kv", "y", b"1".to_vec())?;
        Err::<(), _>(TempoError::invalid_argument("caller gave up"))
    });

    let metrics = db.metrics();
    assert_eq!(metrics.total_started, 2);
    assert_eq!(metrics.total_committed, 1);
    assert_eq!(metrics.total_aborted, 1);
    assert_eq!(metrics.active_count, 0);
    assert_eq!(metrics.total_completed(), 2);
}

#[test]
fn test_reads_never_observe_half_applied_import() {
    let (source, clock) = setup();
    let master = BranchName::master();
    let child = BranchName::new("child").unwrap();
    source.transaction(&master, |tx| tx.put("kv", "base", b"m".to_vec())).unwrap();
    source.create_branch(&child, &master).unwrap();
    clock.set(200);
    source
        .transaction(&child, |tx| {
            for i in 0..300 {
                tx.put("kv", &format!("k{:03}", i), vec![1])?;
            }
            Ok(())
        })
        .unwrap();
    let dump = source.export().unwrap();

    let (target, _clock) = setup();
    let done = Arc::new(AtomicBool::new(false));
    let complete_reads = Arc::new(AtomicUsize::new(0));
    let reader = {
        let target = Arc::clone(&target);
        let done = Arc::clone(&done);
        let complete_reads = Arc::clone(&complete_reads);
        thread::spawn(move || {
            let child = BranchName::new("child").unwrap();
            loop {
                let finished = done.load(Ordering::Acquire);
                match target.begin(&child) {
                    Err(TempoError::BranchNotFound { .. }) => {}
                    Err(e) => panic!("unexpected error {}", e),
                    Ok(tx) => {
                        assert_eq!(tx.get("kv", "k299").unwrap(), Some(vec![1]));
                        assert_eq!(tx.key_set("kv").unwrap().len(), 301);
                        complete_reads.fetch_add(1, Ordering::AcqRel);
                    }
                }
                if finished {
                    break;
                }
            }
        })
    };

    target.import(&dump).unwrap();
    done.store(true, Ordering::Release);
    reader.join().unwrap();
    assert!(complete_reads.load(Ordering::Acquire) >= 1);
}
