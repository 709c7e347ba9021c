use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use _xray_core::models::PackageVersion;
use _xray_core::store::{CacheKey, CacheKind, CacheManager, EntryStatus};
use rusqlite::{params, Connection};

fn key() -> CacheKey {
    CacheKey::new(
        CacheKind::NativeGraph,
        PackageVersion::new("numpy", "1.26.4"),
        "numpy/core/_multiarray_umath.so",
    )
}

fn open(path: &Path, lease: Duration) -> CacheManager {
    CacheManager::new(path, lease, Duration::from_millis(10)).unwrap()
}

fn now_millis() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_millis() as i64
}

/// Plant an in-progress entry owned by some other process.
fn plant_foreign_claim(path: &Path, key: &CacheKey, heartbeat_at: i64) {
    let conn = Connection::open(path).unwrap();
    conn.execute(
        "INSERT INTO cache_entries \
           (kind, package, version, context, status, payload, owner, heartbeat_at, error, updated_at, attempts) \
         VALUES (?1, ?2, ?3, ?4, 'in_progress', NULL, 'other-host-1234', ?5, NULL, ?5, 1);",
        params![key.kind.as_str(), key.package.name, key.package.version, key.context, heartbeat_at],
    )
    .unwrap();
}

#[test]
fn concurrent_callers_share_one_computation() {
    let dir = tempfile::tempdir().unwrap();
    let cache = Arc::new(open(&dir.path().join("cache.sqlite3"), Duration::from_secs(60)));
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compute(&key(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(200));
                        Ok(vec!["PyUFunc_Loop".to_string()])
                    })
                    .unwrap()
            })
        })
        .collect();

    let results: Vec<Vec<String>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| r == &results[0]));
    assert_eq!(cache.status(&key()).unwrap(), Some(EntryStatus::Complete));
}

#[test]
fn separate_managers_on_one_file_compute_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sqlite3");
    drop(open(&path, Duration::from_secs(60)));
    let calls = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let calls = Arc::clone(&calls);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let cache = open(&path, Duration::from_secs(60));
                barrier.wait();
                cache
                    .get_or_compute(&key(), || {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(200));
                        Ok(42u32)
                    })
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 42);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn abandoned_claim_is_reclaimed_after_lease() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sqlite3");
    let cache = open(&path, Duration::from_secs(1));
    plant_foreign_claim(&path, &key(), now_millis() - 60_000);

    let value: String = cache.get_or_compute(&key(), || Ok("fresh".to_string())).unwrap();
    assert_eq!(value, "fresh");
    assert_eq!(cache.stats().reclaimed, 1);
    assert_eq!(cache.attempts(&key()).unwrap(), 2);
}

#[test]
fn live_foreign_claim_is_awaited_not_recomputed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sqlite3");
    let cache = open(&path, Duration::from_secs(60));
    plant_foreign_claim(&path, &key(), now_millis());

    let finisher = {
        let path = path.clone();
        let key = key();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            let conn = Connection::open(&path).unwrap();
            conn.busy_timeout(Duration::from_secs(5)).unwrap();
            conn.execute(
                "UPDATE cache_entries SET status = 'complete', payload = '\"from-other\"', owner = NULL \
                 WHERE kind = ?1 AND package = ?2 AND version = ?3 AND context = ?4;",
                params![key.kind.as_str(), key.package.name, key.package.version, key.context],
            )
            .unwrap();
        })
    };

    let value: String = cache
        .get_or_compute(&key(), || panic!("the other owner is still alive"))
        .unwrap();
    finisher.join().unwrap();
    assert_eq!(value, "from-other");
}

#[test]
fn failed_entry_is_retried_by_next_caller() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.sqlite3");
    let first = open(&path, Duration::from_secs(60));
    assert!(first
        .get_or_compute::<u32, _>(&key(), || Err(_xray_core::errors::XrayError::Timeout {
            what: "native analysis".into(),
            seconds: 3600,
        }))
        .is_err());
    assert_eq!(first.status(&key()).unwrap(), Some(EntryStatus::Failed));

    let second = open(&path, Duration::from_secs(60));
    let value: u32 = second.get_or_compute(&key(), || Ok(9)).unwrap();
    assert_eq!(value, 9);
    assert_eq!(second.lookup(&key()).unwrap().as_deref(), Some("9"));
}
