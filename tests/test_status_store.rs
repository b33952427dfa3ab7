use sarstack::io::status::{JsonStatusStore, StatusStore, WorkState};
use sarstack::types::SarError;
use std::sync::Arc;
use std::thread;
use tempfile::TempDir;

#[test]
fn test_concurrent_updates_all_persist() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("progress.json");
    let store = Arc::new(JsonStatusStore::open(&path).expect("open store"));

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let store = Arc::clone(&store);
            thread::spawn(move || {
                for period in 1..=4 {
                    let unit = format!("composite:P{:02}_T{}", period, 100 + worker);
                    store.set(&unit, WorkState::InProgress, None).expect("set in-progress");
                    store.set(&unit, WorkState::Completed, None).expect("set completed");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker panicked");
    }

    assert_eq!(store.entries().len(), 32);
    let reopened = JsonStatusStore::open(&path).expect("reopen");
    let entries = reopened.entries();
    assert_eq!(entries.len(), 32);
    assert!(entries.values().all(|e| e.state == WorkState::Completed));
    assert!(reopened.is_completed("composite:P04_T107"));
}

#[test]
fn test_corrupt_status_file_is_an_error() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("progress.json");
    std::fs::write(&path, "{ not json").expect("write");
    assert!(matches!(JsonStatusStore::open(&path), Err(SarError::Json(_))));
    // The damaged file is left for inspection
    assert_eq!(std::fs::read_to_string(&path).expect("read"), "{ not json");

    std::fs::write(&path, "").expect("write");
    assert!(JsonStatusStore::open(&path).expect("empty file").entries().is_empty());
}
