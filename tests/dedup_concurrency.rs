//! Concurrency tests for the dedup claim operation.
//!
//! The claim is the single correctness-critical mutex point in the system:
//! under concurrent delivery of the same build event, exactly one caller may
//! win the right to alert.

use pipewarden::dedup::{ClaimOutcome, DedupStore, EventIdentity};
use pipewarden::storage::open_pool;
use std::sync::Arc;

fn identity(build: &str, hash: &str) -> EventIdentity {
    EventIdentity {
        source_system: "azure".into(),
        build_id: build.into(),
        definition_id: "10".into(),
        content_hash: hash.into(),
    }
}

#[test]
fn test_concurrent_claims_yield_exactly_one_winner() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path().join("dedup.db").to_str().unwrap()).unwrap();
    let store = Arc::new(DedupStore::new(pool));

    const CALLERS: usize = 16;
    let barrier = Arc::new(std::sync::Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|i| {
            let store = store.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                // Each caller carries a different payload hash, as a retried
                // webhook would.
                let id = identity("42", &format!("hash-{i}"));
                barrier.wait();
                store.claim(&id).unwrap()
            })
        })
        .collect();

    let outcomes: Vec<ClaimOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let winners = outcomes
        .iter()
        .filter(|o| **o == ClaimOutcome::Claimed)
        .count();

    assert_eq!(winners, 1);
    assert_eq!(outcomes.len() - winners, CALLERS - 1);

    // One audit record exists for the key.
    assert_eq!(store.recent(100).unwrap().len(), 1);
}

#[test]
fn test_concurrent_claims_on_distinct_builds_all_win() {
    let dir = tempfile::tempdir().unwrap();
    let pool = open_pool(dir.path().join("dedup.db").to_str().unwrap()).unwrap();
    let store = Arc::new(DedupStore::new(pool));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = store.clone();
            std::thread::spawn(move || {
                let id = identity(&format!("build-{i}"), "h");
                store.claim(&id).unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), ClaimOutcome::Claimed);
    }
    assert_eq!(store.recent(100).unwrap().len(), 8);
}
