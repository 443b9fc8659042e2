//! Concurrent access tests for `MemorySubjectKeyStore`.
//!
//! These tests exercise the key store under multi-threaded workloads to make
//! sure the single-active-key invariant survives racing writers.

#![allow(clippy::expect_used, clippy::panic)]

use tokengate_storage::{
    SubjectId,
    error::StorageError,
    keys::{MemorySubjectKeyStore, SubjectKeyStore},
    testutil::{make_entry, unrevoked_count},
};
use tokio::task::JoinSet;

/// Number of concurrent tasks for most tests.
const CONCURRENCY: usize = 16;

/// Number of rounds for the exactly-one-winner test.
const ROUNDS: i64 = 25;

// ---------------------------------------------------------------------------
// Test: Racing registrations of overlapping keys, exactly one winner
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_registrations_have_one_winner() {
    let store = MemorySubjectKeyStore::new();

    for subject in 1..=ROUNDS {
        let mut set = JoinSet::new();
        for task_id in 0..CONCURRENCY {
            let store = store.clone();
            set.spawn(async move {
                store.register_key(&make_entry(subject, &format!("{subject}-{task_id}"))).await
            });
        }

        let mut winners = 0;
        while let Some(result) = set.join_next().await {
            match result.expect("task should not panic") {
                Ok(()) => winners += 1,
                Err(StorageError::Conflict { .. }) => {},
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(winners, 1, "subject {subject} should have exactly one registered key");
        assert_eq!(unrevoked_count(&store, subject).await, 1);
    }
}

// ---------------------------------------------------------------------------
// Test: Racing rotations never leave two unrevoked keys
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_rotations_keep_single_active_key() {
    let store = MemorySubjectKeyStore::new();
    store.register_key(&make_entry(7, "7-initial")).await.expect("seed key");

    let mut set = JoinSet::new();
    for task_id in 0..CONCURRENCY {
        let store = store.clone();
        set.spawn(async move { store.rotate_key(&make_entry(7, &format!("7-{task_id}"))).await });
    }
    while let Some(result) = set.join_next().await {
        result.expect("task should not panic").expect("rotation should succeed");
    }

    let history = store.get_keys(SubjectId::from(7)).await.expect("get_keys");
    assert_eq!(history.len(), CONCURRENCY + 1);
    assert_eq!(unrevoked_count(&store, 7).await, 1);
}

// ---------------------------------------------------------------------------
// Test: Readers during rotation see a consistent history
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_observe_two_unrevoked_keys() {
    let store = MemorySubjectKeyStore::new();
    store.register_key(&make_entry(9, "9-0")).await.expect("seed key");

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            for i in 1..=50 {
                store.rotate_key(&make_entry(9, &format!("9-{i}"))).await.expect("rotate");
                tokio::task::yield_now().await;
            }
        })
    };

    let mut readers = JoinSet::new();
    for _ in 0..CONCURRENCY {
        let store = store.clone();
        readers.spawn(async move {
            for _ in 0..50 {
                let history = store.get_keys(SubjectId::from(9)).await.expect("get_keys");
                let unrevoked = history.iter().filter(|entry| !entry.is_revoked()).count();
                assert_eq!(unrevoked, 1, "history snapshot must hold exactly one unrevoked key");
                tokio::task::yield_now().await;
            }
        });
    }

    writer.await.expect("writer should not panic");
    while let Some(result) = readers.join_next().await {
        result.expect("reader should not panic");
    }
}
