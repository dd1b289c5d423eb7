//! Integration test: offline queueing → online drain.
//!
//! Covers the headline scenario: a capacity-3 queue absorbs four changes
//! while offline (evicting the oldest, visibly), then drains the survivors
//! in exact enqueue order once connectivity returns. Also verifies that a
//! process restart resumes persisted work and that drain stays single-flight
//! under concurrent callers.

use std::sync::Arc;

use serde_json::json;

use convoy_core::config::SyncConfig;
use convoy_core::types::{ChangeOp, EntityKind, SyncChange};
use convoy_remote::MemoryRemote;
use convoy_sync::persist::{JsonFileStore, MemoryStore, PersistentStore};
use convoy_sync::{NetworkMonitor, SyncQueue};

fn config(capacity: usize) -> SyncConfig {
    SyncConfig {
        queue_capacity: capacity,
        retry_base_ms: 1,
        retry_cap_ms: 10,
        ..Default::default()
    }
}

fn change(id: &str) -> SyncChange {
    SyncChange::new(EntityKind::Note, id, json!({"body": id}), ChangeOp::Upsert)
}

#[tokio::test]
async fn capacity_three_evicts_then_drains_in_order() {
    let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
    let remote = MemoryRemote::new();
    let monitor = NetworkMonitor::new(false);
    let queue = SyncQueue::open(
        store,
        Arc::new(remote.clone()),
        monitor.clone(),
        &config(3),
    )
    .unwrap();

    // Offline: enqueue A, B, C, D into a capacity-3 queue.
    for id in ["a", "b", "c", "d"] {
        queue.enqueue(change(id)).await.unwrap();
    }

    // A was evicted; the queue holds [B, C, D].
    let pending: Vec<String> = queue
        .pending()
        .await
        .into_iter()
        .map(|c| c.entity_id)
        .collect();
    assert_eq!(pending, vec!["b", "c", "d"]);

    // Go online and drain: B, C, D written in that order, all succeed.
    monitor.set_online(true);
    let outcome = queue.drain().await.unwrap();
    assert_eq!(outcome.succeeded, 3);
    assert!(outcome.failed.is_empty());
    assert_eq!(queue.len().await, 0);
    assert_eq!(
        remote.op_log(),
        vec!["upsert:notes:b", "upsert:notes:c", "upsert:notes:d"]
    );
}

#[tokio::test]
async fn restart_resumes_persisted_queue() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let remote = MemoryRemote::new();

    // First process: enqueue while offline, then "crash" (drop everything).
    {
        let store: Arc<dyn PersistentStore> = Arc::new(JsonFileStore::open(&path).unwrap());
        let queue = SyncQueue::open(
            store,
            Arc::new(remote.clone()),
            NetworkMonitor::new(false),
            &config(10),
        )
        .unwrap();
        queue.enqueue(change("survivor-1")).await.unwrap();
        queue.enqueue(change("survivor-2")).await.unwrap();
    }

    // Second process over the same file resumes and drains.
    let store: Arc<dyn PersistentStore> = Arc::new(JsonFileStore::open(&path).unwrap());
    let queue = SyncQueue::open(
        store,
        Arc::new(remote.clone()),
        NetworkMonitor::new(true),
        &config(10),
    )
    .unwrap();
    assert_eq!(queue.len().await, 2);

    let outcome = queue.drain().await.unwrap();
    assert_eq!(outcome.succeeded, 2);
    assert_eq!(
        remote.op_log(),
        vec!["upsert:notes:survivor-1", "upsert:notes:survivor-2"]
    );
}

#[tokio::test]
async fn concurrent_drains_write_each_change_once() {
    let store: Arc<dyn PersistentStore> = Arc::new(MemoryStore::new());
    let remote = MemoryRemote::new();
    let queue = Arc::new(
        SyncQueue::open(
            store,
            Arc::new(remote.clone()),
            NetworkMonitor::new(true),
            &config(50),
        )
        .unwrap(),
    );

    for i in 0..20 {
        queue.enqueue(change(&format!("n{i}"))).await.unwrap();
    }

    // Two racing drains: single-flight makes the loser a no-op, so every
    // change is written exactly once either way.
    let (a, b) = tokio::join!(
        {
            let queue = queue.clone();
            async move { queue.drain().await.unwrap() }
        },
        {
            let queue = queue.clone();
            async move { queue.drain().await.unwrap() }
        }
    );

    assert_eq!(a.succeeded + b.succeeded, 20);
    assert_eq!(queue.len().await, 0);
    assert_eq!(remote.op_log().len(), 20);
}
