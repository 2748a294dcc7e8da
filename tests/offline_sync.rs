mod common;

use common::test_helpers::ScriptedTransport;
use lifeline::conflict::ConflictStrategy;
use lifeline::queue::SyncUnavailable;
use lifeline::{
    ConflictResolver, FileStore, KeyValueStore, MemoryStore, NetworkMonitor, OfflineQueue,
    OperationKind, QueueConfig, QueueError, RawError, Resolution, SyncOutcome,
};
use serde_json::json;
use std::sync::Arc;

async fn open_queue(
    transport: Arc<ScriptedTransport>,
    store: Arc<dyn KeyValueStore>,
    network: NetworkMonitor,
    strategy: ConflictStrategy,
    max_queue_size: usize,
) -> OfflineQueue {
    let config = QueueConfig { max_queue_size, max_retries: 3, namespace: "app".into() };
    let resolver = ConflictResolver::new(strategy);
    OfflineQueue::open(config, resolver, store, transport, network).await.unwrap()
}

#[tokio::test]
async fn reconnect_sync_replays_each_operation_once() {
    let transport = ScriptedTransport::echo();
    let network = NetworkMonitor::new(false);
    let queue = open_queue(
        transport.clone(),
        Arc::new(MemoryStore::new()),
        network.clone(),
        ConflictStrategy::Merge,
        10,
    )
    .await;

    for n in 0..3 {
        queue.enqueue(OperationKind::Create, "note", json!({ "text": n })).await.unwrap();
    }
    assert_eq!(queue.sync().await.unwrap(), SyncOutcome::Unavailable(SyncUnavailable::Offline));
    assert_eq!(transport.call_count(), 0);

    network.set_online(true);
    let outcome = queue.sync().await.unwrap();
    let report = outcome.report().unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.succeeded, 3);
    assert_eq!(report.remaining, 0);

    let calls = transport.calls();
    assert!(calls.iter().all(|(op, _)| op == "note.create"));
    let texts: Vec<_> = calls.iter().map(|(_, p)| p["text"].clone()).collect();
    assert_eq!(texts, vec![json!(0), json!(1), json!(2)]);

    let second = queue.sync().await.unwrap();
    assert_eq!(second.report().unwrap().processed, 0);
    assert_eq!(transport.call_count(), 3);
}

#[tokio::test]
async fn failed_operations_stay_queued_and_block_their_entity() {
    let transport = ScriptedTransport::new(vec![
        Err(RawError::status(503, "unavailable")),
        Ok(json!({"id": "b", "version": 1})),
    ]);
    let queue = open_queue(
        transport.clone(),
        Arc::new(MemoryStore::new()),
        NetworkMonitor::new(true),
        ConflictStrategy::Merge,
        10,
    )
    .await;

    for (id, name) in [("a", "x"), ("b", "y"), ("a", "z")] {
        let update = json!({"id": id, "name": name, "version": 1});
        queue.enqueue(OperationKind::Update, "user", update).await.unwrap();
    }

    let report = queue.sync().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.remaining, 2);

    let pending = queue.pending().await;
    assert_eq!(pending[0].payload["name"], "x");
    assert_eq!(pending[0].retry_count, 1);
    assert_eq!(pending[1].payload["name"], "z");

    let report = queue.sync().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.succeeded, 2);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn queue_full_keeps_existing_operations_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn KeyValueStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let network = NetworkMonitor::new(false);
    let queue = open_queue(
        ScriptedTransport::echo(),
        store.clone(),
        network.clone(),
        ConflictStrategy::Merge,
        2,
    )
    .await;

    let first =
        queue.enqueue(OperationKind::Create, "note", json!({"text": "one"})).await.unwrap();
    let second =
        queue.enqueue(OperationKind::Create, "note", json!({"text": "two"})).await.unwrap();
    let err =
        queue.enqueue(OperationKind::Create, "note", json!({"text": "three"})).await.unwrap_err();
    assert!(matches!(err, QueueError::QueueFull { max: 2 }));

    let reopened =
        open_queue(ScriptedTransport::echo(), store, network, ConflictStrategy::Merge, 2).await;
    let ids: Vec<_> = reopened.pending().await.into_iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![first, second]);
}

#[tokio::test]
async fn version_conflict_merges_to_next_version() {
    let transport = ScriptedTransport::new(vec![Ok(json!({
        "id": "u1",
        "name": "server",
        "email": "u1@example.com",
        "version": 5
    }))]);
    let queue = open_queue(
        transport.clone(),
        Arc::new(MemoryStore::new()),
        NetworkMonitor::new(true),
        ConflictStrategy::Merge,
        10,
    )
    .await;
    let update = json!({"id": "u1", "name": "client", "version": 3});
    queue.enqueue(OperationKind::Update, "user", update).await.unwrap();

    let report = queue.sync().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.conflicts.len(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.resolution, Resolution::Merged);
    let merged = conflict.merged_payload.as_ref().unwrap();
    assert_eq!(merged["version"], 6);
    assert_eq!(merged["name"], "client");
    assert_eq!(merged["email"], "u1@example.com");

    let calls = transport.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].1["force"], true);
    assert_eq!(calls[1].1["version"], 6);
    assert!(queue.is_empty().await);
}

#[tokio::test]
async fn manual_conflicts_wait_for_a_decision() {
    let server = json!({"id": "u1", "name": "server", "version": 5});
    let transport = ScriptedTransport::new(vec![Ok(server)]);
    let queue = open_queue(
        transport.clone(),
        Arc::new(MemoryStore::new()),
        NetworkMonitor::new(true),
        ConflictStrategy::Manual,
        10,
    )
    .await;
    let id = queue
        .enqueue(OperationKind::Update, "user", json!({"id": "u1", "name": "client", "version": 3}))
        .await
        .unwrap();

    let report = queue.sync().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.conflicts[0].resolution, Resolution::ManualRequired);
    assert_eq!(report.succeeded, 0);
    assert_eq!(queue.parked().await.len(), 1);
    assert!(queue.is_empty().await);

    queue.resolve_conflict(&id, Resolution::ClientWins).await.unwrap();
    assert!(queue.parked().await.is_empty());
    let report = queue.sync().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.succeeded, 1);
    let (_, resent) = transport.calls().pop().unwrap();
    assert_eq!(resent["name"], "client");
    assert_eq!(resent["force"], true);
}

#[tokio::test]
async fn non_recoverable_failures_are_dead_lettered() {
    let transport = ScriptedTransport::new(vec![Err(RawError::status(422, "bad"))]);
    let queue = open_queue(
        transport,
        Arc::new(MemoryStore::new()),
        NetworkMonitor::new(true),
        ConflictStrategy::Merge,
        10,
    )
    .await;
    let id = queue.enqueue(OperationKind::Create, "note", json!({})).await.unwrap();

    let report = queue.sync().await.unwrap().report().cloned().unwrap();
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].operation.id, id);
    assert_eq!(queue.dead_letters().await.len(), 1);

    queue.requeue_dead_letter(&id).await.unwrap();
    assert_eq!(queue.len().await, 1);
    assert!(queue.dead_letters().await.is_empty());
}
