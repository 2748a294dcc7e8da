mod common;

use common::test_helpers::{ScriptedTransport, SharedWriter};
use lifeline::conflict::ConflictStrategy;
use lifeline::{
    BreakerConfig, CircuitBreaker, ConflictResolver, ManualClock, MemoryStore, NetworkMonitor,
    OfflineQueue, OperationKind, QueueConfig, RawError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::fmt::writer::BoxMakeWriter;

fn capture() -> (SharedWriter, tracing::subscriber::DefaultGuard) {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(writer.clone()))
        .with_target(true)
        .with_max_level(tracing::Level::DEBUG)
        .without_time()
        .finish();
    (writer, tracing::subscriber::set_default(subscriber))
}

#[tokio::test]
async fn breaker_transitions_are_logged_with_their_key() {
    let (logs, _guard) = capture();
    let clock = ManualClock::new();
    let second = Duration::from_secs(1);
    let config = BreakerConfig::new(1, None, second, second).unwrap();
    let breaker = CircuitBreaker::new(config).with_clock(Arc::new(clock.clone()));

    let failing = || async { Err::<(), _>(RawError::status(503, "down")) };
    let _ = breaker.execute("user-api", failing).await;
    clock.advance(1_000);
    breaker.execute("user-api", || async { Ok::<_, RawError>(()) }).await.unwrap();

    let output = logs.contents();
    assert!(output.contains("lifeline::circuit_breaker"));
    assert!(output.contains("circuit breaker → open"));
    assert!(output.contains("circuit breaker → half-open"));
    assert!(output.contains("circuit breaker → closed"));
    assert!(output.contains("user-api"));
}

#[tokio::test]
async fn dead_letters_are_logged_as_errors() {
    let (logs, _guard) = capture();
    let transport = ScriptedTransport::new(vec![Err(RawError::status(403, "forbidden"))]);
    let queue = OfflineQueue::open(
        QueueConfig::default(),
        ConflictResolver::new(ConflictStrategy::Merge),
        Arc::new(MemoryStore::new()),
        transport,
        NetworkMonitor::new(true),
    )
    .await
    .unwrap();
    queue.enqueue(OperationKind::Delete, "user", json!({"id": "u1"})).await.unwrap();
    queue.sync().await.unwrap();

    let output = logs.contents();
    assert!(output.contains("ERROR"));
    assert!(output.contains("operation dead-lettered"));
}
