//! Durable offline write queue with replay and conflict handling.
//!
//! Writes that cannot complete live are queued, persisted through a [`KeyValueStore`], and
//! replayed in enqueue order by [`OfflineQueue::sync`]. The queue keeps three collections, each
//! stored as a JSON array under its own key:
//!
//! - `{namespace}.queue`: operations waiting for replay, in FIFO order.
//! - `{namespace}.parked`: operations whose conflict needs a caller decision
//!   ([`OfflineQueue::resolve_conflict`]).
//! - `{namespace}.dead_letters`: operations that exhausted their retry budget or can never
//!   succeed. Nothing is dropped silently; callers requeue or discard them explicitly.
//!
//! Every mutation rewrites the persisted state before it returns.

use crate::classify::classify;
use crate::clock::{Clock, MonotonicClock};
use crate::conflict::{forced_payload, merge_records, ConflictRecord, ConflictResolver, Resolution};
use crate::error::{ClassifiedError, ErrorContext, ErrorKind};
use crate::network::NetworkMonitor;
use crate::store::{KeyValueStore, StoreError};
use crate::telemetry::{EventBus, QueueEvent, SyncEvent};
use crate::transport::Transport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        }
    }
}

/// A deferred write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: String,
    pub kind: OperationKind,
    pub entity_type: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub client_version: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimistic_id: Option<String>,
    /// Enqueue order; survives restarts so requeued operations return to their original slot.
    #[serde(default)]
    pub sequence: u64,
}

impl QueuedOperation {
    /// Transport operation a replay calls, e.g. `user.update`.
    pub fn operation_name(&self) -> String {
        format!("{}.{}", self.entity_type, self.kind.as_str())
    }

    /// Entity identity (`entity_type` + payload `id`) used for per-entity ordering.
    pub fn entity_key(&self) -> Option<String> {
        let id = match self.payload.get("id")? {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            _ => return None,
        };
        Some(format!("{}:{}", self.entity_type, id))
    }
}

/// An operation waiting for the caller to resolve its conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedOperation {
    pub operation: QueuedOperation,
    pub conflict: ConflictRecord,
}

/// An operation removed from the active queue because it cannot be replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub operation: QueuedOperation,
    pub error: ClassifiedError,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("offline queue is full ({max} operations)")]
    QueueFull { max: usize },
    #[error("operation '{0}' not found")]
    NotFound(String),
    #[error("write '{optimistic_id}' is already queued as '{existing}'")]
    DuplicateWrite { optimistic_id: String, existing: String },
    #[error("'{0:?}' cannot settle a parked conflict")]
    InvalidResolution(Resolution),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("queue state is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueConfig {
    /// Upper bound on active plus parked operations.
    pub max_queue_size: usize,
    /// Failed replays allowed before an operation is dead-lettered.
    pub max_retries: u32,
    /// Prefix of the persisted keys.
    pub namespace: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_queue_size: 1_000, max_retries: 5, namespace: "lifeline".to_string() }
    }
}

/// Why `sync` did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncUnavailable {
    Offline,
    InProgress,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncReport {
    /// Operations attempted in this pass.
    pub processed: usize,
    /// Operations removed from the queue.
    pub succeeded: usize,
    /// Operations moved to dead letters in this pass.
    pub failed: Vec<DeadLetter>,
    pub conflicts: Vec<ConflictRecord>,
    /// Operations left untouched to keep per-entity order behind an earlier failure.
    pub skipped: usize,
    /// Active operations left after the pass.
    pub remaining: usize,
    /// Store failure not recovered by a later write in the same pass. The in-memory queue is
    /// ahead of the store until the next successful persist.
    pub persist_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    Unavailable(SyncUnavailable),
}

impl SyncOutcome {
    pub fn report(&self) -> Option<&SyncReport> {
        match self {
            SyncOutcome::Completed(report) => Some(report),
            SyncOutcome::Unavailable(_) => None,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    active: Vec<QueuedOperation>,
    parked: Vec<ParkedOperation>,
    dead: Vec<DeadLetter>,
    next_sequence: u64,
}

impl QueueState {
    fn occupancy(&self) -> usize {
        self.active.len() + self.parked.len()
    }

    /// Put `op` back in the active queue at its original position.
    fn reinsert(&mut self, op: QueuedOperation) {
        let at = self.active.partition_point(|o| o.sequence < op.sequence);
        self.active.insert(at, op);
    }

    /// Active or parked operation carrying the caller-supplied identity.
    fn pending_with_identity(&self, optimistic_id: &str) -> Option<&QueuedOperation> {
        self.active
            .iter()
            .chain(self.parked.iter().map(|p| &p.operation))
            .find(|o| o.optimistic_id.as_deref() == Some(optimistic_id))
    }

    fn take_active(&mut self, id: &str) -> Option<QueuedOperation> {
        let at = self.active.iter().position(|o| o.id == id)?;
        Some(self.active.remove(at))
    }
}

/// What happened to one operation during a replay.
enum Replayed {
    Done,
    Retry(ClassifiedError),
    Dead(ClassifiedError),
    Parked(ConflictRecord),
}

pub struct OfflineQueue {
    state: Mutex<QueueState>,
    store: Arc<dyn KeyValueStore>,
    transport: Arc<dyn Transport>,
    network: NetworkMonitor,
    resolver: ConflictResolver,
    config: QueueConfig,
    clock: Arc<dyn Clock>,
    events: Option<EventBus>,
    sync_in_progress: AtomicBool,
}

impl std::fmt::Debug for OfflineQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OfflineQueue")
            .field("config", &self.config)
            .field("resolver", &self.resolver)
            .field("sync_in_progress", &self.sync_in_progress.load(Ordering::Relaxed))
            .finish()
    }
}

impl OfflineQueue {
    /// Load persisted state from `store` and build the queue.
    pub async fn open(
        config: QueueConfig,
        resolver: ConflictResolver,
        store: Arc<dyn KeyValueStore>,
        transport: Arc<dyn Transport>,
        network: NetworkMonitor,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            state: Mutex::new(QueueState::default()),
            store,
            transport,
            network,
            resolver,
            config,
            clock: Arc::new(MonotonicClock::default()),
            events: None,
            sync_in_progress: AtomicBool::new(false),
        };
        queue.load().await?;
        Ok(queue)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn is_syncing(&self) -> bool {
        self.sync_in_progress.load(Ordering::Acquire)
    }

    fn key(&self, suffix: &str) -> String {
        format!("{}.{}", self.config.namespace, suffix)
    }

    async fn load(&self) -> Result<(), QueueError> {
        let active: Vec<QueuedOperation> = self.read_key("queue").await?;
        let parked: Vec<ParkedOperation> = self.read_key("parked").await?;
        let dead: Vec<DeadLetter> = self.read_key("dead_letters").await?;

        let mut state = self.state.lock().await;
        let next_sequence = active
            .iter()
            .chain(parked.iter().map(|p| &p.operation))
            .chain(dead.iter().map(|d| &d.operation))
            .map(|o| o.sequence + 1)
            .max()
            .unwrap_or(0);
        tracing::info!(
            target: "lifeline::queue",
            active = active.len(),
            parked = parked.len(),
            dead_letters = dead.len(),
            "offline queue loaded"
        );
        *state = QueueState { active, parked, dead, next_sequence };
        Ok(())
    }

    async fn read_key<T: serde::de::DeserializeOwned>(
        &self,
        suffix: &str,
    ) -> Result<Vec<T>, QueueError> {
        match self.store.get(&self.key(suffix)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    async fn persist(&self, state: &QueueState) -> Result<(), QueueError> {
        self.store.set(&self.key("queue"), serde_json::to_vec(&state.active)?).await?;
        self.store.set(&self.key("parked"), serde_json::to_vec(&state.parked)?).await?;
        self.store.set(&self.key("dead_letters"), serde_json::to_vec(&state.dead)?).await?;
        Ok(())
    }

    /// Queue a write for later replay.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        entity_type: impl Into<String>,
        payload: Value,
    ) -> Result<String, QueueError> {
        self.enqueue_with_identity(kind, entity_type, payload, None).await
    }

    /// Queue a write keyed by a caller-supplied identity.
    ///
    /// Enqueuing the same `optimistic_id` again returns the existing operation's id instead of
    /// queuing a duplicate.
    pub async fn enqueue_optimistic(
        &self,
        kind: OperationKind,
        entity_type: impl Into<String>,
        payload: Value,
        optimistic_id: impl Into<String>,
    ) -> Result<String, QueueError> {
        self.enqueue_with_identity(kind, entity_type, payload, Some(optimistic_id.into())).await
    }

    async fn enqueue_with_identity(
        &self,
        kind: OperationKind,
        entity_type: impl Into<String>,
        payload: Value,
        optimistic_id: Option<String>,
    ) -> Result<String, QueueError> {
        let mut state = self.state.lock().await;

        if let Some(oid) = optimistic_id.as_deref() {
            if let Some(op) = state.pending_with_identity(oid) {
                tracing::debug!(
                    target: "lifeline::queue",
                    optimistic_id = oid,
                    id = %op.id,
                    "duplicate write ignored"
                );
                return Ok(op.id.clone());
            }
        }

        if state.occupancy() >= self.config.max_queue_size {
            let max = self.config.max_queue_size;
            tracing::warn!(target: "lifeline::queue", max, "offline queue full");
            return Err(QueueError::QueueFull { max });
        }

        let op = QueuedOperation {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            entity_type: entity_type.into(),
            client_version: payload.get("version").and_then(Value::as_u64).unwrap_or(0),
            payload,
            enqueued_at: self.clock.now_utc(),
            retry_count: 0,
            optimistic_id,
            sequence: state.next_sequence,
        };
        let id = op.id.clone();
        let entity_type = op.entity_type.clone();
        state.next_sequence += 1;
        state.active.push(op);

        if let Err(e) = self.persist(&state).await {
            state.active.pop();
            state.next_sequence -= 1;
            return Err(e);
        }

        let depth = state.active.len();
        tracing::info!(target: "lifeline::queue", %id, %entity_type, depth, "write queued");
        self.publish(QueueEvent::Enqueued { operation_id: id.clone(), entity_type, depth });
        Ok(id)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.active.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.active.is_empty()
    }

    /// Active operations in replay order.
    pub async fn pending(&self) -> Vec<QueuedOperation> {
        self.state.lock().await.active.clone()
    }

    pub async fn parked(&self) -> Vec<ParkedOperation> {
        self.state.lock().await.parked.clone()
    }

    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead.clone()
    }

    /// Move a dead letter back into the active queue with a fresh retry budget.
    pub async fn requeue_dead_letter(&self, id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let at = state
            .dead
            .iter()
            .position(|d| d.operation.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if let Some(oid) = state.dead[at].operation.optimistic_id.as_deref() {
            if let Some(op) = state.pending_with_identity(oid) {
                return Err(QueueError::DuplicateWrite {
                    optimistic_id: oid.to_string(),
                    existing: op.id.clone(),
                });
            }
        }
        if state.occupancy() >= self.config.max_queue_size {
            return Err(QueueError::QueueFull { max: self.config.max_queue_size });
        }
        let letter = state.dead.remove(at);
        let mut op = letter.operation.clone();
        op.retry_count = 0;
        state.reinsert(op);
        if let Err(e) = self.persist(&state).await {
            state.take_active(id);
            state.dead.insert(at, letter);
            return Err(e);
        }
        tracing::info!(target: "lifeline::queue", id, "dead letter requeued");
        Ok(())
    }

    /// Permanently drop a dead letter.
    pub async fn discard_dead_letter(&self, id: &str) -> Result<DeadLetter, QueueError> {
        let mut state = self.state.lock().await;
        let at = state
            .dead
            .iter()
            .position(|d| d.operation.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let letter = state.dead.remove(at);
        if let Err(e) = self.persist(&state).await {
            state.dead.insert(at, letter);
            return Err(e);
        }
        tracing::info!(target: "lifeline::queue", id, "dead letter discarded");
        Ok(letter)
    }

    /// Settle a parked conflict.
    ///
    /// `ServerWins` drops the operation. `ClientWins` and `Merged` return it to the queue with a
    /// forced payload, replayed by the next `sync`.
    pub async fn resolve_conflict(
        &self,
        id: &str,
        resolution: Resolution,
    ) -> Result<(), QueueError> {
        if resolution == Resolution::ManualRequired {
            return Err(QueueError::InvalidResolution(resolution));
        }
        let mut state = self.state.lock().await;
        let at = state
            .parked
            .iter()
            .position(|p| p.operation.id == id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        let parked = state.parked.remove(at);

        if resolution != Resolution::ServerWins {
            let mut record = parked.conflict.clone();
            record.resolution = resolution;
            if resolution == Resolution::Merged && record.merged_payload.is_none() {
                let fields = (record.client_payload.as_object(), record.server_payload.as_object());
                let merged = match fields {
                    (Some(client), Some(server)) => merge_records(
                        client,
                        server,
                        parked.operation.client_version,
                        crate::conflict::server_version(&record.server_payload),
                    ),
                    _ => None,
                };
                if merged.is_none() {
                    state.parked.insert(at, parked);
                    return Err(QueueError::InvalidResolution(resolution));
                }
                record.merged_payload = merged;
            }
            let mut op = parked.operation.clone();
            op.payload = forced_payload(&record);
            op.client_version =
                op.payload.get("version").and_then(Value::as_u64).unwrap_or(op.client_version);
            state.reinsert(op);
        }

        if let Err(e) = self.persist(&state).await {
            state.take_active(id);
            state.parked.insert(at, parked);
            return Err(e);
        }
        tracing::info!(target: "lifeline::queue", id, ?resolution, "conflict resolved");
        Ok(())
    }

    /// Replay queued operations against the transport.
    ///
    /// Returns `Unavailable` without touching the queue when offline or when another sync is
    /// running. Each operation present when the pass starts is attempted at most once.
    pub async fn sync(&self) -> Result<SyncOutcome, QueueError> {
        if !self.network.is_online() {
            return Ok(SyncOutcome::Unavailable(SyncUnavailable::Offline));
        }
        if self
            .sync_in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(SyncOutcome::Unavailable(SyncUnavailable::InProgress));
        }
        let _flag = SyncFlag(&self.sync_in_progress);

        let batch = self.state.lock().await.active.clone();
        tracing::info!(target: "lifeline::queue", pending = batch.len(), "sync started");

        let mut report = SyncReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for op in batch {
            if !self.network.is_online() {
                tracing::warn!(target: "lifeline::queue", "network lost during sync; stopping");
                break;
            }
            let entity = op.entity_key();
            if entity.as_ref().is_some_and(|e| blocked.contains(e)) {
                report.skipped += 1;
                continue;
            }

            report.processed += 1;
            let outcome = self.replay(&op, &mut report).await;
            let done = matches!(outcome, Replayed::Done);
            match self.settle(&op.id, outcome, &mut report).await {
                Some(dead) => report.failed.push(dead),
                None if done => report.succeeded += 1,
                None => {
                    if let Some(entity) = entity {
                        blocked.insert(entity);
                    }
                }
            }
        }

        report.remaining = self.state.lock().await.active.len();
        tracing::info!(
            target: "lifeline::queue",
            processed = report.processed,
            succeeded = report.succeeded,
            failed = report.failed.len(),
            conflicts = report.conflicts.len(),
            remaining = report.remaining,
            "sync finished"
        );
        self.publish(QueueEvent::SyncCompleted {
            processed: report.processed,
            failed: report.failed.len(),
            conflicts: report.conflicts.len(),
            remaining: report.remaining,
        });
        Ok(SyncOutcome::Completed(report))
    }

    async fn replay(&self, op: &QueuedOperation, report: &mut SyncReport) -> Replayed {
        let operation = op.operation_name();
        let context = ErrorContext::operation(operation.clone());

        let response = match self.transport.call(&operation, op.payload.clone()).await {
            Ok(response) => response,
            Err(raw) => return self.failed(op, classify(&raw, Some(&context))),
        };

        let Some(kind) = self.resolver.detect(op, &response) else {
            return Replayed::Done;
        };
        let record = self.resolver.resolve(op, kind, &response);
        tracing::warn!(
            target: "lifeline::queue",
            id = %op.id,
            ?kind,
            resolution = ?record.resolution,
            "replay conflict"
        );
        self.publish(QueueEvent::ConflictRaised {
            operation_id: op.id.clone(),
            kind,
            resolution: record.resolution,
        });
        report.conflicts.push(record.clone());

        match record.resolution {
            Resolution::ServerWins => Replayed::Done,
            Resolution::ManualRequired => Replayed::Parked(record),
            Resolution::ClientWins | Resolution::Merged => {
                match self.transport.call(&operation, forced_payload(&record)).await {
                    Ok(_) => Replayed::Done,
                    Err(raw) => self.failed(op, classify(&raw, Some(&context))),
                }
            }
        }
    }

    fn failed(&self, op: &QueuedOperation, err: ClassifiedError) -> Replayed {
        if !err.is_recoverable() {
            return Replayed::Dead(err);
        }
        tracing::debug!(
            target: "lifeline::queue",
            id = %op.id,
            kind = %err.kind(),
            retry_count = op.retry_count,
            "replay failed; keeping queued"
        );
        Replayed::Retry(err)
    }

    /// Apply a replay outcome to the queue. Returns the dead letter if the operation was retired.
    ///
    /// A store failure does not abort the pass; it is recorded on the report and the next
    /// persist writes the full state again.
    async fn settle(
        &self,
        id: &str,
        outcome: Replayed,
        report: &mut SyncReport,
    ) -> Option<DeadLetter> {
        let mut state = self.state.lock().await;
        let mut current = state.take_active(id)?;

        let mut retired = None;
        match outcome {
            Replayed::Done => {}
            Replayed::Parked(conflict) => {
                state.parked.push(ParkedOperation { operation: current, conflict })
            }
            // No attempt reached the dependency; the retry budget is not spent.
            Replayed::Retry(err) if err.kind() == ErrorKind::CircuitOpen => state.reinsert(current),
            Replayed::Retry(err) => {
                current.retry_count += 1;
                if current.retry_count > self.config.max_retries {
                    let failed_at = self.clock.now_utc();
                    retired = Some(DeadLetter { operation: current, error: err, failed_at });
                } else {
                    state.reinsert(current);
                }
            }
            Replayed::Dead(err) => {
                let failed_at = self.clock.now_utc();
                retired = Some(DeadLetter { operation: current, error: err, failed_at });
            }
        }
        if let Some(letter) = &retired {
            state.dead.push(letter.clone());
        }
        match self.persist(&state).await {
            Ok(()) => report.persist_error = None,
            Err(e) => {
                tracing::warn!(
                    target: "lifeline::queue",
                    %id,
                    error = %e,
                    "queue state not persisted"
                );
                report.persist_error = Some(e.to_string());
            }
        }

        if let Some(letter) = &retired {
            tracing::error!(
                target: "lifeline::queue",
                id = %letter.operation.id,
                retries = letter.operation.retry_count,
                error = %letter.error,
                "operation dead-lettered"
            );
            self.publish(QueueEvent::DeadLettered {
                operation_id: letter.operation.id.clone(),
                reason: letter.error.to_string(),
            });
        }
        retired
    }

    fn publish(&self, event: QueueEvent) {
        if let Some(bus) = &self.events {
            bus.publish(SyncEvent::Queue(event));
        }
    }
}

struct SyncFlag<'a>(&'a AtomicBool);

impl Drop for SyncFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::{ConflictKind, ConflictStrategy};
    use crate::error::RawError;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    /// Replies from a script, then echoes the payload back.
    #[derive(Debug, Default)]
    struct Scripted {
        replies: StdMutex<VecDeque<Result<Value, RawError>>>,
        calls: StdMutex<Vec<(String, Value)>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<Value, RawError>>) -> Arc<Self> {
            Arc::new(Self { replies: StdMutex::new(replies.into()), calls: StdMutex::default() })
        }

        fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn call(&self, operation: &str, params: Value) -> Result<Value, RawError> {
            self.calls.lock().unwrap().push((operation.to_string(), params.clone()));
            self.replies.lock().unwrap().pop_front().unwrap_or(Ok(params))
        }
    }

    async fn queue_with(
        transport: Arc<Scripted>,
        store: MemoryStore,
        strategy: ConflictStrategy,
        max_queue_size: usize,
    ) -> OfflineQueue {
        let config = QueueConfig { max_queue_size, max_retries: 2, namespace: "test".into() };
        OfflineQueue::open(
            config,
            ConflictResolver::new(strategy),
            Arc::new(store),
            transport,
            NetworkMonitor::new(true),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn rejects_when_full_and_keeps_order() {
        let q =
            queue_with(Scripted::new(vec![]), MemoryStore::new(), ConflictStrategy::Merge, 2).await;
        let a = q.enqueue(OperationKind::Create, "note", json!({"text": "a"})).await.unwrap();
        let b = q.enqueue(OperationKind::Create, "note", json!({"text": "b"})).await.unwrap();
        let err = q.enqueue(OperationKind::Create, "note", json!({"text": "c"})).await.unwrap_err();
        assert!(matches!(err, QueueError::QueueFull { max: 2 }));

        let ids: Vec<_> = q.pending().await.into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[tokio::test]
    async fn optimistic_ids_deduplicate() {
        let q = queue_with(
            Scripted::new(vec![]),
            MemoryStore::new(),
            ConflictStrategy::Merge,
            10,
        )
        .await;
        let first =
            q.enqueue_optimistic(OperationKind::Create, "note", json!({}), "tmp-1").await.unwrap();
        let again =
            q.enqueue_optimistic(OperationKind::Create, "note", json!({}), "tmp-1").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn enqueue_stamps_client_version() {
        let q = queue_with(
            Scripted::new(vec![]),
            MemoryStore::new(),
            ConflictStrategy::Merge,
            10,
        )
        .await;
        q.enqueue(OperationKind::Update, "user", json!({"id": "u1", "version": 3})).await.unwrap();
        q.enqueue(OperationKind::Create, "user", json!({"name": "x"})).await.unwrap();
        let versions: Vec<_> = q.pending().await.iter().map(|o| o.client_version).collect();
        assert_eq!(versions, vec![3, 0]);
    }

    #[tokio::test]
    async fn state_survives_reload() {
        let store = MemoryStore::new();
        let q = queue_with(Scripted::new(vec![]), store.clone(), ConflictStrategy::Merge, 10).await;
        let id = q.enqueue(OperationKind::Delete, "user", json!({"id": "u1"})).await.unwrap();

        let raw = store.get("test.queue").await.unwrap().unwrap();
        let persisted: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(persisted[0]["kind"], "delete");
        assert!(persisted[0]["enqueued_at"].as_str().unwrap().contains('T'));

        let reloaded = queue_with(Scripted::new(vec![]), store, ConflictStrategy::Merge, 10).await;
        assert_eq!(reloaded.pending().await[0].id, id);
        let next = reloaded.enqueue(OperationKind::Create, "user", json!({})).await.unwrap();
        let ops = reloaded.pending().await;
        assert_eq!(ops[1].id, next);
        assert!(ops[1].sequence > ops[0].sequence);
    }

    #[tokio::test]
    async fn sync_replays_in_order_and_is_idempotent() {
        let transport = Scripted::new(vec![]);
        let q =
            queue_with(transport.clone(), MemoryStore::new(), ConflictStrategy::Merge, 10).await;
        q.enqueue(OperationKind::Create, "note", json!({"text": "a"})).await.unwrap();
        q.enqueue(OperationKind::Update, "note", json!({"id": 1, "text": "b"})).await.unwrap();

        let report = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!((report.processed, report.succeeded, report.remaining), (2, 2, 0));
        let ops: Vec<_> = transport.calls().into_iter().map(|(op, _)| op).collect();
        assert_eq!(ops, vec!["note.create", "note.update"]);

        let again = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!(again.processed, 0);
    }

    #[tokio::test]
    async fn offline_sync_is_unavailable() {
        let q = queue_with(
            Scripted::new(vec![]),
            MemoryStore::new(),
            ConflictStrategy::Merge,
            10,
        )
        .await;
        q.network.set_online(false);
        assert_eq!(q.sync().await.unwrap(), SyncOutcome::Unavailable(SyncUnavailable::Offline));
    }

    #[tokio::test]
    async fn recoverable_failures_retry_then_dead_letter() {
        let transport = Scripted::new(vec![
            Err(RawError::status(503, "down")),
            Err(RawError::status(503, "down")),
            Err(RawError::status(503, "down")),
        ]);
        let q = queue_with(transport, MemoryStore::new(), ConflictStrategy::Merge, 10).await;
        let id = q.enqueue(OperationKind::Create, "note", json!({})).await.unwrap();

        for expected in 1..=2 {
            let report = q.sync().await.unwrap().report().cloned().unwrap();
            assert!(report.failed.is_empty());
            assert_eq!(q.pending().await[0].retry_count, expected);
        }
        let report = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].operation.id, id);
        assert!(q.is_empty().await);
        assert_eq!(q.dead_letters().await.len(), 1);

        q.requeue_dead_letter(&id).await.unwrap();
        assert_eq!(q.pending().await[0].retry_count, 0);
        q.sync().await.unwrap();
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn validation_failures_dead_letter_immediately() {
        let transport = Scripted::new(vec![Err(RawError::status(422, "bad payload"))]);
        let q = queue_with(transport, MemoryStore::new(), ConflictStrategy::Merge, 10).await;
        let id = q.enqueue(OperationKind::Create, "note", json!({})).await.unwrap();
        let report = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.failed[0].error.kind(), ErrorKind::Validation);

        let letter = q.discard_dead_letter(&id).await.unwrap();
        assert_eq!(letter.operation.id, id);
        assert!(q.dead_letters().await.is_empty());
        assert!(matches!(q.discard_dead_letter(&id).await, Err(QueueError::NotFound(_))));
    }

    #[tokio::test]
    async fn failed_entity_blocks_later_writes_for_that_entity() {
        let transport = Scripted::new(vec![Err(RawError::Timeout("slow".into()))]);
        let q =
            queue_with(transport.clone(), MemoryStore::new(), ConflictStrategy::Merge, 10).await;
        q.enqueue(OperationKind::Update, "user", json!({"id": "u1", "name": "a"})).await.unwrap();
        q.enqueue(OperationKind::Update, "user", json!({"id": "u1", "name": "b"})).await.unwrap();
        q.enqueue(OperationKind::Update, "user", json!({"id": "u2", "name": "c"})).await.unwrap();

        let report = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!((report.processed, report.skipped, report.succeeded), (2, 1, 1));
        let names: Vec<_> = q.pending().await.iter().map(|o| o.payload["name"].clone()).collect();
        assert_eq!(names, vec![json!("a"), json!("b")]);
    }

    #[tokio::test]
    async fn merge_conflict_resends_forced_payload() {
        let transport = Scripted::new(vec![
            Ok(json!({"id": "u1", "name": "Server", "email": "s@x", "version": 5})),
            Ok(json!({"ok": true})),
        ]);
        let q =
            queue_with(transport.clone(), MemoryStore::new(), ConflictStrategy::Merge, 10).await;
        let update = json!({"id": "u1", "name": "Client", "version": 3});
        q.enqueue(OperationKind::Update, "user", update).await.unwrap();

        let report = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.conflicts.len(), 1);
        let record = &report.conflicts[0];
        assert_eq!(record.kind, ConflictKind::VersionMismatch);
        assert_eq!(record.resolution, Resolution::Merged);
        assert_eq!(record.merged_payload.as_ref().unwrap()["version"], 6);

        let resent = &transport.calls()[1].1;
        assert_eq!(resent["force"], true);
        assert_eq!(resent["name"], "Client");
        assert!(q.is_empty().await);
    }

    #[tokio::test]
    async fn manual_conflicts_park_until_resolved() {
        let transport = Scripted::new(vec![Ok(json!({"id": "u1", "version": 9}))]);
        let q =
            queue_with(transport.clone(), MemoryStore::new(), ConflictStrategy::Manual, 1).await;
        let update = json!({"id": "u1", "name": "Client", "version": 3});
        let id = q.enqueue(OperationKind::Update, "user", update).await.unwrap();

        let report = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.conflicts[0].resolution, Resolution::ManualRequired);
        assert!(q.is_empty().await);
        assert_eq!(q.parked().await.len(), 1);

        // Parked operations still occupy the queue.
        assert!(matches!(
            q.enqueue(OperationKind::Create, "user", json!({})).await,
            Err(QueueError::QueueFull { .. })
        ));
        assert_eq!(q.sync().await.unwrap().report().unwrap().processed, 0);

        assert!(matches!(
            q.resolve_conflict(&id, Resolution::ManualRequired).await,
            Err(QueueError::InvalidResolution(_))
        ));
        q.resolve_conflict(&id, Resolution::ClientWins).await.unwrap();
        let op = &q.pending().await[0];
        assert_eq!(op.payload["version"], 9);
        assert_eq!(op.payload["force"], true);

        q.sync().await.unwrap();
        assert!(q.is_empty().await);
        assert!(q.parked().await.is_empty());
    }

    #[tokio::test]
    async fn server_wins_discards_the_write() {
        let transport = Scripted::new(vec![Ok(json!({"deleted": true}))]);
        let q = queue_with(
            transport.clone(),
            MemoryStore::new(),
            ConflictStrategy::ServerWins,
            10,
        )
        .await;
        q.enqueue(OperationKind::Update, "user", json!({"id": "u1", "version": 1})).await.unwrap();
        let report = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!(report.conflicts[0].kind, ConflictKind::Deleted);
        assert_eq!(report.conflicts[0].resolution, Resolution::ServerWins);
        assert!(q.is_empty().await);
        assert_eq!(transport.calls().len(), 1);
    }

    #[tokio::test]
    async fn requeue_refuses_a_second_copy_of_the_same_write() {
        let transport = Scripted::new(vec![Err(RawError::status(422, "bad payload"))]);
        let q = queue_with(transport, MemoryStore::new(), ConflictStrategy::Merge, 10).await;
        let first =
            q.enqueue_optimistic(OperationKind::Create, "note", json!({}), "tmp-1").await.unwrap();
        q.sync().await.unwrap();
        assert_eq!(q.dead_letters().await.len(), 1);

        let second =
            q.enqueue_optimistic(OperationKind::Create, "note", json!({}), "tmp-1").await.unwrap();
        assert_ne!(first, second);

        let err = q.requeue_dead_letter(&first).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::DuplicateWrite { ref existing, .. } if *existing == second
        ));
        let ids: Vec<_> = q.pending().await.into_iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![second]);
        assert_eq!(q.dead_letters().await[0].operation.id, first);
    }

    #[tokio::test]
    async fn unmergeable_version_keeps_the_conflict_parked() {
        let server = json!({"id": "u1", "name": "S", "version": u64::MAX});
        let transport = Scripted::new(vec![Ok(server)]);
        let q = queue_with(transport, MemoryStore::new(), ConflictStrategy::Manual, 10).await;
        let id = q
            .enqueue(OperationKind::Update, "user", json!({"id": "u1", "name": "C", "version": 3}))
            .await
            .unwrap();
        q.sync().await.unwrap();
        assert_eq!(q.parked().await.len(), 1);

        assert!(matches!(
            q.resolve_conflict(&id, Resolution::Merged).await,
            Err(QueueError::InvalidResolution(Resolution::Merged))
        ));
        assert_eq!(q.parked().await.len(), 1);
        assert!(q.is_empty().await);
    }

    #[derive(Debug, Default)]
    struct FlakyStore {
        inner: MemoryStore,
        failing: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl KeyValueStore for FlakyStore {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                let source = std::io::Error::other("disk full");
                return Err(StoreError::Io { key: key.to_string(), source });
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn store_failure_during_sync_still_reports() {
        let store = Arc::new(FlakyStore::default());
        let q = OfflineQueue::open(
            QueueConfig { namespace: "test".into(), ..QueueConfig::default() },
            ConflictResolver::new(ConflictStrategy::Merge),
            store.clone(),
            Scripted::new(vec![]),
            NetworkMonitor::new(true),
        )
        .await
        .unwrap();
        q.enqueue(OperationKind::Create, "note", json!({"text": "a"})).await.unwrap();
        q.enqueue(OperationKind::Create, "note", json!({"text": "b"})).await.unwrap();

        store.failing.store(true, Ordering::SeqCst);
        let report = q.sync().await.unwrap().report().cloned().unwrap();
        assert_eq!((report.processed, report.succeeded, report.remaining), (2, 2, 0));
        assert!(report.persist_error.as_deref().unwrap().contains("disk full"));
        assert!(q.is_empty().await);

        store.failing.store(false, Ordering::SeqCst);
        let id = q.enqueue(OperationKind::Create, "note", json!({"text": "c"})).await.unwrap();
        let raw = store.get("test.queue").await.unwrap().unwrap();
        let persisted: Vec<QueuedOperation> = serde_json::from_slice(&raw).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].id, id);
    }
}
