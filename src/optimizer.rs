//! Request deduplication and batching in front of the transport.
//!
//! Deduplication: requests are keyed by operation name plus the canonical JSON of their params
//! (`serde_json` maps are sorted). A request arriving while an identical one is in flight joins
//! it and observes the same result. The shared call runs on its own task, so callers that stop
//! waiting never cancel it.
//!
//! Batching: operations configured as batchable collect in a per-operation queue and are sent
//! through [`Transport::call_batch`] when the queue reaches `max_batch_size` or when `window`
//! elapses after the first request, whichever comes first. Within a batch, requests are ordered
//! by priority (high, medium, low), then by arrival. A failed batch fails every request in it
//! with the same classified error.

use crate::classify::classify;
use crate::error::{ClassifiedError, ErrorContext, ErrorKind};
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::telemetry::{EventBus, FlushReason, OptimizerEvent, SyncEvent};
use crate::transport::Transport;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub window: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self { max_batch_size: 10, window: Duration::from_millis(50) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptimizerConfig {
    pub deduplicate: bool,
    /// Batchable operation names and their limits.
    pub batching: HashMap<String, BatchConfig>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self { deduplicate: true, batching: HashMap::new() }
    }
}

impl OptimizerConfig {
    pub fn batch(mut self, operation: impl Into<String>, config: BatchConfig) -> Self {
        self.batching.insert(operation.into(), config);
        self
    }
}

type CallResult = Result<Value, ClassifiedError>;
type SharedCall = Shared<BoxFuture<'static, CallResult>>;

struct BatchEntry {
    priority: Priority,
    arrival: u64,
    params: Value,
    reply: oneshot::Sender<CallResult>,
}

#[derive(Default)]
struct PendingBatch {
    entries: Vec<BatchEntry>,
    /// Bumped on every flush so a stale window timer leaves the next batch alone.
    epoch: u64,
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: OptimizerConfig,
    sleeper: Arc<dyn Sleeper>,
    events: Option<EventBus>,
    in_flight: Mutex<HashMap<String, (u64, SharedCall)>>,
    batches: Mutex<HashMap<String, PendingBatch>>,
    next_id: AtomicU64,
}

/// Deduplicating, batching front door to a [`Transport`]. Clones share state.
#[derive(Clone)]
pub struct RequestOptimizer {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RequestOptimizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptimizer")
            .field("config", &self.inner.config)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl RequestOptimizer {
    pub fn new(transport: Arc<dyn Transport>, config: OptimizerConfig) -> Self {
        Self::build(transport, config, Arc::new(TokioSleeper), None)
    }

    pub(crate) fn build(
        transport: Arc<dyn Transport>,
        config: OptimizerConfig,
        sleeper: Arc<dyn Sleeper>,
        events: Option<EventBus>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                sleeper,
                events,
                in_flight: Mutex::new(HashMap::new()),
                batches: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Use `sleeper` for batch windows.
    pub fn with_sleeper<S: Sleeper + 'static>(self, sleeper: S) -> Self {
        let inner = &self.inner;
        Self::build(
            inner.transport.clone(),
            inner.config.clone(),
            Arc::new(sleeper),
            inner.events.clone(),
        )
    }

    pub fn with_events(self, bus: EventBus) -> Self {
        let inner = &self.inner;
        Self::build(inner.transport.clone(), inner.config.clone(), inner.sleeper.clone(), Some(bus))
    }

    /// Number of distinct calls currently in flight.
    pub fn in_flight(&self) -> usize {
        lock(&self.inner.in_flight).len()
    }

    /// Requests waiting in `operation`'s batch queue.
    pub fn pending(&self, operation: &str) -> usize {
        lock(&self.inner.batches).get(operation).map_or(0, |b| b.entries.len())
    }

    /// Issue `operation`, sharing an identical in-flight call and batching when configured.
    pub async fn optimize(&self, operation: &str, params: Value, priority: Priority) -> CallResult {
        if !self.inner.config.deduplicate {
            return self.dispatch(operation, params, priority).await;
        }

        let key = dedup_key(operation, &params);
        let shared = {
            let mut in_flight = lock(&self.inner.in_flight);
            if let Some((_, call)) = in_flight.get(&key) {
                tracing::debug!(
                    target: "lifeline::optimizer",
                    operation,
                    "joined in-flight request"
                );
                self.publish(OptimizerEvent::Deduplicated { operation: operation.to_string() });
                call.clone()
            } else {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                let call = self.dispatch(operation, params, priority);
                let inner = self.inner.clone();
                let done_key = key.clone();
                let handle = tokio::spawn(async move {
                    let result = call.await;
                    let mut in_flight = lock(&inner.in_flight);
                    if in_flight.get(&done_key).is_some_and(|(owner, _)| *owner == id) {
                        in_flight.remove(&done_key);
                    }
                    result
                });
                let shared = async move {
                    handle.await.unwrap_or_else(|e| {
                        let message = e.to_string();
                        Err(ClassifiedError::new(ErrorKind::Service, "TASK_FAILED", message, false))
                    })
                }
                .boxed()
                .shared();
                in_flight.insert(key, (id, shared.clone()));
                shared
            }
        };
        shared.await
    }

    /// [`optimize`](Self::optimize) and decode the result.
    pub async fn optimize_as<T: DeserializeOwned>(
        &self,
        operation: &str,
        params: Value,
        priority: Priority,
    ) -> Result<T, ClassifiedError> {
        let value = self.optimize(operation, params, priority).await?;
        serde_json::from_value(value).map_err(|e| {
            ClassifiedError::new(ErrorKind::Validation, "MALFORMED", e.to_string(), false)
                .with_detail("operation", operation)
        })
    }

    fn dispatch(
        &self,
        operation: &str,
        params: Value,
        priority: Priority,
    ) -> BoxFuture<'static, CallResult> {
        if let Some(batch) = self.inner.config.batching.get(operation).copied() {
            let reply = self.enqueue_batched(operation, params, priority, batch);
            return async move {
                reply.await.unwrap_or_else(|_| {
                    let message = "batch was dropped";
                    Err(ClassifiedError::new(ErrorKind::Service, "BATCH_DROPPED", message, true))
                })
            }
            .boxed();
        }

        let transport = self.inner.transport.clone();
        let operation = operation.to_string();
        async move {
            transport
                .call(&operation, params)
                .await
                .map_err(|raw| classify(&raw, Some(&ErrorContext::operation(operation.clone()))))
        }
        .boxed()
    }

    fn enqueue_batched(
        &self,
        operation: &str,
        params: Value,
        priority: Priority,
        config: BatchConfig,
    ) -> oneshot::Receiver<CallResult> {
        let (reply, receiver) = oneshot::channel();
        let arrival = self.inner.next_id.fetch_add(1, Ordering::Relaxed);

        let mut batches = lock(&self.inner.batches);
        let batch = batches.entry(operation.to_string()).or_default();
        batch.entries.push(BatchEntry { priority, arrival, params, reply });

        if batch.entries.len() >= config.max_batch_size {
            let entries = std::mem::take(&mut batch.entries);
            batch.epoch += 1;
            drop(batches);
            self.spawn_flush(operation.to_string(), entries, FlushReason::Size);
        } else if batch.entries.len() == 1 {
            let epoch = batch.epoch;
            drop(batches);
            let this = self.clone();
            let operation = operation.to_string();
            tokio::spawn(async move {
                this.inner.sleeper.sleep(config.window).await;
                let entries = {
                    let mut batches = lock(&this.inner.batches);
                    match batches.get_mut(&operation) {
                        Some(batch) if batch.epoch == epoch && !batch.entries.is_empty() => {
                            batch.epoch += 1;
                            std::mem::take(&mut batch.entries)
                        }
                        _ => return,
                    }
                };
                this.flush(operation, entries, FlushReason::Window).await;
            });
        }
        receiver
    }

    fn spawn_flush(&self, operation: String, entries: Vec<BatchEntry>, reason: FlushReason) {
        let this = self.clone();
        tokio::spawn(async move { this.flush(operation, entries, reason).await });
    }

    async fn flush(&self, operation: String, mut entries: Vec<BatchEntry>, reason: FlushReason) {
        entries.sort_by_key(|e| (Reverse(e.priority), e.arrival));
        let size = entries.len();
        let (params, replies): (Vec<_>, Vec<_>) =
            entries.into_iter().map(|e| (e.params, e.reply)).unzip();

        tracing::debug!(target: "lifeline::optimizer", %operation, size, ?reason, "flushing batch");
        self.publish(OptimizerEvent::BatchFlushed { operation: operation.clone(), size, reason });

        let context = ErrorContext::operation(operation.clone());
        let outcome = match self.inner.transport.call_batch(&operation, params).await {
            Ok(results) if results.len() == size => Ok(results),
            Ok(results) => Err(ClassifiedError::new(
                ErrorKind::Validation,
                "BATCH_SIZE_MISMATCH",
                format!("batch of {size} returned {} results", results.len()),
                false,
            )),
            Err(raw) => Err(classify(&raw, Some(&context))),
        };

        match outcome {
            Ok(results) => {
                for (reply, result) in replies.into_iter().zip(results) {
                    let _ = reply.send(Ok(result));
                }
            }
            Err(err) => {
                tracing::warn!(
                    target: "lifeline::optimizer",
                    %operation,
                    size,
                    kind = %err.kind(),
                    "batch failed"
                );
                for reply in replies {
                    let _ = reply.send(Err(err.clone()));
                }
            }
        }
    }

    fn publish(&self, event: OptimizerEvent) {
        if let Some(bus) = &self.inner.events {
            bus.publish(SyncEvent::Optimizer(event));
        }
    }
}

/// Operation name plus canonical params.
pub fn dedup_key(operation: &str, params: &Value) -> String {
    format!("{operation}:{params}")
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
