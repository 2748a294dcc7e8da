//! One-stop facade wiring every component together.
//!
//! [`ResilientClient`] owns one instance of each state machine and routes calls through them:
//!
//! ```text
//! read  ──► DegradationManager ──► RequestOptimizer ──► BreakerTransport ──► Transport
//! write ──► RetryManager ─────────────────────────────► BreakerTransport ──► Transport
//!              └─ connectivity failure / offline ──► OfflineQueue
//! ```
//!
//! Breaker transitions feed the degradation manager, the network monitor feeds both the
//! degradation manager and the queue, and every component publishes into one [`EventBus`].

use crate::circuit_breaker::{BreakerTransport, CircuitBreaker};
use crate::classify::classify;
use crate::clock::{Clock, MonotonicClock};
use crate::config::{ConfigError, LifelineConfig};
use crate::degradation::{DegradationManager, FetchRequest, FetchSource, Fetched, Mode};
use crate::error::{ClassifiedError, ErrorContext};
use crate::network::NetworkMonitor;
use crate::optimizer::{Priority, RequestOptimizer};
use crate::poll::{PollStream, Poller};
use crate::queue::{OfflineQueue, OperationKind, QueueError, SyncOutcome};
use crate::retry::RetryManager;
use crate::sleeper::{Sleeper, TokioSleeper};
use crate::store::{KeyValueStore, MemoryStore};
use crate::telemetry::EventBus;
use crate::transport::Transport;
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    /// A live write failed in a way queuing cannot fix (validation, authorization).
    #[error("write rejected: {0}")]
    Rejected(ClassifiedError),
}

/// What happened to a write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The server accepted the write; holds its response.
    Applied(Value),
    /// The write was queued for replay; holds the queued operation id.
    Queued(String),
}

/// Builder for [`ResilientClient`].
pub struct ClientBuilder {
    transport: Arc<dyn Transport>,
    config: LifelineConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    network: NetworkMonitor,
    event_capacity: usize,
}

impl ClientBuilder {
    pub fn config(mut self, config: LifelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Persistence for the offline queue. Defaults to an in-memory store.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sleeper for retry backoff, batch windows and polling.
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Share an existing network signal instead of creating one that starts online.
    pub fn network(mut self, network: NetworkMonitor) -> Self {
        self.network = network;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Validate the config, load persisted queue state and wire the components.
    pub async fn build(self) -> Result<ResilientClient, ClientError> {
        let config = self.config;
        config.validate()?;

        let events = EventBus::new(self.event_capacity);
        let degradation = Arc::new(
            DegradationManager::with_clock(config.degradation_config()?, self.clock.clone())
                .with_events(events.clone()),
        );
        degradation.set_network(self.network.is_online());

        let breaker = CircuitBreaker::new(config.breaker_config()?)
            .with_clock(self.clock.clone())
            .with_events(events.clone());
        breaker.subscribe(degradation.clone());

        let keys = config.breaker_keys();
        let guarded: Arc<dyn Transport> =
            Arc::new(BreakerTransport::new(breaker.clone(), self.transport, keys.clone()));

        let optimizer = RequestOptimizer::build(
            guarded.clone(),
            config.optimizer_config()?,
            self.sleeper.clone(),
            Some(events.clone()),
        );
        let retry = config.retry_manager(self.sleeper.clone())?;

        let store = self.store.unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let queue = OfflineQueue::open(
            config.queue_config()?,
            config.conflict_resolver()?,
            store,
            guarded.clone(),
            self.network.clone(),
        )
        .await?
        .with_clock(self.clock)
        .with_events(events.clone());

        tracing::info!(
            target: "lifeline::client",
            online = self.network.is_online(),
            keys = ?keys,
            "resilient client ready"
        );

        Ok(ResilientClient {
            config,
            events,
            network: self.network,
            breaker,
            degradation,
            queue: Arc::new(queue),
            optimizer,
            retry,
            transport: guarded,
            sleeper: self.sleeper,
        })
    }
}

/// Facade over the synchronization core. See the module docs for the call paths.
#[derive(Debug)]
pub struct ResilientClient {
    config: LifelineConfig,
    events: EventBus,
    network: NetworkMonitor,
    breaker: CircuitBreaker,
    degradation: Arc<DegradationManager>,
    queue: Arc<OfflineQueue>,
    optimizer: RequestOptimizer,
    retry: RetryManager,
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
}

impl ResilientClient {
    pub fn builder(transport: Arc<dyn Transport>) -> ClientBuilder {
        ClientBuilder {
            transport,
            config: LifelineConfig::default(),
            store: None,
            clock: Arc::new(MonotonicClock::default()),
            sleeper: Arc::new(TokioSleeper),
            network: NetworkMonitor::default(),
            event_capacity: 256,
        }
    }

    pub fn config(&self) -> &LifelineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn degradation(&self) -> &DegradationManager {
        &self.degradation
    }

    pub fn queue(&self) -> &OfflineQueue {
        &self.queue
    }

    pub fn optimizer(&self) -> &RequestOptimizer {
        &self.optimizer
    }

    pub fn mode(&self) -> Mode {
        self.degradation.mode()
    }

    /// Read `operation` through the degradation policy and the optimizer. Never fails.
    pub async fn read(
        &self,
        request: &FetchRequest,
        operation: &str,
        params: Value,
        priority: Priority,
    ) -> Fetched {
        let optimizer = &self.optimizer;
        let live = || async move { optimizer.optimize(operation, params, priority).await };
        self.degradation.fetch(request, live).await
    }

    /// Apply a write live, or queue it when the backend is unreachable.
    ///
    /// While offline the write is queued without a live attempt. Online, the write is retried
    /// for recoverable failures; if it still fails on connectivity it is queued. Any other
    /// failure is returned as [`ClientError::Rejected`].
    pub async fn write(
        &self,
        kind: OperationKind,
        entity_type: &str,
        payload: Value,
    ) -> Result<WriteOutcome, ClientError> {
        if !self.network.is_online() || self.degradation.mode() == Mode::Offline {
            let id = self.queue.enqueue(kind, entity_type, payload).await?;
            return Ok(WriteOutcome::Queued(id));
        }

        let operation = format!("{entity_type}.{}", kind.as_str());
        let context = ErrorContext::operation(operation.clone());
        let transport = &self.transport;
        let attempt = self
            .retry
            .execute(|| {
                let payload = payload.clone();
                let operation = operation.as_str();
                let context = &context;
                async move {
                    transport
                        .call(operation, payload)
                        .await
                        .map_err(|err| classify(&err, Some(context)))
                }
            })
            .await;

        match attempt {
            Ok(value) => Ok(WriteOutcome::Applied(value)),
            Err(err) if err.kind().is_connectivity() => {
                self.degradation.record_failure(&err);
                tracing::info!(
                    target: "lifeline::client",
                    operation = %operation,
                    kind = %err.kind(),
                    "write failed live; queued for replay"
                );
                let id = self.queue.enqueue(kind, entity_type, payload).await?;
                Ok(WriteOutcome::Queued(id))
            }
            Err(err) => {
                tracing::warn!(
                    target: "lifeline::client",
                    operation = %operation,
                    kind = %err.kind(),
                    code = err.code(),
                    "write rejected"
                );
                Err(ClientError::Rejected(err))
            }
        }
    }

    /// Replay the offline queue.
    pub async fn sync(&self) -> Result<SyncOutcome, QueueError> {
        self.queue.sync().await
    }

    /// Update network presence. Coming back online syncs the queue when `sync_on_reconnect` is
    /// set; the sync outcome is returned in that case.
    pub async fn set_online(&self, online: bool) -> Result<Option<SyncOutcome>, QueueError> {
        let changed = self.network.set_online(online);
        self.degradation.set_network(online);
        if changed && online && self.config.client.sync_on_reconnect {
            return self.queue.sync().await.map(Some);
        }
        Ok(None)
    }

    /// Call the health operation and leave degraded mode if it succeeds.
    pub async fn check_health(&self) -> bool {
        let transport = &self.transport;
        let operation = self.config.client.health_operation.as_str();
        let probe = || async move { transport.call(operation, Value::Null).await.map(|_| ()) };
        self.degradation.probe_recovery(probe).await
    }

    /// Follow network changes made through any clone of [`network`](Self::network).
    ///
    /// Each change is forwarded to the degradation manager; reconnects sync the queue when
    /// `sync_on_reconnect` is set. The task ends when aborted or when the signal is dropped.
    pub fn spawn_network_listener(&self) -> JoinHandle<()> {
        let mut rx = self.network.subscribe();
        let degradation = self.degradation.clone();
        let queue = self.queue.clone();
        let sync_on_reconnect = self.config.client.sync_on_reconnect;
        tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                degradation.set_network(online);
                if online && sync_on_reconnect {
                    match queue.sync().await {
                        Ok(outcome) => tracing::debug!(
                            target: "lifeline::client",
                            ?outcome,
                            "reconnect sync finished"
                        ),
                        Err(err) => tracing::error!(
                            target: "lifeline::client",
                            error = %err,
                            "reconnect sync failed"
                        ),
                    }
                }
            }
        })
    }

    /// Poll a read every `poll_interval_ms`, yielding only changed values.
    ///
    /// Fallback results are not emitted, so an outage does not replace the last good value.
    pub fn watch(
        &self,
        request: FetchRequest,
        operation: impl Into<String>,
        params: Value,
    ) -> PollStream {
        let degradation = self.degradation.clone();
        let optimizer = self.optimizer.clone();
        let operation = operation.into();
        Poller::new(self.config.poll_interval()).with_sleeper(self.sleeper.clone()).spawn(move || {
            let degradation = degradation.clone();
            let optimizer = optimizer.clone();
            let request = request.clone();
            let operation = operation.clone();
            let params = params.clone();
            async move {
                let live =
                    || async move { optimizer.optimize(&operation, params, Priority::Low).await };
                let fetched = degradation.fetch(&request, live).await;
                match fetched.source {
                    FetchSource::Fallback => None,
                    _ => Some(fetched.value),
                }
            }
        })
    }
}
