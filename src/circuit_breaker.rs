//! Keyed circuit breakers built on classified failures.
//!
//! One [`BreakerRecord`] exists per context key (usually one per backend dependency). Each record
//! moves Closed → Open → HalfOpen → {Closed | Open}:
//!
//! - **Closed**: calls pass through. Failures that [trip the breaker](ErrorKind::trips_breaker)
//!   count toward `failure_threshold`; a success resets the count, and so does a gap longer than
//!   `failure_window` between two failures.
//! - **Open**: calls are rejected with a `circuit_open` [`ClassifiedError`] without invoking the
//!   operation, until the cooldown elapses.
//! - **HalfOpen**: exactly one trial call is admitted. Success closes the breaker and resets its
//!   counters; failure re-opens it with the cooldown doubled, capped at `max_cooldown`.
//!
//! `validation` and `authorization` failures mean the dependency answered, so they count as health
//! for the breaker even though they are returned to the caller as errors.

use crate::backoff::Backoff;
use crate::classify::classify;
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ClassifiedError, ErrorContext, ErrorKind, RawError};
use crate::telemetry::{BreakerEvent, EventBus, SyncEvent};
use crate::transport::{Transport, TransportRequest};
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the cooldown elapses.
    Open,
    /// Probe mode admitting a single trial call.
    HalfOpen,
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerConfigError {
    #[error("failure_threshold must be > 0 (got {0})")]
    InvalidFailureThreshold(usize),
    #[error("cooldown must be > 0 (got {0:?})")]
    InvalidCooldown(Duration),
    #[error("max_cooldown ({max:?}) must be >= cooldown ({cooldown:?})")]
    MaxCooldownTooSmall { cooldown: Duration, max: Duration },
    #[error("failure_window must be > 0 when set")]
    InvalidFailureWindow,
}

/// Validated configuration shared by every key of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    failure_threshold: usize,
    failure_window: Option<Duration>,
    cooldown: Duration,
    max_cooldown: Duration,
}

impl BreakerConfig {
    pub fn new(
        failure_threshold: usize,
        failure_window: Option<Duration>,
        cooldown: Duration,
        max_cooldown: Duration,
    ) -> Result<Self, BreakerConfigError> {
        if failure_threshold == 0 {
            return Err(BreakerConfigError::InvalidFailureThreshold(failure_threshold));
        }
        if cooldown.is_zero() {
            return Err(BreakerConfigError::InvalidCooldown(cooldown));
        }
        if max_cooldown < cooldown {
            return Err(BreakerConfigError::MaxCooldownTooSmall { cooldown, max: max_cooldown });
        }
        if failure_window.is_some_and(|w| w.is_zero()) {
            return Err(BreakerConfigError::InvalidFailureWindow);
        }
        Ok(Self { failure_threshold, failure_window, cooldown, max_cooldown })
    }

    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    pub fn failure_window(&self) -> Option<Duration> {
        self.failure_window
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    pub fn max_cooldown(&self) -> Duration {
        self.max_cooldown
    }

    /// Cooldown for the `streak`-th consecutive open (1 = first open).
    fn cooldown_for(&self, streak: usize) -> Duration {
        Backoff::Exponential { base: self.cooldown, max: Some(self.max_cooldown) }.delay(streak)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Some(Duration::from_secs(60)),
            cooldown: Duration::from_secs(30),
            max_cooldown: Duration::from_secs(300),
        }
    }
}

/// Per-key breaker state. Only the breaker mutates it; callers get snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub consecutive_failures: usize,
    /// Clock millis of the last tripping failure.
    pub last_failure_time: Option<u64>,
    /// Clock millis of the last state change (or creation).
    pub last_state_change: u64,
    open_streak: usize,
    cooldown: Duration,
    trial_in_flight: bool,
}

impl BreakerRecord {
    fn new(now: u64) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_time: None,
            last_state_change: now,
            open_streak: 0,
            cooldown: Duration::ZERO,
            trial_in_flight: false,
        }
    }

    /// Cooldown applied to the current (or most recent) open period.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

/// A state change on one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerTransition {
    pub key: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub consecutive_failures: usize,
    pub at_millis: u64,
}

/// Synchronous subscriber to breaker transitions.
pub trait BreakerObserver: Send + Sync {
    fn on_transition(&self, transition: &BreakerTransition);
}

impl<F> BreakerObserver for F
where
    F: Fn(&BreakerTransition) + Send + Sync,
{
    fn on_transition(&self, transition: &BreakerTransition) {
        self(transition)
    }
}

/// Errors from breaker inspection/control.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BreakerRegistryError {
    #[error("circuit breaker '{0}' not found")]
    NotFound(String),
}

enum Outcome {
    Healthy,
    Failed,
    Ignored,
}

type Records = Arc<Mutex<HashMap<String, BreakerRecord>>>;

/// Circuit breaker registry guarding async operations per context key.
///
/// Clones share the same records and observers.
#[derive(Clone)]
pub struct CircuitBreaker {
    records: Records,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    observers: Arc<Mutex<Vec<Arc<dyn BreakerObserver>>>>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("clock", &self.clock)
            .field("observers", &"<observers>")
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            config,
            clock: Arc::new(MonotonicClock::default()),
            observers: Arc::new(Mutex::new(Vec::new())),
            events: None,
        }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish transitions to `bus`.
    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Register an observer notified synchronously on every transition of every key.
    pub fn subscribe(&self, observer: Arc<dyn BreakerObserver>) {
        lock(&self.observers).push(observer);
    }

    /// Current state for `key`; unknown keys are Closed.
    pub fn state(&self, key: &str) -> CircuitState {
        lock(&self.records).get(key).map_or(CircuitState::Closed, |r| r.state)
    }

    pub fn record(&self, key: &str) -> Option<BreakerRecord> {
        lock(&self.records).get(key).cloned()
    }

    /// All records sorted by key.
    pub fn snapshot(&self) -> Vec<(String, BreakerRecord)> {
        let mut entries: Vec<_> =
            lock(&self.records).iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Keys whose breaker is currently Open or HalfOpen.
    pub fn unhealthy_keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = lock(&self.records)
            .iter()
            .filter(|(_, r)| r.state != CircuitState::Closed)
            .map(|(k, _)| k.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Administrative reset to Closed, clearing counters.
    pub fn reset(&self, key: &str) -> Result<(), BreakerRegistryError> {
        let now = self.clock.now_millis();
        let transition = {
            let mut records = lock(&self.records);
            let record =
                records.get_mut(key).ok_or_else(|| BreakerRegistryError::NotFound(key.into()))?;
            let from = record.state;
            *record = BreakerRecord::new(now);
            (from != CircuitState::Closed).then(|| BreakerTransition {
                key: key.to_string(),
                from,
                to: CircuitState::Closed,
                consecutive_failures: 0,
                at_millis: now,
            })
        };
        if let Some(t) = transition {
            tracing::info!(
                target: "lifeline::circuit_breaker",
                key,
                "circuit breaker reset → closed"
            );
            self.notify(&t);
        }
        Ok(())
    }

    /// Run `operation` under the breaker for `key`.
    ///
    /// Fails fast with `circuit_open` while the breaker is Open (or HalfOpen with the trial in
    /// flight). Otherwise runs the operation, classifies any failure, updates the record, and
    /// returns the classified error.
    pub async fn execute<T, E, Fut, Op>(
        &self,
        key: &str,
        operation: Op,
    ) -> Result<T, ClassifiedError>
    where
        E: Into<RawError>,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let trial = self.admit(key)?;
        let mut guard = TrialGuard { records: &self.records, key, armed: trial };

        let result = operation().await;
        guard.armed = false;

        match result {
            Ok(value) => {
                self.complete(key, trial, Outcome::Healthy);
                Ok(value)
            }
            Err(err) => {
                let context = ErrorContext::default().with_context_key(key);
                let classified = classify(&err.into(), Some(&context));
                let outcome = if classified.kind().trips_breaker() {
                    Outcome::Failed
                } else if classified.kind() == ErrorKind::CircuitOpen {
                    Outcome::Ignored
                } else {
                    Outcome::Healthy
                };
                self.complete(key, trial, outcome);
                Err(classified)
            }
        }
    }

    /// Decide whether a call may proceed. Returns `true` when the call is the half-open trial.
    fn admit(&self, key: &str) -> Result<bool, ClassifiedError> {
        let now = self.clock.now_millis();
        let mut transition = None;
        let admitted = {
            let mut records = lock(&self.records);
            let record = records.entry(key.to_string()).or_insert_with(|| BreakerRecord::new(now));
            match record.state {
                CircuitState::Closed => Ok(false),
                CircuitState::Open => {
                    let elapsed =
                        Duration::from_millis(now.saturating_sub(record.last_state_change));
                    if elapsed >= record.cooldown {
                        record.state = CircuitState::HalfOpen;
                        record.last_state_change = now;
                        record.trial_in_flight = true;
                        transition = Some(BreakerTransition {
                            key: key.to_string(),
                            from: CircuitState::Open,
                            to: CircuitState::HalfOpen,
                            consecutive_failures: record.consecutive_failures,
                            at_millis: now,
                        });
                        Ok(true)
                    } else {
                        Err(ClassifiedError::circuit_open(key, record.cooldown - elapsed))
                    }
                }
                CircuitState::HalfOpen if record.trial_in_flight => {
                    Err(ClassifiedError::circuit_open(key, Duration::ZERO))
                }
                CircuitState::HalfOpen => {
                    record.trial_in_flight = true;
                    Ok(true)
                }
            }
        };
        if let Some(t) = transition {
            tracing::info!(target: "lifeline::circuit_breaker", key, "circuit breaker → half-open");
            self.notify(&t);
        }
        if admitted.is_err() {
            tracing::debug!(
                target: "lifeline::circuit_breaker",
                key,
                "call rejected: circuit open"
            );
        }
        admitted
    }

    fn complete(&self, key: &str, trial: bool, outcome: Outcome) {
        let now = self.clock.now_millis();
        let transition = {
            let mut records = lock(&self.records);
            let record = records.entry(key.to_string()).or_insert_with(|| BreakerRecord::new(now));
            if trial {
                record.trial_in_flight = false;
            }
            let from = record.state;
            match (record.state, outcome) {
                (_, Outcome::Ignored) => {}
                // Only the trial decides a half-open breaker, not stragglers admitted while Closed.
                (CircuitState::HalfOpen, _) if !trial => {}
                (CircuitState::HalfOpen, Outcome::Healthy) => {
                    *record = BreakerRecord::new(now);
                }
                (CircuitState::HalfOpen, Outcome::Failed) => {
                    record.consecutive_failures += 1;
                    record.last_failure_time = Some(now);
                    record.open_streak += 1;
                    record.cooldown = self.config.cooldown_for(record.open_streak);
                    record.state = CircuitState::Open;
                    record.last_state_change = now;
                }
                (CircuitState::Closed, Outcome::Healthy) => record.consecutive_failures = 0,
                (CircuitState::Closed, Outcome::Failed) => {
                    let last_failure = record.last_failure_time;
                    let window_lapsed = match (self.config.failure_window, last_failure) {
                        (Some(window), Some(last)) => {
                            Duration::from_millis(now.saturating_sub(last)) > window
                        }
                        _ => false,
                    };
                    record.consecutive_failures =
                        if window_lapsed { 1 } else { record.consecutive_failures + 1 };
                    record.last_failure_time = Some(now);
                    if record.consecutive_failures >= self.config.failure_threshold {
                        record.open_streak = 1;
                        record.cooldown = self.config.cooldown_for(1);
                        record.state = CircuitState::Open;
                        record.last_state_change = now;
                    }
                }
                (CircuitState::Open, Outcome::Failed) => {
                    record.consecutive_failures += 1;
                    record.last_failure_time = Some(now);
                }
                (CircuitState::Open, Outcome::Healthy) => {}
            }
            (record.state != from).then(|| BreakerTransition {
                key: key.to_string(),
                from,
                to: record.state,
                consecutive_failures: record.consecutive_failures,
                at_millis: now,
            })
        };

        if let Some(t) = transition {
            match (t.from, t.to) {
                (CircuitState::HalfOpen, CircuitState::Closed) => tracing::info!(
                    target: "lifeline::circuit_breaker",
                    key,
                    "circuit breaker → closed"
                ),
                (CircuitState::HalfOpen, CircuitState::Open) => tracing::warn!(
                    target: "lifeline::circuit_breaker",
                    key,
                    failures = t.consecutive_failures,
                    "circuit breaker trial failed → open"
                ),
                _ => tracing::error!(
                    target: "lifeline::circuit_breaker",
                    key,
                    failures = t.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    "circuit breaker → open"
                ),
            }
            self.notify(&t);
        }
    }

    fn notify(&self, transition: &BreakerTransition) {
        if let Some(bus) = &self.events {
            bus.publish(SyncEvent::Breaker(BreakerEvent {
                key: transition.key.clone(),
                from: transition.from,
                to: transition.to,
                consecutive_failures: transition.consecutive_failures,
            }));
        }
        let observers: Vec<_> = lock(&self.observers).clone();
        for observer in observers {
            observer.on_transition(transition);
        }
    }
}

/// Releases the half-open trial slot if the trial future is dropped or panics mid-flight.
struct TrialGuard<'a> {
    records: &'a Records,
    key: &'a str,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(record) = lock(self.records).get_mut(self.key) {
                record.trial_in_flight = false;
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How a breaker-wrapped transport picks the context key for a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyStrategy {
    /// Every call shares one breaker (one backend dependency).
    Fixed(String),
    /// One breaker per operation name.
    PerOperation,
}

impl KeyStrategy {
    fn key_for<'a>(&'a self, operation: &'a str) -> &'a str {
        match self {
            KeyStrategy::Fixed(key) => key,
            KeyStrategy::PerOperation => operation,
        }
    }
}

/// A [`Transport`] whose calls pass through a [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct BreakerTransport {
    breaker: CircuitBreaker,
    inner: Arc<dyn Transport>,
    keys: KeyStrategy,
}

impl BreakerTransport {
    pub fn new(breaker: CircuitBreaker, inner: Arc<dyn Transport>, keys: KeyStrategy) -> Self {
        Self { breaker, inner, keys }
    }
}

#[async_trait]
impl Transport for BreakerTransport {
    async fn call(&self, operation: &str, params: Value) -> Result<Value, RawError> {
        let key = self.keys.key_for(operation);
        self.breaker
            .execute(key, || self.inner.call(operation, params))
            .await
            .map_err(RawError::Classified)
    }

    async fn call_batch(

        &self,

        operation: &str,

        params: Vec<Value>,

    ) -> Result<Vec<Value>, RawError> {
        let key = self.keys.key_for(operation);
        self.breaker
            .execute(key, || self.inner.call_batch(operation, params))
            .await
            .map_err(RawError::Classified)
    }
}

/// Tower layer placing a [`CircuitBreaker`] in front of a transport service.
#[derive(Debug, Clone)]
pub struct BreakerLayer {
    breaker: CircuitBreaker,
    keys: KeyStrategy,
}

impl BreakerLayer {
    pub fn new(breaker: CircuitBreaker, keys: KeyStrategy) -> Self {
        Self { breaker, keys }
    }
}

impl<S> Layer<S> for BreakerLayer {
    type Service = BreakerService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        BreakerService { inner, breaker: self.breaker.clone(), keys: self.keys.clone() }
    }
}

/// Service produced by [`BreakerLayer`].
#[derive(Debug, Clone)]
pub struct BreakerService<S> {
    inner: S,
    breaker: CircuitBreaker,
    keys: KeyStrategy,
}

impl<S> Service<TransportRequest> for BreakerService<S>
where
    S: Service<TransportRequest, Response = Value> + Clone + Send + 'static,
    S::Error: Into<RawError>,
    S::Future: Send + 'static,
{
    type Response = Value;
    type Error = ClassifiedError;
    type Future = BoxFuture<'static, Result<Value, ClassifiedError>>;

    fn poll_ready(
        &mut self,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(|e| classify(&e.into(), None))
    }

    fn call(&mut self, req: TransportRequest) -> Self::Future {
        // Take the service that was driven to readiness; leave a fresh clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let breaker = self.breaker.clone();
        let key = self.keys.key_for(&req.operation).to_string();
        Box::pin(async move { breaker.execute(&key, move || inner.call(req)).await })
    }
}
