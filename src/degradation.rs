//! Degradation manager: decides, for each read, between a live call, the cache, and a fallback.
//!
//! Modes:
//! - **Normal**: live calls; successful results refresh the cache.
//! - **Degraded**: serve the cache when present (fresh or stale), else try one live call.
//! - **Offline**: never call live; cache or fallback only.
//! - **Minimal**: the cache is considered unusable; serve the per-entity fallback.
//!
//! Transitions are driven by explicit signals only. A required dependency's breaker opening or a
//! connectivity failure moves Normal to Degraded; the network signal going down moves any mode to
//! Offline, and coming back moves Offline to Degraded. Minimal is entered by escalation (explicit,
//! or after staying Degraded past `minimal_after`). Normal is only re-entered through
//! [`DegradationManager::record_recovery`] (or a successful probe), and never while a required
//! dependency's breaker is open.

use crate::cache::{CacheConfig, Staleness, TtlCache};
use crate::circuit_breaker::{BreakerObserver, BreakerTransition, CircuitState};
use crate::classify::classify;
use crate::clock::{Clock, MonotonicClock};
use crate::error::{ClassifiedError, ErrorContext, RawError};
use crate::telemetry::{DegradationEvent, EventBus, SyncEvent};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Coarse operating posture governing read behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Normal,
    Degraded,
    Offline,
    Minimal,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Degraded => "degraded",
            Mode::Offline => "offline",
            Mode::Minimal => "minimal",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A user-visible capability and what it needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub name: String,
    /// Breaker context keys the feature calls.
    pub dependencies: Vec<String>,
    pub offline_capable: bool,
    pub essential: bool,
}

impl Feature {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            offline_capable: false,
            essential: false,
        }
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.dependencies.push(key.into());
        self
    }

    pub fn offline_capable(mut self) -> Self {
        self.offline_capable = true;
        self
    }

    pub fn essential(mut self) -> Self {
        self.essential = true;
        self
    }
}

/// Snapshot of the manager's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradationState {
    pub mode: Mode,
    pub reason: String,
    /// Clock millis when the current mode was entered.
    pub since_millis: u64,
    pub since: DateTime<Utc>,
    pub affected_features: BTreeSet<String>,
    pub available_features: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DegradationConfig {
    /// Breaker keys whose opening forces Degraded and blocks recovery.
    pub required_dependencies: BTreeSet<String>,
    /// Escalate Degraded to Minimal after this long. `None` disables automatic escalation.
    pub minimal_after: Option<Duration>,
    pub cache: CacheConfig,
}

impl Default for DegradationConfig {
    fn default() -> Self {
        Self {
            required_dependencies: BTreeSet::new(),
            minimal_after: Some(Duration::from_secs(300)),
            cache: CacheConfig::default(),
        }
    }
}

/// What the caller wants to read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Cache key, unique per logical read.
    pub key: String,
    /// Selects the fallback object.
    pub entity_type: String,
}

impl FetchRequest {
    pub fn new(key: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self { key: key.into(), entity_type: entity_type.into() }
    }
}

/// Where a read was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchSource {
    Live,
    Cache(Staleness),
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
    pub value: Value,
    pub source: FetchSource,
    /// Mode after the read completed.
    pub mode: Mode,
}

struct Inner {
    mode: Mode,
    reason: String,
    since_millis: u64,
    since: DateTime<Utc>,
    online: bool,
    open_dependencies: BTreeSet<String>,
    cache: TtlCache,
    fallbacks: HashMap<String, Value>,
    features: Vec<Feature>,
}

pub struct DegradationManager {
    inner: Mutex<Inner>,
    required: BTreeSet<String>,
    minimal_after: Option<Duration>,
    clock: Arc<dyn Clock>,
    events: Option<EventBus>,
}

impl std::fmt::Debug for DegradationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DegradationManager")
            .field("mode", &self.mode())
            .field("required", &self.required)
            .field("minimal_after", &self.minimal_after)
            .finish()
    }
}

impl DegradationManager {
    pub fn new(config: DegradationConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    pub fn with_clock(config: DegradationConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Inner {
            mode: Mode::Normal,
            reason: "startup".to_string(),
            since_millis: clock.now_millis(),
            since: clock.now_utc(),
            online: true,
            open_dependencies: BTreeSet::new(),
            cache: TtlCache::new(config.cache),
            fallbacks: HashMap::new(),
            features: Vec::new(),
        };
        Self {
            inner: Mutex::new(inner),
            required: config.required_dependencies,
            minimal_after: config.minimal_after,
            clock,
            events: None,
        }
    }

    pub fn with_events(mut self, bus: EventBus) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn register_feature(&self, feature: Feature) {
        let mut inner = self.lock();
        inner.features.retain(|f| f.name != feature.name);
        inner.features.push(feature);
    }

    /// Minimal object served for `entity_type` when nothing better exists.
    pub fn register_fallback(&self, entity_type: impl Into<String>, value: Value) {
        self.lock().fallbacks.insert(entity_type.into(), value);
    }

    pub fn mode(&self) -> Mode {
        self.lock().mode
    }

    pub fn is_online(&self) -> bool {
        self.lock().online
    }

    pub fn state(&self) -> DegradationState {
        let inner = self.lock();
        let (available, affected) = partition_features(&inner);
        DegradationState {
            mode: inner.mode,
            reason: inner.reason.clone(),
            since_millis: inner.since_millis,
            since: inner.since,
            affected_features: affected,
            available_features: available,
        }
    }

    pub fn is_feature_available(&self, name: &str) -> bool {
        self.state().available_features.contains(name)
    }

    /// Context keys whose breaker is not Closed.
    pub fn open_dependencies(&self) -> BTreeSet<String> {
        self.lock().open_dependencies.clone()
    }

    pub fn cached(&self, key: &str) -> Option<(Value, Staleness)> {
        let now = self.clock.now_millis();
        self.lock().cache.get(key, now)
    }

    pub fn cache_len(&self) -> usize {
        self.lock().cache.len()
    }

    pub fn invalidate(&self, key: &str) {
        self.lock().cache.remove(key);
    }

    /// Network-presence signal.
    pub fn set_network(&self, online: bool) {
        let mut inner = self.lock();
        inner.online = online;
        if !online {
            self.transition(&mut inner, Mode::Offline, "network offline".to_string());
        } else if inner.mode == Mode::Offline {
            let reason = "network restored; awaiting recovery".to_string();
            self.transition(&mut inner, Mode::Degraded, reason);
        }
    }

    /// Force Minimal mode.
    pub fn escalate(&self, reason: impl Into<String>) {
        let mut inner = self.lock();
        self.transition(&mut inner, Mode::Minimal, reason.into());
    }

    /// Escalate to Minimal once Degraded has lasted longer than `minimal_after`.
    pub fn check_escalation(&self) -> Mode {
        let mut inner = self.lock();
        if let (Mode::Degraded, Some(limit)) = (inner.mode, self.minimal_after) {
            let degraded_for = self.clock.now_millis().saturating_sub(inner.since_millis);
            if Duration::from_millis(degraded_for) >= limit {
                let reason = format!("degraded for {}ms", degraded_for);
                self.transition(&mut inner, Mode::Minimal, reason);
            }
        }
        inner.mode
    }

    /// Explicit recovery signal. Returns to Normal unless offline or a required dependency is
    /// still open; returns whether the manager is now Normal.
    pub fn record_recovery(&self) -> bool {
        let mut inner = self.lock();
        if inner.mode == Mode::Normal {
            return true;
        }
        if !inner.online {
            tracing::debug!(target: "lifeline::degradation", "recovery ignored: offline");
            return false;
        }
        if let Some(key) = inner.open_dependencies.iter().find(|k| self.required.contains(*k)) {
            tracing::debug!(
                target: "lifeline::degradation",
                dependency = %key,
                "recovery blocked: breaker open"
            );
            return false;
        }
        self.transition(&mut inner, Mode::Normal, "recovered".to_string());
        true
    }

    /// Run a health probe and record recovery if it succeeds.
    pub async fn probe_recovery<E, Fut, Probe>(&self, probe: Probe) -> bool
    where
        E: Into<RawError>,
        Fut: Future<Output = Result<(), E>>,
        Probe: FnOnce() -> Fut,
    {
        if self.mode() == Mode::Normal {
            return true;
        }
        if !self.is_online() {
            return false;
        }
        match probe().await {
            Ok(()) => self.record_recovery(),
            Err(err) => {
                let context = ErrorContext::operation("health_probe");
                let classified = classify(&err.into(), Some(&context));
                tracing::debug!(
                    target: "lifeline::degradation",
                    kind = %classified.kind(),
                    "health probe failed"
                );
                false
            }
        }
    }

    /// React to a classified failure seen on a live call.
    pub fn record_failure(&self, err: &ClassifiedError) {
        if !err.kind().is_connectivity() {
            return;
        }
        let mut inner = self.lock();
        if inner.mode == Mode::Normal {
            let reason = format!("{} failure: {}", err.kind(), err.code());
            self.transition(&mut inner, Mode::Degraded, reason);
        }
    }

    /// Read through the degradation policy. Never fails; the worst case is the fallback object.
    pub async fn fetch<E, Fut, Live>(&self, request: &FetchRequest, live: Live) -> Fetched
    where
        E: Into<RawError>,
        Fut: Future<Output = Result<Value, E>>,
        Live: FnOnce() -> Fut,
    {
        let mode = self.check_escalation();
        match mode {
            Mode::Minimal => self.fallback(request),
            Mode::Offline => self.from_cache(request).unwrap_or_else(|| self.fallback(request)),
            Mode::Normal => match self.call_live(request, live).await {
                Some(fetched) => fetched,
                None => self.from_cache(request).unwrap_or_else(|| self.fallback(request)),
            },
            Mode::Degraded => {
                if let Some(hit) = self.from_cache(request) {
                    return hit;
                }
                match self.call_live(request, live).await {
                    Some(fetched) => fetched,
                    None => self.fallback(request),
                }
            }
        }
    }

    async fn call_live<E, Fut, Live>(&self, request: &FetchRequest, live: Live) -> Option<Fetched>
    where
        E: Into<RawError>,
        Fut: Future<Output = Result<Value, E>>,
        Live: FnOnce() -> Fut,
    {
        match live().await {
            Ok(value) => {
                let now = self.clock.now_millis();
                let mut inner = self.lock();
                inner.cache.insert(request.key.clone(), value.clone(), now);
                Some(Fetched { value, source: FetchSource::Live, mode: inner.mode })
            }
            Err(err) => {
                let context = ErrorContext::operation(request.entity_type.clone());
                let classified = classify(&err.into(), Some(&context));
                tracing::debug!(
                    target: "lifeline::degradation",
                    key = %request.key,
                    kind = %classified.kind(),
                    "live read failed; degrading"
                );
                self.record_failure(&classified);
                None
            }
        }
    }

    fn from_cache(&self, request: &FetchRequest) -> Option<Fetched> {
        let now = self.clock.now_millis();
        let mut inner = self.lock();
        let (value, staleness) = inner.cache.get(&request.key, now)?;
        Some(Fetched { value, source: FetchSource::Cache(staleness), mode: inner.mode })
    }

    fn fallback(&self, request: &FetchRequest) -> Fetched {
        let inner = self.lock();
        let value = inner.fallbacks.get(&request.entity_type).cloned().unwrap_or(Value::Null);
        Fetched { value, source: FetchSource::Fallback, mode: inner.mode }
    }

    fn on_breaker(&self, transition: &BreakerTransition) {
        let mut inner = self.lock();
        match transition.to {
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.open_dependencies.insert(transition.key.clone());
            }
            CircuitState::Closed => {
                inner.open_dependencies.remove(&transition.key);
            }
        }
        if transition.to == CircuitState::Open
            && self.required.contains(&transition.key)
            && inner.mode == Mode::Normal
        {
            let reason = format!("dependency {} unavailable", transition.key);
            self.transition(&mut inner, Mode::Degraded, reason);
        }
    }

    fn transition(&self, inner: &mut Inner, to: Mode, reason: String) {
        if inner.mode == to {
            return;
        }
        let from = inner.mode;
        inner.mode = to;
        inner.reason = reason.clone();
        inner.since_millis = self.clock.now_millis();
        inner.since = self.clock.now_utc();

        match to {
            Mode::Normal => {
                tracing::info!(target: "lifeline::degradation", %from, %to, %reason, "mode changed")
            }
            _ => {
                tracing::warn!(target: "lifeline::degradation", %from, %to, %reason, "mode changed")
            }
        }
        if let Some(bus) = &self.events {
            bus.publish(SyncEvent::Degradation(DegradationEvent { from, to, reason }));
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BreakerObserver for DegradationManager {
    fn on_transition(&self, transition: &BreakerTransition) {
        self.on_breaker(transition);
    }
}

fn partition_features(inner: &Inner) -> (BTreeSet<String>, BTreeSet<String>) {
    let mut available = BTreeSet::new();
    let mut affected = BTreeSet::new();
    for feature in &inner.features {
        let usable = match inner.mode {
            Mode::Normal => true,
            Mode::Degraded => {
                feature.dependencies.iter().all(|d| !inner.open_dependencies.contains(d))
            }
            Mode::Offline => feature.offline_capable,
            Mode::Minimal => feature.essential,
        };
        if usable {
            available.insert(feature.name.clone());
        } else {
            affected.insert(feature.name.clone());
        }
    }
    (available, affected)
}
