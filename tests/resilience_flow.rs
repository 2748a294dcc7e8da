mod common;

use common::test_helpers::ScriptedTransport;
use lifeline::degradation::DegradationConfig;
use lifeline::{
    BreakerConfig, BreakerTransport, CircuitBreaker, CircuitState, DegradationManager, ErrorKind,
    FetchRequest, FetchSource, InstantSleeper, KeyStrategy, ManualClock, Mode, RawError,
    RetryManager, Transport,
};
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn user_api_breaker(clock: &ManualClock) -> CircuitBreaker {
    let config =
        BreakerConfig::new(3, None, Duration::from_secs(30), Duration::from_secs(300)).unwrap();
    CircuitBreaker::new(config).with_clock(Arc::new(clock.clone()))
}

fn degradation(clock: &ManualClock, required: &[&str]) -> Arc<DegradationManager> {
    let config = DegradationConfig {
        required_dependencies: required.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
        ..DegradationConfig::default()
    };
    Arc::new(DegradationManager::with_clock(config, Arc::new(clock.clone())))
}

#[tokio::test]
async fn open_breaker_on_required_dependency_degrades_until_recovery() {
    let clock = ManualClock::starting_at(1_000);
    let breaker = user_api_breaker(&clock);
    let manager = degradation(&clock, &["user-api"]);
    breaker.subscribe(manager.clone());

    let backend = ScriptedTransport::new(vec![
        Err(RawError::status(503, "down")),
        Err(RawError::status(503, "down")),
        Err(RawError::status(503, "down")),
    ]);
    let keys = KeyStrategy::Fixed("user-api".into());
    let transport = BreakerTransport::new(breaker.clone(), backend.clone(), keys);

    for _ in 0..3 {
        assert!(transport.call("getUser", json!({"id": "42"})).await.is_err());
    }
    assert_eq!(breaker.state("user-api"), CircuitState::Open);
    assert_eq!(manager.mode(), Mode::Degraded);
    assert!(manager.open_dependencies().contains("user-api"));

    clock.advance(1);
    let rejected = transport.call("getUser", json!({"id": "42"})).await.unwrap_err();
    assert!(matches!(rejected, RawError::Classified(ref e) if e.kind() == ErrorKind::CircuitOpen));
    assert_eq!(backend.call_count(), 3);
    assert!(!manager.record_recovery(), "recovery is blocked while the breaker is open");

    clock.advance(30_000);
    transport.call("getUser", json!({"id": "42"})).await.unwrap();
    let record = breaker.record("user-api").unwrap();
    assert_eq!(record.state, CircuitState::Closed);
    assert_eq!(record.consecutive_failures, 0);

    assert_eq!(manager.mode(), Mode::Degraded, "closing a breaker is not a recovery signal");
    assert!(manager.record_recovery());
    assert_eq!(manager.mode(), Mode::Normal);
}

#[tokio::test]
async fn retry_stops_when_the_breaker_opens() {
    let clock = ManualClock::new();
    let breaker = user_api_breaker(&clock);
    let retry =
        RetryManager::builder().max_attempts(10).with_sleeper(InstantSleeper).build().unwrap();
    let calls = AtomicUsize::new(0);

    let err = retry
        .execute_guarded(&breaker, "user-api", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(RawError::status(503, "down"))
        })
        .await
        .unwrap_err();

    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn offline_reads_never_touch_the_network() {
    let clock = ManualClock::new();
    let manager = degradation(&clock, &[]);
    manager.register_fallback("user", json!({"name": "Unknown user"}));
    let request = FetchRequest::new("user:42", "user");

    let warm =
        manager.fetch(&request, || async { Ok::<_, RawError>(json!({"name": "Ada"})) }).await;
    assert_eq!(warm.source, FetchSource::Live);

    manager.set_network(false);
    assert_eq!(manager.mode(), Mode::Offline);

    let live_calls = AtomicUsize::new(0);
    let live = || async {
        live_calls.fetch_add(1, Ordering::SeqCst);
        Ok::<Value, RawError>(json!({"name": "fresh"}))
    };

    let cached = manager.fetch(&request, live).await;
    assert!(matches!(cached.source, FetchSource::Cache(_)));
    assert_eq!(cached.value["name"], "Ada");

    let missing = manager.fetch(&FetchRequest::new("user:7", "user"), live).await;
    assert_eq!(missing.source, FetchSource::Fallback);
    assert_eq!(missing.value["name"], "Unknown user");

    assert_eq!(live_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn expired_cache_entries_are_not_served() {
    let clock = ManualClock::new();
    let manager = degradation(&clock, &[]);
    let request = FetchRequest::new("user:42", "user");
    manager.fetch(&request, || async { Ok::<_, RawError>(json!({"name": "Ada"})) }).await;

    manager.set_network(false);
    clock.advance(3_600_001);
    let fetched = manager
        .fetch(&request, || async { Ok::<_, RawError>(Value::Null) })
        .await;
    assert_eq!(fetched.source, FetchSource::Fallback);
    assert_eq!(fetched.value, Value::Null);
}
