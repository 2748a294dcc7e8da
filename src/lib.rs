#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Lifeline
//!
//! A resilient synchronization core for async clients talking to an unreliable backend.
//!
//! ## Features
//!
//! - **Error classification** of raw transport failures into a small, stable taxonomy
//! - **Circuit breakers** per context key, with half-open trial calls and growing cooldowns
//! - **Retry** with exponential backoff, jitter and `Retry-After` hints
//! - **Graceful degradation** between normal, degraded, offline and minimal modes, backed by a
//!   TTL cache and per-entity fallbacks
//! - **Offline write queue** persisted through a key-value store, replayed in order with
//!   conflict detection and resolution
//! - **Request optimization**: in-flight deduplication and priority batching
//!
//! ## Quick Start
//!
//! ```rust
//! use lifeline::{Backoff, ClassifiedError, ErrorKind, InstantSleeper, Jitter, RetryManager};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let retry = RetryManager::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::exponential(Duration::from_millis(100)))
//!         .with_jitter(Jitter::Full)
//!         .with_sleeper(InstantSleeper)
//!         .build()
//!         .unwrap();
//!
//!     let result = retry
//!         .execute(|| async {
//!             let err = ClassifiedError::new(ErrorKind::Network, "NETWORK", "unreachable", true);
//!             Err::<(), _>(err)
//!         })
//!         .await;
//!     assert_eq!(result.unwrap_err().kind(), ErrorKind::Network);
//! }
//! ```
//!
//! Most applications use [`ResilientClient`], which wires every component together from a
//! [`LifelineConfig`].

pub mod backoff;
pub mod cache;
pub mod circuit_breaker;
pub mod classify;
pub mod client;
pub mod clock;
pub mod config;
pub mod conflict;
pub mod degradation;
pub mod error;
pub mod jitter;
pub mod network;
pub mod optimizer;
pub mod poll;
pub mod queue;
pub mod retry;
pub mod sleeper;
pub mod store;
pub mod telemetry;
pub mod transport;

// Re-exports
pub use backoff::Backoff;
pub use circuit_breaker::{
    BreakerConfig, BreakerLayer, BreakerObserver, BreakerTransport, CircuitBreaker, CircuitState,
    KeyStrategy,
};
pub use classify::classify;
pub use client::{ClientError, ResilientClient, WriteOutcome};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::{ConfigError, LifelineConfig};
pub use conflict::{ConflictKind, ConflictRecord, ConflictResolver, ConflictStrategy, Resolution};
pub use degradation::{DegradationManager, FetchRequest, FetchSource, Fetched, Mode};
pub use error::{ClassifiedError, ErrorContext, ErrorKind, RawError};
pub use jitter::Jitter;
pub use network::NetworkMonitor;
pub use optimizer::{OptimizerConfig, Priority, RequestOptimizer};
pub use queue::{OfflineQueue, OperationKind, QueueConfig, QueueError, SyncOutcome, SyncReport};
pub use retry::{RetryManager, RetryManagerBuilder};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use store::{FileStore, KeyValueStore, MemoryStore};
pub use telemetry::{EventBus, SyncEvent};
pub use transport::{ServiceTransport, Transport, TransportRequest};
