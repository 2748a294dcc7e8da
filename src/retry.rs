//! Retry manager for classified failures.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - Only [recoverable](ClassifiedError::is_recoverable) errors are retried; `circuit_open` is
//!   never retried inline so callers can fall back without waiting out the cooldown.
//! - Backoff calculates delay per retry attempt; jitter randomizes the delay to avoid thundering
//!   herds.
//! - With `respect_retry_after`, a classified retry-after hint replaces the computed delay, capped
//!   at the backoff ceiling.
//! - Sleeper controls how delays are applied (production uses `TokioSleeper`; tests can inject
//!   `InstantSleeper`/`TrackingSleeper`).
//!
//! Invariants:
//! - Attempts never exceed `max_attempts`.
//! - The last classified error is returned once attempts are exhausted.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use lifeline::{Backoff, ClassifiedError, ErrorKind, InstantSleeper, Jitter, RetryManager};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let retry = RetryManager::builder()
//!     .max_attempts(3) // total attempts
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .with_jitter(Jitter::full())
//!     .with_sleeper(InstantSleeper)
//!     .build()
//!     .unwrap();
//! let result: Result<(), ClassifiedError> = retry
//!     .execute(|| async {
//!         Err(ClassifiedError::new(ErrorKind::Network, "NETWORK_ERROR", "down", true))
//!     })
//!     .await;
//! assert!(result.is_err());
//! # });
//! ```

use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitBreaker;
use crate::error::{ClassifiedError, RawError};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Retries recoverable classified failures with backoff and jitter.
#[derive(Clone)]
pub struct RetryManager {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    respect_retry_after: bool,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryManager")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("respect_retry_after", &self.respect_retry_after)
            .field("sleeper", &"<sleeper>")
            .finish()
    }
}

impl RetryManager {
    /// Construct a new builder with defaults.
    pub fn builder() -> RetryManagerBuilder {
        RetryManagerBuilder::new()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, Fut, Op>(&self, mut operation: Op) -> Result<T, ClassifiedError>
    where
        Fut: Future<Output = Result<T, ClassifiedError>>,
        Op: FnMut() -> Fut,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => self.pause_or_give_up(attempt, err).await?,
            }
        }
    }

    /// Retry an operation guarded by `breaker` under `key`.
    ///
    /// Each attempt goes through the breaker, so an opening breaker stops the retry loop with
    /// `circuit_open`.
    pub async fn execute_guarded<T, E, Fut, Op>(
        &self,
        breaker: &CircuitBreaker,
        key: &str,
        mut operation: Op,
    ) -> Result<T, ClassifiedError>
    where
        E: Into<RawError>,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match breaker.execute(key, &mut operation).await {
                Ok(value) => return Ok(value),
                Err(err) => self.pause_or_give_up(attempt, err).await?,
            }
        }
    }

    /// Sleep before the next attempt, or hand the error back when it must not be retried.
    async fn pause_or_give_up(
        &self,
        attempt: usize,
        err: ClassifiedError,
    ) -> Result<(), ClassifiedError> {
        if err.is_circuit_open() || !err.is_recoverable() {
            return Err(err);
        }
        if attempt >= self.max_attempts {
            tracing::warn!(
                target: "lifeline::retry",
                attempts = attempt,
                kind = %err.kind(),
                code = err.code(),
                "retry budget exhausted"
            );
            return Err(err);
        }

        let delay = self.delay_for(attempt, &err);
        tracing::debug!(
            target: "lifeline::retry",
            attempt,
            delay_ms = delay.as_millis() as u64,
            kind = %err.kind(),
            "retrying after recoverable failure"
        );
        self.sleeper.sleep(delay).await;
        Ok(())
    }

    fn delay_for(&self, attempt: usize, err: &ClassifiedError) -> Duration {
        if self.respect_retry_after {
            if let Some(hint) = err.retry_after() {
                return hint.min(self.backoff.ceiling());
            }
        }
        self.jitter.apply(self.backoff.delay(attempt))
    }
}

/// Builder for [`RetryManager`].
pub struct RetryManagerBuilder {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    respect_retry_after: bool,
    sleeper: Arc<dyn Sleeper>,
}

/// Errors produced while building a retry manager.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    /// `max_attempts` must be > 0.
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

impl RetryManagerBuilder {
    /// Create a builder with sane defaults.
    pub fn new() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(Duration::from_secs(1)),
            jitter: Jitter::full(),
            respect_retry_after: false,
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Set total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Prefer the classified retry-after hint over the computed backoff.
    pub fn respect_retry_after(mut self, enabled: bool) -> Self {
        self.respect_retry_after = enabled;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    pub(crate) fn with_shared_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Build the retry manager, validating inputs.
    pub fn build(self) -> Result<RetryManager, BuildError> {
        if self.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0));
        }
        Ok(RetryManager {
            max_attempts: self.max_attempts,
            backoff: self.backoff,
            jitter: self.jitter,
            respect_retry_after: self.respect_retry_after,
            sleeper: self.sleeper,
        })
    }
}

impl Default for RetryManagerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
