//! Serializable configuration for the whole synchronization core.
//!
//! Every field has a default, so an empty JSON object is a valid config. Durations are whole
//! milliseconds. [`LifelineConfig::from_json_str`] parses and validates in one step; the
//! accessor methods turn the settings into validated component configs.

use crate::backoff::{Backoff, BackoffError};
use crate::cache::CacheConfig;
use crate::circuit_breaker::{BreakerConfig, BreakerConfigError, KeyStrategy};
use crate::conflict::{ConflictConfigError, ConflictResolver, ConflictStrategy};
use crate::degradation::DegradationConfig;
use crate::jitter::Jitter;
use crate::optimizer::{BatchConfig, OptimizerConfig};
use crate::queue::QueueConfig;
use crate::retry::{BuildError, RetryManager};
use crate::sleeper::Sleeper;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid JSON config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("breaker: {0}")]
    Breaker(#[from] BreakerConfigError),
    #[error("retry: {0}")]
    Retry(#[from] BuildError),
    #[error("retry backoff: {0}")]
    Backoff(#[from] BackoffError),
    #[error("conflict: {0}")]
    Conflict(#[from] ConflictConfigError),
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LifelineConfig {
    pub breaker: BreakerSettings,
    pub retry: RetrySettings,
    pub degradation: DegradationSettings,
    pub queue: QueueSettings,
    pub optimizer: OptimizerSettings,
    pub client: ClientSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BreakerSettings {
    pub failure_threshold: usize,
    /// `None` counts consecutive failures regardless of spacing.
    pub failure_window_ms: Option<u64>,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    /// One breaker for every call under this key; `None` keys breakers by operation name.
    pub context_key: Option<String>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_ms: Some(60_000),
            cooldown_ms: 30_000,
            max_cooldown_ms: 300_000,
            context_key: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterSetting {
    None,
    #[default]
    Full,
    Equal,
}

impl From<JitterSetting> for Jitter {
    fn from(setting: JitterSetting) -> Self {
        match setting {
            JitterSetting::None => Jitter::None,
            JitterSetting::Full => Jitter::Full,
            JitterSetting::Equal => Jitter::Equal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: JitterSetting,
    pub respect_retry_after: bool,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: JitterSetting::Full,
            respect_retry_after: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DegradationSettings {
    pub required_dependencies: Vec<String>,
    pub minimal_after_ms: Option<u64>,
    pub cache_capacity: usize,
    pub cache_fresh_ms: u64,
    pub cache_ttl_ms: u64,
}

impl Default for DegradationSettings {
    fn default() -> Self {
        Self {
            required_dependencies: Vec::new(),
            minimal_after_ms: Some(300_000),
            cache_capacity: 500,
            cache_fresh_ms: 60_000,
            cache_ttl_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueSettings {
    pub max_queue_size: usize,
    pub max_retries: u32,
    pub namespace: String,
    pub conflict_strategy: ConflictStrategy,
    pub merge_overlap_threshold: f64,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            max_retries: 5,
            namespace: "lifeline".to_string(),
            conflict_strategy: ConflictStrategy::Merge,
            merge_overlap_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub window_ms: u64,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self { max_batch_size: 10, window_ms: 50 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerSettings {
    pub deduplicate: bool,
    /// Batchable operations by name.
    pub batch: BTreeMap<String, BatchSettings>,
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self { deduplicate: true, batch: BTreeMap::new() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClientSettings {
    /// Operation called by health checks.
    pub health_operation: String,
    pub poll_interval_ms: u64,
    /// Sync the offline queue as soon as the network comes back.
    pub sync_on_reconnect: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            health_operation: "health.check".to_string(),
            poll_interval_ms: 30_000,
            sync_on_reconnect: true,
        }
    }
}

impl LifelineConfig {
    /// Parse and validate a JSON document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section converts into a valid component config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.breaker_config()?;
        self.retry_backoff()?;
        self.degradation_config()?;
        self.queue_config()?;
        self.conflict_resolver()?;
        self.optimizer_config()?;
        if self.retry.max_attempts == 0 {
            return Err(BuildError::InvalidMaxAttempts(0).into());
        }
        if self.client.poll_interval_ms == 0 {
            return Err(invalid("client.poll_interval_ms", "must be > 0"));
        }
        if self.client.health_operation.is_empty() {
            return Err(invalid("client.health_operation", "must not be empty"));
        }
        Ok(())
    }

    pub fn breaker_config(&self) -> Result<BreakerConfig, ConfigError> {
        let b = &self.breaker;
        Ok(BreakerConfig::new(
            b.failure_threshold,
            b.failure_window_ms.map(Duration::from_millis),
            Duration::from_millis(b.cooldown_ms),
            Duration::from_millis(b.max_cooldown_ms),
        )?)
    }

    pub fn breaker_keys(&self) -> KeyStrategy {
        match &self.breaker.context_key {
            Some(key) => KeyStrategy::Fixed(key.clone()),
            None => KeyStrategy::PerOperation,
        }
    }

    fn retry_backoff(&self) -> Result<Backoff, ConfigError> {
        Ok(Backoff::exponential(Duration::from_millis(self.retry.base_delay_ms))
            .with_max(Duration::from_millis(self.retry.max_delay_ms))?)
    }

    pub fn retry_manager(&self, sleeper: Arc<dyn Sleeper>) -> Result<RetryManager, ConfigError> {
        Ok(RetryManager::builder()
            .max_attempts(self.retry.max_attempts)
            .backoff(self.retry_backoff()?)
            .with_jitter(self.retry.jitter.into())
            .respect_retry_after(self.retry.respect_retry_after)
            .with_shared_sleeper(sleeper)
            .build()?)
    }

    pub fn degradation_config(&self) -> Result<DegradationConfig, ConfigError> {
        let d = &self.degradation;
        if d.cache_capacity == 0 {
            return Err(invalid("degradation.cache_capacity", "must be > 0"));
        }
        if d.cache_fresh_ms > d.cache_ttl_ms {
            return Err(invalid("degradation.cache_fresh_ms", "must not exceed cache_ttl_ms"));
        }
        Ok(DegradationConfig {
            required_dependencies: d.required_dependencies.iter().cloned().collect(),
            minimal_after: d.minimal_after_ms.map(Duration::from_millis),
            cache: CacheConfig {
                capacity: d.cache_capacity,
                fresh_for: Duration::from_millis(d.cache_fresh_ms),
                ttl: Duration::from_millis(d.cache_ttl_ms),
            },
        })
    }

    pub fn queue_config(&self) -> Result<QueueConfig, ConfigError> {
        let q = &self.queue;
        if q.max_queue_size == 0 {
            return Err(invalid("queue.max_queue_size", "must be > 0"));
        }
        if q.namespace.is_empty() {
            return Err(invalid("queue.namespace", "must not be empty"));
        }
        Ok(QueueConfig {
            max_queue_size: q.max_queue_size,
            max_retries: q.max_retries,
            namespace: q.namespace.clone(),
        })
    }

    pub fn conflict_resolver(&self) -> Result<ConflictResolver, ConfigError> {
        Ok(ConflictResolver::new(self.queue.conflict_strategy)
            .with_merge_overlap_threshold(self.queue.merge_overlap_threshold)?)
    }

    pub fn optimizer_config(&self) -> Result<OptimizerConfig, ConfigError> {
        let mut config = OptimizerConfig {
            deduplicate: self.optimizer.deduplicate,
            ..OptimizerConfig::default()
        };
        for (operation, batch) in &self.optimizer.batch {
            if batch.max_batch_size == 0 {
                return Err(invalid("optimizer.batch.max_batch_size", "must be > 0"));
            }
            config = config.batch(
                operation.clone(),
                BatchConfig {
                    max_batch_size: batch.max_batch_size,
                    window: Duration::from_millis(batch.window_ms),
                },
            );
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.client.poll_interval_ms)
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_string() }
}
