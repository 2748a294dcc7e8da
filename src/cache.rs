//! Size-bounded TTL cache backing degraded reads.
//!
//! Staleness is computed at read time from the entry's timestamps; there is no background sweep.
//! Inserting past capacity evicts the entry with the oldest `captured_at` (ties broken by
//! insertion order).

use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Read-time freshness of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    Fresh,
    Stale,
    Expired,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Value,
    /// Clock millis when the value was fetched live.
    pub captured_at: u64,
    /// Clock millis after which the entry is unusable.
    pub expires_at: u64,
    fresh_until: u64,
    seq: u64,
}

impl CacheEntry {
    pub fn staleness(&self, now: u64) -> Staleness {
        if now >= self.expires_at {
            Staleness::Expired
        } else if now < self.fresh_until {
            Staleness::Fresh
        } else {
            Staleness::Stale
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    pub capacity: usize,
    /// How long a value counts as fresh.
    pub fresh_for: Duration,
    /// How long a value may be served at all.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { capacity: 500, fresh_for: Duration::from_secs(60), ttl: Duration::from_secs(3_600) }
    }
}

#[derive(Debug)]
pub struct TtlCache {
    config: CacheConfig,
    entries: HashMap<String, CacheEntry>,
    next_seq: u64,
}

impl TtlCache {
    pub fn new(config: CacheConfig) -> Self {
        Self { config, entries: HashMap::new(), next_seq: 0 }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store `value` captured at `now`, evicting the oldest entries beyond capacity.
    pub fn insert(&mut self, key: impl Into<String>, value: Value, now: u64) {
        let key = key.into();
        let seq = self.next_seq;
        self.next_seq += 1;
        let entry = CacheEntry {
            key: key.clone(),
            value,
            captured_at: now,
            expires_at: now.saturating_add(self.config.ttl.as_millis() as u64),
            fresh_until: now.saturating_add(self.config.fresh_for.as_millis() as u64),
            seq,
        };
        self.entries.insert(key, entry);

        while self.entries.len() > self.config.capacity {
            let Some(oldest) = self
                .entries
                .values()
                .min_by_key(|e| (e.captured_at, e.seq))
                .map(|e| e.key.clone())
            else {
                break;
            };
            tracing::trace!(target: "lifeline::cache", key = %oldest, "evicted oldest entry");
            self.entries.remove(&oldest);
        }
    }

    /// Usable entry for `key`. Expired entries are removed and reported as absent.
    pub fn get(&mut self, key: &str, now: u64) -> Option<(Value, Staleness)> {
        let staleness = self.entries.get(key)?.staleness(now);
        if staleness == Staleness::Expired {
            self.entries.remove(key);
            return None;
        }
        self.entries.get(key).map(|e| (e.value.clone(), staleness))
    }

    pub fn peek(&self, key: &str) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cache(capacity: usize) -> TtlCache {
        TtlCache::new(CacheConfig {
            capacity,
            fresh_for: Duration::from_millis(100),
            ttl: Duration::from_millis(1_000),
        })
    }

    #[test]
    fn staleness_by_age() {
        let mut c = cache(4);
        c.insert("user:1", json!({"id": 1}), 0);
        assert_eq!(c.get("user:1", 50).unwrap().1, Staleness::Fresh);
        assert_eq!(c.get("user:1", 100).unwrap().1, Staleness::Stale);
        assert_eq!(c.get("user:1", 999).unwrap().1, Staleness::Stale);
    }

    #[test]
    fn expired_entries_are_removed_on_read() {
        let mut c = cache(4);
        c.insert("user:1", json!(1), 0);
        assert!(c.get("user:1", 1_000).is_none());
        assert!(c.is_empty());
    }

    #[test]
    fn evicts_oldest_captured_first() {
        let mut c = cache(2);
        c.insert("a", json!("a"), 10);
        c.insert("b", json!("b"), 5);
        c.insert("c", json!("c"), 20);
        assert_eq!(c.len(), 2);
        assert!(c.peek("b").is_none());
        assert!(c.peek("a").is_some());
        assert!(c.peek("c").is_some());
    }

    #[test]
    fn eviction_ties_break_by_insertion_order() {
        let mut c = cache(2);
        c.insert("a", json!("a"), 0);
        c.insert("b", json!("b"), 0);
        c.insert("c", json!("c"), 0);
        assert!(c.peek("a").is_none());
    }

    #[test]
    fn reinsert_refreshes_entry() {
        let mut c = cache(2);
        c.insert("a", json!(1), 0);
        c.insert("a", json!(2), 500);
        let (value, staleness) = c.get("a", 550).unwrap();
        assert_eq!(value, json!(2));
        assert_eq!(staleness, Staleness::Fresh);
        assert_eq!(c.len(), 1);
    }
}
