//! TTL cache for expensive topology reads
//!
//! Process-local memoization keyed by `prefix:md5(canonical_json)`.
//! Concurrent reads are cheap; writes are best-effort. A race costs a
//! duplicate computation, which is acceptable for a cache.
//!
//! When `default_ttl` is zero, sets without an explicit TTL are no-ops
//! (caching disabled) while explicit TTLs still work. At capacity the
//! oldest 10% of entries by creation time are evicted.

use crate::config::CacheSettings;
use crate::metrics::metrics;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry {
    value: serde_json::Value,
    expires_at: Instant,
    created_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Cache statistics snapshot.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub max_entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate_percent: f64,
    pub default_ttl_secs: u64,
}

/// TTL-based in-memory cache for topology query results.
pub struct TtlCache {
    entries: DashMap<String, CacheEntry>,
    default_ttl: Duration,
    max_entries: usize,
    cleanup_interval: Duration,
    last_cleanup: Mutex<Instant>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl TtlCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl: Duration::from_secs(settings.topology_cache_ttl_seconds),
            max_entries: settings.max_entries.max(1),
            cleanup_interval: Duration::from_secs(settings.cleanup_interval_secs.max(1)),
            last_cleanup: Mutex::new(Instant::now()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Build a cache key from a prefix and the canonical JSON of the
    /// query inputs. serde_json serializes maps with sorted keys, so
    /// equal inputs always hash identically.
    pub fn make_key<T: serde::Serialize>(prefix: &str, inputs: &T) -> String {
        let canonical = serde_json::to_string(inputs).unwrap_or_default();
        let digest = md5::compute(canonical.as_bytes());
        let hex = format!("{digest:x}");
        format!("{prefix}:{}", &hex[..16])
    }

    /// Get a live value, dropping it if expired.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics().cache_hits.inc();
                Some(entry.value.clone())
            }
            Some(_) => {
                drop(self.entries.remove(key));
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics().cache_misses.inc();
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics().cache_misses.inc();
                None
            }
        }
    }

    /// Store a value. `ttl = None` uses the default; when the default
    /// is zero and no TTL is given, the set is a no-op.
    pub fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) {
        let ttl = match ttl {
            Some(explicit) => explicit,
            None if self.default_ttl.is_zero() => return,
            None => self.default_ttl,
        };
        if ttl.is_zero() {
            return;
        }

        let now = Instant::now();
        self.maybe_cleanup(now);
        if self.entries.len() >= self.max_entries {
            self.evict_oldest();
        }

        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: now + ttl,
                created_at: now,
            },
        );
    }

    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove everything. Returns the number of entries cleared.
    pub fn clear(&self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    /// Remove all keys under `prefix:`. Returns how many were removed.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let needle = format!("{prefix}:");
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(&needle))
            .map(|e| e.key().clone())
            .collect();
        for key in &keys {
            self.entries.remove(key);
        }
        keys.len()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            entries: self.entries.len(),
            max_entries: self.max_entries,
            hits,
            misses,
            hit_rate_percent: if total > 0 {
                (hits as f64 / total as f64 * 100.0 * 100.0).round() / 100.0
            } else {
                0.0
            },
            default_ttl_secs: self.default_ttl.as_secs(),
        }
    }

    /// Reclaim expired entries once per cleanup interval.
    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = match self.last_cleanup.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if now.duration_since(*last) < self.cleanup_interval {
                return;
            }
            *last = now;
        }
        self.cleanup_expired(now);
    }

    /// Remove every expired entry. Returns the count removed.
    pub fn cleanup_expired(&self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect();
        for key in &expired {
            self.entries.remove(key);
        }
        if !expired.is_empty() {
            tracing::debug!(
                expired_count = expired.len(),
                remaining = self.entries.len(),
                "Cache cleanup completed"
            );
        }
        expired.len()
    }

    /// Evict the oldest 10% of entries by creation time.
    fn evict_oldest(&self) {
        let evict_count = (self.max_entries / 10).max(1);
        let mut by_age: Vec<(String, Instant)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().created_at))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);

        for (key, _) in by_age.into_iter().take(evict_count) {
            self.entries.remove(&key);
        }
        tracing::debug!(
            evicted_count = evict_count,
            remaining = self.entries.len(),
            "Cache eviction completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(ttl_secs: u64, max_entries: usize) -> TtlCache {
        TtlCache::new(&CacheSettings {
            topology_cache_ttl_seconds: ttl_secs,
            max_entries,
            cleanup_interval_secs: 3_600,
        })
    }

    #[test]
    fn test_set_get_round_trip() {
        let cache = cache(30, 100);
        cache.set("topology:abc", serde_json::json!({"nodes": 3}), None);
        assert_eq!(
            cache.get("topology:abc"),
            Some(serde_json::json!({"nodes": 3}))
        );
    }

    #[test]
    fn test_expiry() {
        let cache = cache(30, 100);
        cache.set(
            "topology:abc",
            serde_json::json!(1),
            Some(Duration::from_millis(20)),
        );
        assert!(cache.get("topology:abc").is_some());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("topology:abc").is_none());
    }

    #[test]
    fn test_zero_default_ttl_disables_implicit_sets() {
        let cache = cache(0, 100);
        cache.set("topology:abc", serde_json::json!(1), None);
        assert!(cache.get("topology:abc").is_none());

        // Explicit TTL still works
        cache.set(
            "topology:def",
            serde_json::json!(2),
            Some(Duration::from_secs(30)),
        );
        assert!(cache.get("topology:def").is_some());
    }

    #[test]
    fn test_make_key_stable_and_prefixed() {
        let a = TtlCache::make_key("topology", &serde_json::json!({"b": 2, "a": 1}));
        let b = TtlCache::make_key("topology", &serde_json::json!({"a": 1, "b": 2}));
        assert_eq!(a, b);
        assert!(a.starts_with("topology:"));

        let c = TtlCache::make_key("topology", &serde_json::json!({"a": 2, "b": 2}));
        assert_ne!(a, c);
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = cache(30, 100);
        cache.set("topology:1", serde_json::json!(1), None);
        cache.set("topology:2", serde_json::json!(2), None);
        cache.set("blast_radius:1", serde_json::json!(3), None);

        assert_eq!(cache.invalidate_prefix("topology"), 2);
        assert!(cache.get("topology:1").is_none());
        assert!(cache.get("blast_radius:1").is_some());
    }

    #[test]
    fn test_eviction_at_capacity() {
        let cache = cache(300, 10);
        for i in 0..10 {
            cache.set(&format!("topology:{i}"), serde_json::json!(i), None);
            // Keep creation order distinguishable
            std::thread::sleep(Duration::from_millis(2));
        }
        cache.set("topology:new", serde_json::json!("new"), None);

        // Oldest entry evicted, newest present
        assert!(cache.get("topology:0").is_none());
        assert!(cache.get("topology:new").is_some());
        assert!(cache.stats().entries <= 10);
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache(30, 100);
        cache.set("topology:1", serde_json::json!(1), None);
        assert!(cache.delete("topology:1"));
        assert!(!cache.delete("topology:1"));

        cache.set("topology:2", serde_json::json!(2), None);
        cache.set("topology:3", serde_json::json!(3), None);
        assert_eq!(cache.clear(), 2);
    }

    #[test]
    fn test_cleanup_expired() {
        let cache = cache(30, 100);
        cache.set(
            "topology:short",
            serde_json::json!(1),
            Some(Duration::from_millis(5)),
        );
        cache.set("topology:long", serde_json::json!(2), None);
        std::thread::sleep(Duration::from_millis(10));

        let removed = cache.cleanup_expired(Instant::now());
        assert_eq!(removed, 1);
        assert!(cache.get("topology:long").is_some());
    }

    #[test]
    fn test_stats() {
        let cache = cache(30, 100);
        cache.set("topology:1", serde_json::json!(1), None);
        cache.get("topology:1");
        cache.get("topology:missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate_percent - 50.0).abs() < f64::EPSILON);
    }
}
