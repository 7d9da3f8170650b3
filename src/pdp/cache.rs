//! Bounded, content-addressed decision cache.
//!
//! Keys are a stable digest of the context's identity-forming fields (agent,
//! action, resource, agent type) plus the active policy-set version. On
//! overflow the oldest 20% of entries by insertion time are discarded.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::models::{Decision, DecisionContext};

/// Default entry lifetime
pub const DEFAULT_CACHE_TTL_SECS: u64 = 300;
/// Default capacity bound
pub const DEFAULT_CACHE_MAX_SIZE: usize = 1000;

/// Stable digest over the identity-forming context fields and policy version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey(pub String);

impl CacheKey {
    pub fn digest(context: &DecisionContext, policy_version: u64) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(context.agent_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(context.action.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(context.resource.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(context.agent_type.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(policy_version.to_be_bytes());
        CacheKey(format!("{:x}", hasher.finalize()))
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0[..16])
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    decision: Decision,
    created_at: DateTime<Utc>,
}

/// Cache effectiveness counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    entries: HashMap<CacheKey, CacheEntry>,
    stats: CacheStats,
}

/// Bounded decision cache with TTL expiry and oldest-20% overflow eviction
pub struct DecisionCache {
    inner: RwLock<CacheInner>,
    ttl: Duration,
    capacity: usize,
    enabled: bool,
    /// Single-flight locks keyed by cache key, preventing decision stampedes
    in_flight: DashMap<CacheKey, Arc<Mutex<()>>>,
}

impl DecisionCache {
    pub fn new(enabled: bool, ttl_secs: u64, capacity: usize) -> Self {
        Self {
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            ttl: Duration::seconds(ttl_secs as i64),
            capacity: capacity.max(1),
            enabled,
            in_flight: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(true, DEFAULT_CACHE_TTL_SECS, DEFAULT_CACHE_MAX_SIZE)
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn get(&self, key: &CacheKey) -> Option<Decision> {
        if !self.enabled {
            return None;
        }
        let now = Utc::now();

        {
            let inner = self.inner.read();
            if let Some(entry) = inner.entries.get(key) {
                if now - entry.created_at <= self.ttl {
                    drop(inner);
                    let mut inner = self.inner.write();
                    inner.stats.hits += 1;
                    return inner.entries.get(key).map(|e| e.decision.clone());
                }
            }
        }

        let mut inner = self.inner.write();
        // Expired entries are removed on the read path
        let expired = inner
            .entries
            .get(key)
            .map(|entry| now - entry.created_at > self.ttl)
            .unwrap_or(false);
        if expired {
            inner.entries.remove(key);
        }
        inner.stats.misses += 1;
        None
    }

    pub fn put(&self, key: CacheKey, decision: Decision) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.write();
        inner.entries.insert(
            key,
            CacheEntry {
                decision,
                created_at: Utc::now(),
            },
        );
        if inner.entries.len() > self.capacity {
            Self::evict_oldest(&mut inner, self.capacity);
        }
        inner.stats.entry_count = inner.entries.len();
    }

    /// Discard the oldest 20% of entries by insertion time
    fn evict_oldest(inner: &mut CacheInner, capacity: usize) {
        let evict_count = (capacity / 5).max(1);
        let mut by_age: Vec<(CacheKey, DateTime<Utc>)> = inner
            .entries
            .iter()
            .map(|(k, e)| (k.clone(), e.created_at))
            .collect();
        by_age.sort_by_key(|(_, created)| *created);

        for (key, _) in by_age.into_iter().take(evict_count) {
            inner.entries.remove(&key);
            inner.stats.evictions += 1;
        }
        tracing::debug!(evicted = evict_count, "Decision cache overflow eviction");
    }

    /// Drop every entry; called whenever the policy set changes
    pub fn invalidate_all(&self) {
        let mut inner = self.inner.write();
        let dropped = inner.entries.len();
        inner.entries.clear();
        inner.stats.entry_count = 0;
        tracing::debug!(dropped, "Decision cache invalidated");
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        let mut stats = inner.stats.clone();
        stats.entry_count = inner.entries.len();
        stats
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the single-flight lock for a key. Concurrent callers with the
    /// same key serialize on the returned guard; the second caller should
    /// re-check the cache after acquisition.
    pub async fn flight_guard(&self, key: &CacheKey) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self
            .in_flight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        // Opportunistic cleanup so the map does not grow unboundedly
        if self.in_flight.len() > self.capacity {
            self.in_flight.retain(|_, v| Arc::strong_count(v) > 1);
        }
        guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AgentType;

    fn context(agent: &str) -> DecisionContext {
        DecisionContext::new(agent, AgentType::Research, "tool:call", "tool:fs__read")
    }

    #[test]
    fn test_key_is_stable_and_version_sensitive() {
        let ctx = context("a");
        assert_eq!(CacheKey::digest(&ctx, 1), CacheKey::digest(&ctx, 1));
        assert_ne!(CacheKey::digest(&ctx, 1), CacheKey::digest(&ctx, 2));
        assert_ne!(
            CacheKey::digest(&context("a"), 1),
            CacheKey::digest(&context("b"), 1)
        );
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = DecisionCache::with_defaults();
        let key = CacheKey::digest(&context("a"), 1);

        assert!(cache.get(&key).is_none());
        cache.put(key.clone(), Decision::permit("ok"));
        let hit = cache.get(&key).unwrap();
        assert!(hit.verdict.is_permit());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = DecisionCache::new(true, 0, 10);
        let key = CacheKey::digest(&context("a"), 1);
        cache.put(key.clone(), Decision::permit("ok"));
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_overflow_evicts_oldest_fifth_and_keeps_newest() {
        let capacity = 10;
        let cache = DecisionCache::new(true, 300, capacity);

        for i in 0..=capacity {
            let key = CacheKey(format!("key-{:02}", i));
            cache.put(key, Decision::permit(format!("d{}", i)));
            std::thread::sleep(std::time::Duration::from_millis(2));
        }

        // capacity + 1 inserts: 20% (2 entries) of the oldest were dropped
        assert_eq!(cache.len(), capacity - 1);
        assert!(cache.get(&CacheKey("key-00".to_string())).is_none());
        assert!(cache.get(&CacheKey("key-01".to_string())).is_none());
        assert!(cache.get(&CacheKey(format!("key-{:02}", capacity))).is_some());
    }

    #[test]
    fn test_invalidate_all() {
        let cache = DecisionCache::with_defaults();
        for i in 0..5 {
            cache.put(CacheKey(format!("k{}", i)), Decision::permit("ok"));
        }
        assert_eq!(cache.len(), 5);
        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_disabled_cache_never_stores() {
        let cache = DecisionCache::new(false, 300, 10);
        let key = CacheKey("k".to_string());
        cache.put(key.clone(), Decision::permit("ok"));
        assert!(cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_single_flight_serializes_same_key() {
        let cache = Arc::new(DecisionCache::with_defaults());
        let key = CacheKey("shared".to_string());

        let guard = cache.flight_guard(&key).await;
        let cache2 = cache.clone();
        let key2 = key.clone();
        let contender = tokio::spawn(async move {
            let _guard = cache2.flight_guard(&key2).await;
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!contender.is_finished());
        drop(guard);
        contender.await.unwrap();
    }
}
