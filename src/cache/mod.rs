//! Two-tier cache shielding storage from read pressure.
//!
//! Reads check the in-process tier, then the shared tier. Writes go to both.
//! The cache is always a derived view: every failure is logged and degrades
//! to a miss, never to an error for the caller.

mod broker;
mod local;

pub use broker::{CacheBroker, CacheError, MemoryBroker};
pub use local::{LocalTier, LOCAL_TTL};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default TTL for the shared tier when the caller does not pick one.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

pub struct TieredCache {
    namespace: String,
    default_ttl: Duration,
    local: LocalTier,
    shared: Arc<dyn CacheBroker>,
}

impl TieredCache {
    pub fn new(shared: Arc<dyn CacheBroker>, namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            default_ttl: DEFAULT_TTL,
            local: LocalTier::new(),
            shared,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    /// Look a key up, in-process tier first.
    pub async fn get(&self, key: &str) -> Option<String> {
        let full_key = self.full_key(key);

        if let Some(value) = self.local.get(&full_key) {
            debug!(key, tier = "local", "cache hit");
            return Some(value);
        }

        match self.shared.get(&full_key).await {
            Ok(Some(value)) => {
                debug!(key, tier = "shared", "cache hit");
                self.local.insert(&full_key, value.clone());
                Some(value)
            }
            Ok(None) => {
                debug!(key, "cache miss");
                None
            }
            Err(e) => {
                warn!(key, error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    /// Store a value. Returns `false` when the shared tier rejected the write.
    pub async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> bool {
        let full_key = self.full_key(key);
        let ttl = ttl.unwrap_or(self.default_ttl);

        self.local.insert(&full_key, value.clone());
        match self.shared.set(&full_key, value, ttl).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "cache write failed");
                false
            }
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "cached value failed to deserialize, ignoring");
                None
            }
        }
    }

    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_string(value) {
            Ok(raw) => self.set(key, raw, ttl).await,
            Err(e) => {
                warn!(key, error = %CacheError::Serialize(e.to_string()), "cache write skipped");
                false
            }
        }
    }

    /// Remove a single key from both tiers.
    pub async fn invalidate(&self, key: &str) -> bool {
        let full_key = self.full_key(key);
        self.local.remove(&full_key);
        match self.shared.delete(&[full_key]).await {
            Ok(_) => true,
            Err(e) => {
                warn!(key, error = %e, "cache invalidation failed");
                false
            }
        }
    }

    /// Remove every key matching a glob where `*` matches any run of characters.
    ///
    /// Keys are listed by the literal prefix before the first `*`, filtered,
    /// then deleted in one call. Writers racing with this may leave a fresh
    /// entry behind; that entry still expires by TTL.
    pub async fn invalidate_pattern(&self, pattern: &str) -> usize {
        let full_pattern = self.full_key(pattern);
        if !pattern.contains('*') {
            self.local.remove(&full_pattern);
            return self.delete_shared(pattern, vec![full_pattern]).await;
        }

        let prefix = full_pattern
            .split('*')
            .next()
            .unwrap_or_default()
            .to_string();

        self.local.remove_matching(|key| glob_match(&full_pattern, key));

        let keys = match self.shared.keys_with_prefix(&prefix).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern, error = %e, "cache key listing failed");
                return 0;
            }
        };

        let matching: Vec<String> = keys
            .into_iter()
            .filter(|key| glob_match(&full_pattern, key))
            .collect();
        if matching.is_empty() {
            return 0;
        }
        self.delete_shared(pattern, matching).await
    }

    async fn delete_shared(&self, pattern: &str, keys: Vec<String>) -> usize {
        match self.shared.delete(&keys).await {
            Ok(removed) => {
                debug!(pattern, removed, "cache pattern invalidated");
                removed
            }
            Err(e) => {
                warn!(pattern, error = %e, "cache bulk delete failed");
                0
            }
        }
    }
}

/// Match `text` against `pattern` where `*` matches zero or more characters.
fn glob_match(pattern: &str, text: &str) -> bool {
    let mut parts = pattern.split('*');
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = text.strip_prefix(first) else {
        return false;
    };

    let remaining: Vec<&str> = parts.collect();
    let Some((last, middle)) = remaining.split_last() else {
        // No '*' at all: exact match.
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Broker wrapper counting calls that reach the shared tier.
    #[derive(Default)]
    struct CountingBroker {
        inner: MemoryBroker,
        gets: AtomicUsize,
    }

    #[async_trait]
    impl CacheBroker for CountingBroker {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
            self.inner.set(key, value, ttl).await
        }

        async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
            self.inner.delete(keys).await
        }

        async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
            self.inner.keys_with_prefix(prefix).await
        }
    }

    struct DownBroker;

    #[async_trait]
    impl CacheBroker for DownBroker {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn set(&self, _key: &str, _value: String, _ttl: Duration) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn delete(&self, _keys: &[String]) -> Result<usize, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }

        async fn keys_with_prefix(&self, _prefix: &str) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn set_then_get_returns_value() {
        let cache = TieredCache::new(Arc::new(MemoryBroker::new()), "test");
        assert!(cache.set("k", "v".to_string(), None).await);
        assert_eq!(cache.get("k").await, Some("v".to_string()));
    }

    #[tokio::test]
    async fn keys_are_namespaced_in_shared_tier() {
        let broker = Arc::new(MemoryBroker::new());
        let cache = TieredCache::new(broker.clone(), "deploy-a");
        cache.set("data:stats", "1".to_string(), None).await;

        assert_eq!(
            broker.get("deploy-a:data:stats").await.unwrap(),
            Some("1".to_string())
        );
        assert_eq!(broker.get("data:stats").await.unwrap(), None);
    }

    #[tokio::test]
    async fn shared_hit_populates_local_tier() {
        let broker = Arc::new(CountingBroker::default());
        broker
            .inner
            .set("ns:hot", "value".to_string(), Duration::from_secs(30))
            .await
            .unwrap();
        let cache = TieredCache::new(broker.clone(), "ns");

        assert_eq!(cache.get("hot").await, Some("value".to_string()));
        assert_eq!(broker.gets.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get("hot").await, Some("value".to_string()));
        assert_eq!(cache.get("hot").await, Some("value".to_string()));
        assert_eq!(broker.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_local_entry_falls_back_to_shared() {
        let broker = Arc::new(CountingBroker::default());
        let cache = TieredCache::new(broker.clone(), "ns");
        cache
            .set("k", "v".to_string(), Some(Duration::from_secs(600)))
            .await;

        assert_eq!(cache.get("k").await, Some("v".to_string()));
        assert_eq!(broker.gets.load(Ordering::SeqCst), 0);

        tokio::time::advance(LOCAL_TTL + Duration::from_secs(1)).await;
        assert_eq!(cache.get("k").await, Some("v".to_string()));
        assert_eq!(broker.gets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn pattern_invalidation_removes_matching_keys() {
        let cache = TieredCache::new(Arc::new(MemoryBroker::new()), "ns");
        cache.set("data:stats", "1".to_string(), None).await;
        cache.set("data:stats:realtime", "2".to_string(), None).await;
        cache.set("data:list:limit=50", "3".to_string(), None).await;

        let removed = cache.invalidate_pattern("data:stats*").await;

        assert_eq!(removed, 2);
        assert_eq!(cache.get("data:stats").await, None);
        assert_eq!(cache.get("data:stats:realtime").await, None);
        assert_eq!(cache.get("data:list:limit=50").await, Some("3".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn pattern_invalidation_reclaims_expired_keys() {
        let broker = Arc::new(MemoryBroker::new());
        let cache = TieredCache::new(broker.clone(), "ns");
        for i in 0..1000 {
            cache
                .set(&format!("data:stats:type=t{i}"), "{}".to_string(), Some(Duration::from_secs(30)))
                .await;
        }

        tokio::time::advance(Duration::from_secs(120)).await;
        cache.invalidate_pattern("data:stats*").await;

        assert!(broker.is_empty());
        assert!(cache.local.is_empty());
    }

    #[tokio::test]
    async fn pattern_without_wildcard_is_exact() {
        let cache = TieredCache::new(Arc::new(MemoryBroker::new()), "ns");
        cache.set("data:stats", "1".to_string(), None).await;
        cache.set("data:stats:realtime", "2".to_string(), None).await;

        assert_eq!(cache.invalidate_pattern("data:stats").await, 1);
        assert_eq!(cache.get("data:stats:realtime").await, Some("2".to_string()));
    }

    #[tokio::test]
    async fn broker_failures_degrade_to_miss() {
        let cache = TieredCache::new(Arc::new(DownBroker), "ns");

        assert!(!cache.set("k", "v".to_string(), None).await);
        assert_eq!(cache.invalidate_pattern("data:*").await, 0);
        assert!(!cache.invalidate("k").await);
        assert_eq!(cache.get("missing").await, None);
    }

    #[tokio::test]
    async fn json_round_trip_and_corrupt_values() {
        let cache = TieredCache::new(Arc::new(MemoryBroker::new()), "ns");
        cache.set_json("nums", &vec![1, 2, 3], None).await;
        assert_eq!(cache.get_json::<Vec<i32>>("nums").await, Some(vec![1, 2, 3]));

        cache.set("bad", "{not json".to_string(), None).await;
        assert_eq!(cache.get_json::<Vec<i32>>("bad").await, None);
    }

    #[test]
    fn glob_matching() {
        assert!(glob_match("ns:data:*", "ns:data:stats"));
        assert!(glob_match("ns:data:*", "ns:data:"));
        assert!(glob_match("ns:*:stats", "ns:data:stats"));
        assert!(glob_match("ns:data:stats", "ns:data:stats"));
        assert!(!glob_match("ns:data:stats", "ns:data:stats:x"));
        assert!(!glob_match("ns:*:stats", "ns:data:list"));
        assert!(!glob_match("ns:data:*", "other:data:stats"));
        assert!(glob_match("ns:a*a", "ns:aa"));
        assert!(!glob_match("ns:ab*ba", "ns:aba"));
    }
}
