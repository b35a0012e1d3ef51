//! Shared cache tier: the broker trait and an in-memory implementation.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Errors raised by a shared cache broker.
///
/// These never leave the cache layer; `TieredCache` logs and swallows them.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("cache broker unavailable: {0}")]
    Unavailable(String),
    #[error("cache value serialization failed: {0}")]
    Serialize(String),
}

/// Primitive operations of the shared (cross-process) cache tier.
#[async_trait]
pub trait CacheBroker: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError>;

    /// Delete the given keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError>;

    /// List live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError>;
}

struct BrokerEntry {
    value: String,
    expires_at: Instant,
}

/// Writes between full expiry sweeps.
pub(crate) const SWEEP_EVERY: usize = 256;

/// In-memory broker with per-entry expiry.
///
/// Stands in for a networked key/value store in single-node deployments
/// and tests. Expired entries are removed on access, by prefix listings,
/// and by a sweep every `SWEEP_EVERY` writes.
#[derive(Default)]
pub struct MemoryBroker {
    entries: DashMap<String, BrokerEntry>,
    writes: AtomicUsize,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including ones not yet lazily expired.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every expired entry, returning how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        before.saturating_sub(self.entries.len())
    }
}

#[async_trait]
impl CacheBroker for MemoryBroker {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        } else {
            return Ok(None);
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        self.entries.insert(
            key.to_string(),
            BrokerEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        if self.writes.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, CacheError> {
        Ok(keys
            .iter()
            .filter(|key| self.entries.remove(key.as_str()).is_some())
            .count())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, CacheError> {
        let now = Instant::now();
        let mut keys = Vec::new();
        self.entries.retain(|key, entry| {
            if entry.expires_at <= now {
                return false;
            }
            if key.starts_with(prefix) {
                keys.push(key.clone());
            }
            true
        });
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_then_get() {
        let broker = MemoryBroker::new();
        broker
            .set("a", "1".to_string(), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(broker.get("a").await.unwrap(), Some("1".to_string()));
        assert_eq!(broker.get("b").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let broker = MemoryBroker::new();
        broker
            .set("a", "1".to_string(), Duration::from_secs(5))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(broker.get("a").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(broker.get("a").await.unwrap().is_none());
        assert!(broker.is_empty());
    }

    #[tokio::test]
    async fn prefix_listing_and_bulk_delete() {
        let broker = MemoryBroker::new();
        for key in ["ns:data:stats", "ns:data:list:1", "ns:other"] {
            broker
                .set(key, "v".to_string(), Duration::from_secs(10))
                .await
                .unwrap();
        }

        let mut keys = broker.keys_with_prefix("ns:data:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["ns:data:list:1", "ns:data:stats"]);

        let removed = broker.delete(&keys).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(broker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prefix_listing_drops_expired_entries() {
        let broker = MemoryBroker::new();
        for i in 0..100 {
            let key = format!("ns:data:stats:type=t{i}");
            broker
                .set(&key, "v".to_string(), Duration::from_secs(30))
                .await
                .unwrap();
        }
        broker
            .set("ns:fresh", "v".to_string(), Duration::from_secs(600))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(broker.keys_with_prefix("ns:data:stats").await.unwrap().is_empty());
        assert_eq!(broker.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_sweep_expired_entries() {
        let broker = MemoryBroker::new();
        for i in 0..SWEEP_EVERY - 1 {
            broker
                .set(&format!("old:{i}"), "v".to_string(), Duration::from_secs(1))
                .await
                .unwrap();
        }
        tokio::time::advance(Duration::from_secs(2)).await;

        broker
            .set("new", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(broker.len(), 1);
    }
}
