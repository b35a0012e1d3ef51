//! In-process cache tier.
//!
//! A short-lived shadow of the shared tier. Entries always expire after
//! `LOCAL_TTL` regardless of the TTL requested for the shared tier, which
//! bounds how stale a process can be after another instance writes.

use super::broker::SWEEP_EVERY;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Fixed lifetime of in-process entries.
pub const LOCAL_TTL: Duration = Duration::from_secs(60);

struct LocalEntry {
    value: String,
    expires_at: Instant,
}

impl LocalEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Default)]
pub struct LocalTier {
    entries: DashMap<String, LocalEntry>,
    inserts: AtomicUsize,
}

impl LocalTier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh value for `key`, if any. Stale entries are evicted on the way out.
    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let stale = match self.entries.get(key) {
            Some(entry) if entry.is_fresh(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if stale {
            self.entries.remove_if(key, |_, entry| !entry.is_fresh(now));
        }
        None
    }

    pub fn insert(&self, key: &str, value: String) {
        self.entries.insert(
            key.to_string(),
            LocalEntry {
                value,
                expires_at: Instant::now() + LOCAL_TTL,
            },
        );
        if self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired();
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every entry whose key satisfies `matches`, and any stale entry.
    pub fn remove_matching(&self, matches: impl Fn(&str) -> bool) {
        let now = Instant::now();
        self.entries.retain(|key, entry| entry.is_fresh(now) && !matches(key));
    }

    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
