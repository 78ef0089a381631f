//! L1: in-process, time-bounded key/value layer
//!
//! Entries live in a capacity-bounded Moka cache but expiry is ours: every
//! entry records when it was inserted and the clear-epoch it belongs to, and
//! is checked on each read. Stale entries are evicted lazily by the read that
//! finds them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::ops::compute::{CompResult, Op};
use moka::sync::Cache;
use tokio::time::Instant;
use tracing::debug;

use crate::Outcome;

/// A value held by the local layer. Never mutated after insert.
#[derive(Debug)]
pub struct CacheEntry<V> {
    pub value: Arc<V>,
    pub inserted_at: Instant,
    epoch: u64,
}

impl<V> Clone for CacheEntry<V> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
            inserted_at: self.inserted_at,
            epoch: self.epoch,
        }
    }
}

impl<V> CacheEntry<V> {
    fn is_valid(&self, now: Instant, ttl: Duration, epoch: u64) -> bool {
        self.epoch == epoch && now.saturating_duration_since(self.inserted_at) < ttl
    }
}

/// In-process cache layer with per-entry TTL and epoch-based clear
pub struct LocalLayer<V> {
    entries: Cache<String, CacheEntry<V>>,
    ttl: Duration,
    epoch: AtomicU64,
}

impl<V> LocalLayer<V>
where
    V: Send + Sync + 'static,
{
    pub fn new(ttl: Duration, max_capacity: u64) -> Self {
        Self {
            entries: Cache::builder().max_capacity(max_capacity).build(),
            ttl,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Return the value for `key` if it is present and still valid
    pub fn try_get(&self, key: &str) -> Outcome<Arc<V>> {
        let Some(entry) = self.entries.get(key) else {
            return Outcome::not_found();
        };

        let epoch = self.epoch.load(Ordering::Acquire);
        if entry.is_valid(Instant::now(), self.ttl, epoch) {
            return Outcome::success(entry.value);
        }

        self.evict_stale(key);
        Outcome::not_found()
    }

    /// Insert or overwrite `key`, starting a new TTL window
    pub fn add(&self, key: &str, value: Arc<V>) -> Outcome {
        let entry = CacheEntry {
            value,
            inserted_at: Instant::now(),
            epoch: self.epoch.load(Ordering::Acquire),
        };
        self.entries.insert(key.to_owned(), entry);
        Outcome::done()
    }

    /// Remove `key`. Removing an absent key is a not-found outcome.
    pub fn remove(&self, key: &str) -> Outcome {
        match self.entries.remove(key) {
            Some(_) => Outcome::done(),
            None => Outcome::not_found(),
        }
    }

    /// Invalidate every entry inserted before this call
    pub fn clear(&self) {
        let previous = self.epoch.fetch_add(1, Ordering::AcqRel);
        debug!("L1 cleared (epoch {} -> {})", previous, previous + 1);
    }

    /// Whether the map physically holds `key`, valid or not
    pub fn is_resident(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    // Re-check under the per-key compute lock so an entry written between
    // our read and this eviction survives.
    fn evict_stale(&self, key: &str) -> bool {
        let ttl = self.ttl;
        let epoch = self.epoch.load(Ordering::Acquire);
        let now = Instant::now();
        let result = self
            .entries
            .entry_by_ref(key)
            .and_compute_with(|current| match current {
                Some(entry) if !entry.value().is_valid(now, ttl, epoch) => Op::Remove,
                _ => Op::Nop,
            });
        let evicted = matches!(result, CompResult::Removed(_));
        if evicted {
            debug!("L1 evicted stale entry for key: {}", key);
        }
        evicted
    }
}
