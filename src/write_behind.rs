//! Write-behind queue for L2
//!
//! Writes are acknowledged once L1 holds the value; the L2 copy is queued
//! here and flushed by a background task, periodically or as soon as a full
//! batch is waiting. Queued writes to the same key coalesce (latest value
//! wins), and a key being flushed is never picked up by a second concurrent
//! flush: a newer value queued meanwhile waits for the next round. A key
//! removed while its write is in flight is deleted again once that write
//! lands.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::{Cacheable, HealthState, RemoteLayer};

struct Book<V> {
    pending: HashMap<String, Arc<V>>,
    in_flight: HashSet<String>,
    /// In-flight keys removed by the caller before their write landed
    removed: HashSet<String>,
}

struct QueueState<V> {
    remote: Arc<RemoteLayer<V>>,
    book: Mutex<Book<V>>,
    wake: Notify,
    /// Signalled whenever in-flight keys are released
    settled: Notify,
    batch_size: usize,
}

/// Deferred L2 writer with its own flusher task
pub struct WriteQueue<V> {
    state: Arc<QueueState<V>>,
    shutdown_tx: watch::Sender<bool>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl<V: Cacheable> WriteQueue<V> {
    /// Spawn the flusher on the current tokio runtime
    pub fn start(remote: Arc<RemoteLayer<V>>, interval: Duration, batch_size: usize) -> Self {
        let state = Arc::new(QueueState {
            remote,
            book: Mutex::new(Book {
                pending: HashMap::new(),
                in_flight: HashSet::new(),
                removed: HashSet::new(),
            }),
            wake: Notify::new(),
            settled: Notify::new(),
            batch_size: batch_size.max(1),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flusher = tokio::spawn(run_flusher(
            Arc::clone(&state),
            interval.max(Duration::from_millis(1)),
            shutdown_rx,
        ));

        Self {
            state,
            shutdown_tx,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    /// Queue the L2 write of `value` under `key`, replacing any queued value
    pub fn enqueue(&self, key: &str, value: Arc<V>) {
        let queued = {
            let mut book = lock(&self.state.book);
            book.pending.insert(key.to_owned(), value);
            book.pending.len()
        };
        if queued >= self.state.batch_size {
            self.state.wake.notify_one();
        }
    }

    /// Drop the queued write for `key`. A write already in flight is
    /// followed by a delete once it lands. Returns whether anything was
    /// queued or in flight.
    pub fn discard(&self, key: &str) -> bool {
        let mut book = lock(&self.state.book);
        let queued = book.pending.remove(key).is_some();
        let writing = book.in_flight.contains(key);
        if writing {
            book.removed.insert(key.to_owned());
        }
        queued || writing
    }

    pub fn pending_len(&self) -> usize {
        lock(&self.state.book).pending.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.state.book).in_flight.contains(key)
    }

    /// Write everything queued so far, waiting for concurrent flushes too
    pub async fn flush(&self) {
        self.state.drain().await;
    }

    /// Final drain, then stop the flusher. Later writes are flushed only by
    /// explicit [`flush`](Self::flush) calls.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = lock(&self.flusher).take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!("Write-behind flusher ended abnormally: {}", e);
        }
    }
}

/// Releases a batch's keys from the in-flight set, also when the flush
/// future is dropped midway.
struct InFlightBatch<'a, V> {
    state: &'a QueueState<V>,
    keys: Vec<String>,
}

impl<V> Drop for InFlightBatch<'_, V> {
    fn drop(&mut self) {
        {
            let mut book = lock(&self.state.book);
            for key in &self.keys {
                book.in_flight.remove(key);
                book.removed.remove(key);
            }
        }
        self.state.settled.notify_waiters();
    }
}

impl<V: Cacheable> QueueState<V> {
    /// Flush one batch of keys that are not already in flight.
    /// Returns how many writes were issued.
    async fn flush_round(&self) -> usize {
        let batch: Vec<(String, Arc<V>)> = {
            let mut guard = lock(&self.book);
            let book = &mut *guard;
            let keys: Vec<String> = book
                .pending
                .keys()
                .filter(|key| !book.in_flight.contains(*key))
                .take(self.batch_size)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|key| {
                    let value = book.pending.remove(&key)?;
                    book.in_flight.insert(key.clone());
                    Some((key, value))
                })
                .collect()
        };
        if batch.is_empty() {
            return 0;
        }
        let mut release = InFlightBatch {
            state: self,
            keys: batch.iter().map(|(key, _)| key.clone()).collect(),
        };

        // Until the store is known healthy only one probe is admitted, so
        // write one at a time rather than have the rest of the batch refused.
        let outcomes = if self.remote.health().state() == HealthState::Healthy {
            join_all(
                batch
                    .iter()
                    .map(|(key, value)| self.remote.try_add(key, value)),
            )
            .await
        } else {
            let mut outcomes = Vec::with_capacity(batch.len());
            for (key, value) in &batch {
                outcomes.push(self.remote.try_add(key, value).await);
            }
            outcomes
        };

        let mut failed = 0;
        for ((key, _), outcome) in batch.iter().zip(&outcomes) {
            if !outcome.is_success() {
                failed += 1;
                debug!(
                    "Write-behind L2 write dropped for key {}: {}",
                    key,
                    outcome.error_message()
                );
            }
        }
        if failed > 0 {
            warn!(
                "Write-behind flush: {} of {} L2 writes failed",
                failed,
                batch.len()
            );
        }

        // Release what was written; keys removed meanwhile stay in flight
        // until they are deleted again.
        let removed_meanwhile: Vec<String> = {
            let mut book = lock(&self.book);
            let (removed, written): (Vec<String>, Vec<String>) = release
                .keys
                .drain(..)
                .partition(|key| book.removed.remove(key));
            for key in &written {
                book.in_flight.remove(key);
            }
            release.keys.clone_from(&removed);
            removed
        };
        self.settled.notify_waiters();

        for key in &removed_meanwhile {
            debug!("Key {} was removed during its L2 write; deleting it", key);
            let deleted = self.remote.remove(key).await;
            if !deleted.is_success() && !deleted.is_not_found() {
                warn!(
                    "Could not delete removed key {} after its L2 write: {}",
                    key,
                    deleted.error_message()
                );
            }
        }

        batch.len()
    }

    fn is_drained(&self) -> bool {
        let book = lock(&self.book);
        book.pending.is_empty() && book.in_flight.is_empty()
    }

    fn has_in_flight(&self) -> bool {
        !lock(&self.book).in_flight.is_empty()
    }

    async fn drain(&self) {
        loop {
            // registered before the round so no release is missed
            let settled = self.settled.notified();
            let written = self.flush_round().await;
            if self.is_drained() {
                return;
            }
            if written == 0 && self.has_in_flight() {
                // everything left is being written by another flush
                settled.await;
            }
        }
    }
}

async fn run_flusher<V: Cacheable>(
    state: Arc<QueueState<V>>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = state.wake.notified() => {}
            _ = shutdown_rx.changed() => {
                state.drain().await;
                debug!("Write-behind flusher stopped");
                return;
            }
        }
        // keep going while full batches are waiting
        while state.flush_round().await >= state.batch_size {}
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryStore, RemoteHealth};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use crate::{CacheError, RemoteStore};

    /// Counts concurrent SETs per key to catch double flushes
    #[derive(Default)]
    struct GatedStore {
        inner: MemoryStore,
        active: Mutex<HashMap<String, usize>>,
        overlaps: AtomicUsize,
        sets: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for GatedStore {
        async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<bool, CacheError> {
            {
                let mut active = lock(&self.active);
                let n = active.entry(key.to_owned()).or_default();
                *n += 1;
                if *n > 1 {
                    self.overlaps.fetch_add(1, Ordering::SeqCst);
                }
            }
            self.sets.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            let result = self.inner.set(key, value, ttl).await;
            *lock(&self.active).entry(key.to_owned()).or_default() -= 1;
            result
        }

        async fn delete(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.delete(key).await
        }

        async fn exists(&self, key: &str) -> Result<bool, CacheError> {
            self.inner.exists(key).await
        }
    }

    fn remote(store: Arc<dyn RemoteStore>) -> Arc<RemoteLayer<String>> {
        Arc::new(RemoteLayer::new(
            store,
            RemoteHealth::new(Duration::from_secs(30), 1),
            "wb",
            Duration::from_secs(60),
            Duration::from_secs(2),
        ))
    }

    #[tokio::test]
    async fn test_enqueue_then_flush() {
        let store = Arc::new(MemoryStore::new());
        let queue = WriteQueue::start(remote(store.clone()), Duration::from_secs(60), 16);

        queue.enqueue("a", Arc::new("1".to_owned()));
        queue.enqueue("b", Arc::new("2".to_owned()));
        assert_eq!(queue.pending_len(), 2);
        assert_eq!(store.peek("wb:String:a").await, None);

        queue.flush().await;
        assert_eq!(queue.pending_len(), 0);
        assert_eq!(store.peek("wb:String:a").await.as_deref(), Some("\"1\""));
        assert_eq!(store.peek("wb:String:b").await.as_deref(), Some("\"2\""));
    }

    #[tokio::test]
    async fn test_rewrites_coalesce() {
        let store = Arc::new(GatedStore::default());
        let queue = WriteQueue::start(remote(store.clone()), Duration::from_secs(60), 16);

        for i in 0..5 {
            queue.enqueue("k", Arc::new(i.to_string()));
        }
        assert_eq!(queue.pending_len(), 1);
        queue.flush().await;

        assert_eq!(store.sets.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.peek("wb:String:k").await.as_deref(), Some("\"4\""));
    }

    #[tokio::test]
    async fn test_key_in_flight_is_not_flushed_twice() {
        let store = Arc::new(GatedStore::default());
        let queue = Arc::new(WriteQueue::start(
            remote(store.clone()),
            Duration::from_secs(60),
            16,
        ));

        queue.enqueue("k", Arc::new("old".to_owned()));
        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.is_in_flight("k"));

        queue.enqueue("k", Arc::new("new".to_owned()));
        let second = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.flush().await })
        };
        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(store.overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(store.sets.load(Ordering::SeqCst), 2);
        assert_eq!(
            store.inner.peek("wb:String:k").await.as_deref(),
            Some("\"new\"")
        );
    }

    #[tokio::test]
    async fn test_discard_while_writing_deletes_after_write() {
        let store = Arc::new(GatedStore::default());
        let queue = Arc::new(WriteQueue::start(
            remote(store.clone()),
            Duration::from_secs(60),
            16,
        ));

        queue.enqueue("k", Arc::new("v".to_owned()));
        let flush = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.is_in_flight("k"));

        assert!(queue.discard("k"), "an in-flight write counts as held");
        flush.await.unwrap();

        assert_eq!(store.sets.load(Ordering::SeqCst), 1);
        assert_eq!(store.inner.peek("wb:String:k").await, None);
        assert!(!queue.is_in_flight("k"));

        // the mark does not outlive the write it was set for
        queue.enqueue("k", Arc::new("again".to_owned()));
        queue.flush().await;
        assert_eq!(
            store.inner.peek("wb:String:k").await.as_deref(),
            Some("\"again\"")
        );
    }

    #[tokio::test]
    async fn test_flush_waits_for_concurrent_writer() {
        let store = Arc::new(GatedStore::default());
        let queue = Arc::new(WriteQueue::start(
            remote(store.clone()),
            Duration::from_secs(60),
            16,
        ));

        queue.enqueue("k", Arc::new("v".to_owned()));
        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.flush().await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(queue.is_in_flight("k"));

        // nothing left to pick up, but the write is not done yet
        queue.flush().await;
        assert!(!queue.is_in_flight("k"));
        assert!(store.inner.peek("wb:String:k").await.is_some());
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_batch_wakes_flusher() {
        let store = Arc::new(MemoryStore::new());
        let queue = WriteQueue::start(remote(store.clone()), Duration::from_secs(3600), 2);

        queue.enqueue("a", Arc::new("1".to_owned()));
        queue.enqueue("b", Arc::new("2".to_owned()));

        for _ in 0..100 {
            if queue.pending_len() == 0 && !queue.is_in_flight("a") && !queue.is_in_flight("b") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(store.peek("wb:String:a").await.is_some());
        assert!(store.peek("wb:String:b").await.is_some());
    }

    #[tokio::test]
    async fn test_shutdown_drains() {
        let store = Arc::new(MemoryStore::new());
        let queue = WriteQueue::start(remote(store.clone()), Duration::from_secs(3600), 64);

        queue.enqueue("a", Arc::new("1".to_owned()));
        queue.shutdown().await;
        assert_eq!(queue.pending_len(), 0);
        assert!(store.peek("wb:String:a").await.is_some());
    }

    #[tokio::test]
    async fn test_discard() {
        let store = Arc::new(MemoryStore::new());
        let queue = WriteQueue::start(remote(store.clone()), Duration::from_secs(3600), 64);

        queue.enqueue("a", Arc::new("1".to_owned()));
        assert!(queue.discard("a"));
        assert!(!queue.discard("a"));
        queue.flush().await;
        assert_eq!(store.peek("wb:String:a").await, None);
    }
}
