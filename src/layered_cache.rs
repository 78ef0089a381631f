//! Generic two-layer caching system
//!
//! Composes an in-process layer (L1) with a shared remote layer (L2) in front
//! of a caller-supplied loader:
//! - L1: in-memory, per-entry TTL (fastest)
//! - L2: Redis or any [`RemoteStore`] (shared across instances, circuit-broken)
//! - Loader: database query, HTTP call, ... invoked only on a full miss
//!
//! A lookup checks L1, then L2 (promoting hits into L1), and only then runs
//! the loader, filling L1 first and L2 second. Either layer can be disabled,
//! in which case it is an unconditional miss. L2 writes go out inline or
//! through a write-behind queue depending on [`Strategy`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cache_key::derive_key;
use crate::error::{BoxError, ErrorKind};
use crate::write_behind::WriteQueue;
use crate::{
    CacheConfig, CacheError, LocalLayer, Outcome, RedisStore, RemoteHealth, RemoteLayer,
    RemoteStore, Strategy,
};

/// Trait for types that can be cached
pub trait Cacheable: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}
impl<T> Cacheable for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// A named read-through operation.
///
/// The tag identifies the operation in derived cache keys, so two loaders
/// with different semantics must never share a tag.
#[async_trait::async_trait]
pub trait DataLoader<A, V>: Send + Sync
where
    A: Send + 'static,
{
    /// Stable name of this operation, e.g. `"userById"`
    fn tag(&self) -> &str;

    /// Load the value for `argument`, `None` if it does not exist
    async fn load(&self, argument: A) -> Result<Option<V>, BoxError>;
}

/// Represents an in-flight load that other requests can wait on
type InFlightLoad<V> = watch::Receiver<Option<Outcome<Arc<V>>>>;
type InFlightSender<V> = watch::Sender<Option<Outcome<Arc<V>>>>;

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// When dropped, removes the key from the in-flight map and notifies waiters
/// with a failure if no result was sent.
struct InFlightGuard<'a, V> {
    key: String,
    in_flight: &'a Mutex<HashMap<String, InFlightLoad<V>>>,
    tx: Option<InFlightSender<V>>,
}

impl<V> InFlightGuard<'_, V> {
    /// Complete the load with a result, consuming the guard.
    fn complete(mut self, outcome: &Outcome<Arc<V>>) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(outcome.clone()));
        }
    }
}

impl<V> Drop for InFlightGuard<'_, V> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(Outcome::failure(
                ErrorKind::Unexpected,
                "load was cancelled or panicked",
            )));
        }
        lock(self.in_flight).remove(&self.key);
    }
}

/// Where L2 writes go
enum RemoteWriter<V> {
    Inline,
    Behind(WriteQueue<V>),
}

struct LayeredCacheInner<V> {
    local: Option<LocalLayer<V>>,
    remote: Option<Arc<RemoteLayer<V>>>,
    writer: RemoteWriter<V>,
    single_flight: bool,
    /// Track in-flight loads for request coalescing
    in_flight: Mutex<HashMap<String, InFlightLoad<V>>>,
}

/// Two-layer cache in front of a loader. Clones share the same layers.
pub struct LayeredCache<V: Cacheable> {
    inner: Arc<LayeredCacheInner<V>>,
}

impl<V: Cacheable> Clone for LayeredCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Cacheable> LayeredCache<V> {
    /// Create a cache over `store`, with its own circuit breaker.
    ///
    /// L2 is active only when `config.l2_enabled` is set and a store is given.
    pub async fn new(config: CacheConfig, store: Option<Arc<dyn RemoteStore>>) -> Self {
        let health = RemoteHealth::new(config.health_cooldown, config.failure_threshold);
        Self::with_health(config, store, health).await
    }

    /// Create a cache sharing `health` with other caches over the same store
    pub async fn with_health(
        config: CacheConfig,
        store: Option<Arc<dyn RemoteStore>>,
        health: RemoteHealth,
    ) -> Self {
        let local = config
            .l1_enabled
            .then(|| LocalLayer::new(config.l1_ttl, config.l1_max_capacity));

        let remote = store.filter(|_| config.l2_enabled).map(|store| {
            Arc::new(RemoteLayer::new(
                store,
                health,
                &config.instance_name,
                config.l2_ttl,
                config.operation_timeout,
            ))
        });

        let writer = match (&remote, config.strategy) {
            (Some(remote), Strategy::WriteBehind) => RemoteWriter::Behind(WriteQueue::start(
                Arc::clone(remote),
                config.write_behind_interval,
                config.write_behind_batch_size,
            )),
            _ => RemoteWriter::Inline,
        };

        debug!(
            "Layered cache ready (L1: {}, L2: {}, strategy: {:?})",
            local.is_some(),
            remote.is_some(),
            config.strategy
        );

        Self {
            inner: Arc::new(LayeredCacheInner {
                local,
                remote,
                writer,
                single_flight: config.single_flight,
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Create a cache backed by the Redis server named in `config`
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        let store: Option<Arc<dyn RemoteStore>> = if config.l2_enabled {
            Some(Arc::new(RedisStore::open(&config)?))
        } else {
            None
        };
        Ok(Self::new(config, store).await)
    }

    pub fn local(&self) -> Option<&LocalLayer<V>> {
        self.inner.local.as_ref()
    }

    pub fn remote(&self) -> Option<&RemoteLayer<V>> {
        self.inner.remote.as_deref()
    }

    pub fn health(&self) -> Option<&RemoteHealth> {
        self.remote().map(RemoteLayer::health)
    }

    pub fn strategy(&self) -> Strategy {
        match self.inner.writer {
            RemoteWriter::Inline => Strategy::ReadThrough,
            RemoteWriter::Behind(_) => Strategy::WriteBehind,
        }
    }

    /// Get the value loaded by `tag` for `argument`, using two-layer caching.
    ///
    /// `Err` only for a malformed tag or an argument that cannot be
    /// serialized into a key; everything else is reported in the outcome.
    pub async fn get<A, F, Fut>(
        &self,
        tag: &str,
        argument: A,
        loader: F,
    ) -> Result<Outcome<Arc<V>>, CacheError>
    where
        A: Serialize,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        let key = derive_key(tag, &argument)?;
        Ok(self.get_or_load(&key, move || loader(argument), None).await)
    }

    /// Like [`get`](Self::get), with every L2 round trip bounded by `deadline`.
    ///
    /// An L2 lookup still running at the deadline is abandoned in favour of
    /// the loader; an L2 fill still running is abandoned with a warning.
    pub async fn get_with_deadline<A, F, Fut>(
        &self,
        tag: &str,
        argument: A,
        loader: F,
        deadline: Duration,
    ) -> Result<Outcome<Arc<V>>, CacheError>
    where
        A: Serialize,
        F: FnOnce(A) -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        let key = derive_key(tag, &argument)?;
        let deadline = Instant::now() + deadline;
        Ok(self
            .get_or_load(&key, move || loader(argument), Some(deadline))
            .await)
    }

    /// Get through a [`DataLoader`], keyed by its tag
    pub async fn get_with<A, L>(
        &self,
        loader: &L,
        argument: A,
    ) -> Result<Outcome<Arc<V>>, CacheError>
    where
        A: Serialize + Send + 'static,
        L: DataLoader<A, V>,
    {
        let key = derive_key(loader.tag(), &argument)?;
        Ok(self
            .get_or_load(&key, move || loader.load(argument), None)
            .await)
    }

    /// Check L1 then L2 for `key`, promoting an L2 hit into L1
    pub async fn lookup(&self, key: &str) -> Outcome<Arc<V>> {
        self.lookup_until(key, None).await
    }

    /// Store `value` under an explicit `key` in both layers
    pub async fn add(&self, key: &str, value: V) -> Outcome<Arc<V>> {
        if key.is_empty() {
            return Outcome::failure(ErrorKind::Unexpected, "cache key must not be empty");
        }
        let value = Arc::new(value);
        self.fill(key, &value, None).await;
        Outcome::success(value)
    }

    /// Remove `key` from both layers.
    ///
    /// Succeeds if either layer held the key; a key absent everywhere is a
    /// not-found outcome, so removing twice is safe.
    pub async fn remove(&self, key: &str) -> Outcome {
        debug!("Removing cache entry for key: {}", key);

        let removed_locally = self
            .inner
            .local
            .as_ref()
            .is_some_and(|local| local.remove(key).is_success());

        let discarded = match &self.inner.writer {
            RemoteWriter::Behind(queue) => queue.discard(key),
            RemoteWriter::Inline => false,
        };

        let remote = match &self.inner.remote {
            Some(remote) => remote.remove(key).await,
            None => Outcome::not_found(),
        };

        if removed_locally || discarded || remote.is_success() {
            Outcome::done()
        } else if remote.is_not_found() {
            Outcome::not_found()
        } else {
            remote
        }
    }

    /// Invalidate every L1 entry. L2 is untouched.
    pub fn clear_local(&self) {
        if let Some(local) = &self.inner.local {
            local.clear();
        }
    }

    /// Write every queued L2 write now. No-op for read-through caches.
    pub async fn flush(&self) {
        if let RemoteWriter::Behind(queue) = &self.inner.writer {
            queue.flush().await;
        }
    }

    /// Number of L2 writes waiting in the write-behind queue
    pub fn pending_writes(&self) -> usize {
        match &self.inner.writer {
            RemoteWriter::Behind(queue) => queue.pending_len(),
            RemoteWriter::Inline => 0,
        }
    }

    /// Drain the write-behind queue and stop its flusher
    pub async fn shutdown(&self) {
        if let RemoteWriter::Behind(queue) = &self.inner.writer {
            queue.shutdown().await;
        }
    }

    pub(crate) async fn get_or_load<L, Fut>(
        &self,
        key: &str,
        loader: L,
        deadline: Option<Instant>,
    ) -> Outcome<Arc<V>>
    where
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        let cached = self.lookup_until(key, deadline).await;
        if cached.is_success() {
            return cached;
        }

        if !self.inner.single_flight {
            return self.load_and_fill(key, loader, deadline).await;
        }

        // Join an in-flight load for this key, or register ours
        let (tx, rx) = watch::channel(None);
        let existing = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.get(key) {
                Some(rx) => Some(rx.clone()),
                None => {
                    in_flight.insert(key.to_owned(), rx);
                    None
                }
            }
        };

        if let Some(rx) = existing {
            debug!("Waiting for in-flight load for key: {}", key);
            return match wait_for(rx, deadline).await {
                Some(outcome) => outcome,
                None => {
                    warn!(
                        "Deadline elapsed waiting for in-flight load of key {}; loading directly",
                        key
                    );
                    self.load_and_fill(key, loader, deadline).await
                }
            };
        }

        // The guard ensures cleanup happens even on panic/cancellation
        let guard = InFlightGuard {
            key: key.to_owned(),
            in_flight: &self.inner.in_flight,
            tx: Some(tx),
        };
        let outcome = self.load_and_fill(key, loader, deadline).await;
        guard.complete(&outcome);
        outcome
    }

    async fn lookup_until(&self, key: &str, deadline: Option<Instant>) -> Outcome<Arc<V>> {
        if let Some(local) = &self.inner.local {
            let hit = local.try_get(key);
            if hit.is_success() {
                debug!("Cache hit L1 for key: {}", key);
                return hit;
            }
            debug!("Cache miss L1 for key: {}", key);
        }

        let Some(remote) = &self.inner.remote else {
            return Outcome::not_found();
        };

        let fetched = match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, remote.try_get(key)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!("L2 lookup for key {} abandoned at deadline", key);
                    return Outcome::not_found();
                }
            },
            None => remote.try_get(key).await,
        };

        match fetched.into_data() {
            Some(value) => {
                debug!("Cache hit L2 for key: {}", key);
                let value = Arc::new(value);
                // Promote into L1 - best effort
                if let Some(local) = &self.inner.local {
                    let _ = local.add(key, Arc::clone(&value));
                }
                Outcome::success(value)
            }
            None => {
                debug!("Cache miss L2 for key: {}", key);
                Outcome::not_found()
            }
        }
    }

    async fn load_and_fill<L, Fut>(
        &self,
        key: &str,
        loader: L,
        deadline: Option<Instant>,
    ) -> Outcome<Arc<V>>
    where
        L: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        match loader().await {
            Ok(Some(value)) => {
                debug!("Cache miss - loaded value for key: {}", key);
                let value = Arc::new(value);
                self.fill(key, &value, deadline).await;
                Outcome::success(value)
            }
            Ok(None) => {
                debug!("Value not found for key: {}", key);
                Outcome::not_found()
            }
            Err(e) => {
                error!("Loader error for key {}: {}", key, e);
                Outcome::from_error(&CacheError::Loader(e))
            }
        }
    }

    /// Populate L1, then L2. An L2 failure never undoes the L1 write.
    pub(crate) async fn fill(&self, key: &str, value: &Arc<V>, deadline: Option<Instant>) {
        if let Some(local) = &self.inner.local {
            let _ = local.add(key, Arc::clone(value));
        }

        let Some(remote) = &self.inner.remote else {
            return;
        };

        match &self.inner.writer {
            RemoteWriter::Behind(queue) => queue.enqueue(key, Arc::clone(value)),
            RemoteWriter::Inline => {
                let written = match deadline {
                    Some(deadline) => {
                        match tokio::time::timeout_at(deadline, remote.try_add(key, value)).await {
                            Ok(outcome) => outcome,
                            Err(_) => {
                                warn!("L2 write for key {} abandoned at deadline", key);
                                return;
                            }
                        }
                    }
                    None => remote.try_add(key, value).await,
                };
                if !written.is_success() {
                    debug!(
                        "L2 fill skipped for key {}: {}. Continuing.",
                        key,
                        written.error_message()
                    );
                }
            }
        }
    }
}

async fn wait_for<V>(
    mut rx: InFlightLoad<V>,
    deadline: Option<Instant>,
) -> Option<Outcome<Arc<V>>> {
    let wait = async {
        loop {
            let ready = rx.borrow().clone();
            if let Some(outcome) = ready {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without sending - treat as error
                return Outcome::failure(ErrorKind::Unexpected, "in-flight load was cancelled");
            }
        }
    };
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, wait).await.ok(),
        None => Some(wait.await),
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
