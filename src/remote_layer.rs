//! L2: typed, namespaced and circuit-broken access to the remote store

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache_key::short_type_name;
use crate::error::ErrorKind;
use crate::{CacheError, Cacheable, Outcome, RemoteHealth, RemoteStore};

/// Message returned while the circuit is open
pub const REMOTE_UNAVAILABLE: &str = "remote cache is unavailable";

/// Remote cache layer for values of type `V`.
///
/// Keys are stored as `{instance}:{TypeName}:{key}` so independent caches
/// sharing one store never collide. Values travel as JSON strings. Every
/// store call is bounded by the operation timeout; a call that runs past it
/// counts as unreachable.
pub struct RemoteLayer<V> {
    store: Arc<dyn RemoteStore>,
    health: RemoteHealth,
    prefix: String,
    ttl: Duration,
    operation_timeout: Duration,
    _value: PhantomData<fn() -> V>,
}

impl<V: Cacheable> RemoteLayer<V> {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        health: RemoteHealth,
        instance_name: &str,
        ttl: Duration,
        operation_timeout: Duration,
    ) -> Self {
        Self {
            store,
            health,
            prefix: format!("{}:{}", instance_name, short_type_name::<V>()),
            ttl,
            operation_timeout,
            _value: PhantomData,
        }
    }

    pub fn health(&self) -> &RemoteHealth {
        &self.health
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Fully qualified key as stored remotely
    pub fn format_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    pub async fn try_get(&self, key: &str) -> Outcome<V> {
        let Some(_admission) = self.health.admit() else {
            debug!("L2 bypassed (circuit open) for key: {}", key);
            return Outcome::failure(ErrorKind::Unreachable, REMOTE_UNAVAILABLE);
        };

        let remote_key = self.format_key(key);
        let json = match self.bounded(self.store.get(&remote_key)).await {
            Ok(Some(json)) => json,
            Ok(None) => {
                self.health.set_healthy();
                return Outcome::not_found();
            }
            Err(e) => return self.fail(key, "GET", e),
        };
        self.health.set_healthy();

        match serde_json::from_str::<V>(&json) {
            Ok(value) => Outcome::success(value),
            Err(e) => {
                warn!(
                    "Failed to deserialize L2 value for key {}: {}. Deleting corrupt entry.",
                    key, e
                );
                if let Err(del_err) = self.bounded(self.store.delete(&remote_key)).await {
                    warn!(
                        "Failed to delete corrupt L2 entry for key {} (remote key: {}): {}",
                        key, remote_key, del_err
                    );
                }
                Outcome::from_error(&CacheError::Serialization(e))
            }
        }
    }

    /// Store `value` with the layer's TTL
    pub async fn try_add(&self, key: &str, value: &V) -> Outcome {
        self.try_add_with_ttl(key, value, self.ttl).await
    }

    pub async fn try_add_with_ttl(&self, key: &str, value: &V, ttl: Duration) -> Outcome {
        let json = match serde_json::to_string(value) {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to serialize value for L2 key {}: {}", key, e);
                return Outcome::from_error(&CacheError::Serialization(e));
            }
        };

        let Some(_admission) = self.health.admit() else {
            debug!("L2 write skipped (circuit open) for key: {}", key);
            return Outcome::failure(ErrorKind::Unreachable, REMOTE_UNAVAILABLE);
        };

        let remote_key = self.format_key(key);
        let ttl = ttl.max(Duration::from_secs(1));
        match self.bounded(self.store.set(&remote_key, json, ttl)).await {
            Ok(true) => {
                self.health.set_healthy();
                Outcome::done()
            }
            Ok(false) => {
                self.health.set_healthy();
                match self.bounded(self.store.exists(&remote_key)).await {
                    Ok(false) => info!("Object with key {} was not recorded", remote_key),
                    Ok(true) => {}
                    Err(e) => debug!("Could not verify L2 write for {}: {}", remote_key, e),
                }
                Outcome::done()
            }
            Err(e) => self.fail(key, "SET", e),
        }
    }

    /// Delete `key`. An absent key is a not-found outcome.
    pub async fn remove(&self, key: &str) -> Outcome {
        let Some(_admission) = self.health.admit() else {
            return Outcome::failure(ErrorKind::Unreachable, REMOTE_UNAVAILABLE);
        };

        let remote_key = self.format_key(key);
        match self.bounded(self.store.delete(&remote_key)).await {
            Ok(true) => {
                self.health.set_healthy();
                Outcome::done()
            }
            Ok(false) => {
                self.health.set_healthy();
                Outcome::not_found()
            }
            Err(e) => self.fail(key, "DEL", e),
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, CacheError>>,
    ) -> Result<T, CacheError> {
        match tokio::time::timeout(self.operation_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Unreachable(format!(
                "no answer within {:?}",
                self.operation_timeout
            ))),
        }
    }

    fn fail<T>(&self, key: &str, op: &str, e: CacheError) -> Outcome<T> {
        if e.is_unreachable() {
            warn!("L2 {} failed for key {}: {}. Opening circuit.", op, key, e);
            self.health.record_failure();
        } else {
            warn!("L2 {} error for key {}: {}", op, key, e);
        }
        Outcome::from_error(&e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{HealthState, MemoryStore};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct User {
        id: u32,
        name: String,
    }

    fn setup() -> (Arc<MemoryStore>, RemoteLayer<User>) {
        let store = Arc::new(MemoryStore::new());
        let layer = RemoteLayer::new(
            store.clone(),
            RemoteHealth::new(Duration::from_secs(30), 1),
            "svc",
            Duration::from_secs(60),
            Duration::from_secs(2),
        );
        (store, layer)
    }

    fn alice() -> User {
        User {
            id: 1,
            name: "alice".into(),
        }
    }

    #[tokio::test]
    async fn test_round_trip_and_namespacing() {
        let (store, layer) = setup();
        assert!(layer.try_add("1", &alice()).await.is_success());

        assert!(store.peek("svc:User:1").await.is_some());
        let hit = layer.try_get("1").await;
        assert_eq!(hit.into_data(), Some(alice()));
        assert_eq!(layer.health().state(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn test_miss_is_not_found() {
        let (_store, layer) = setup();
        let miss = layer.try_get("nope").await;
        assert!(miss.is_not_found());
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_opens_circuit() {
        let (store, layer) = setup();
        store.set_unreachable(true);

        let failed = layer.try_add("1", &alice()).await;
        assert_eq!(failed.kind(), Some(ErrorKind::Unreachable));
        assert_eq!(layer.health().state(), HealthState::Unhealthy);

        let calls = store.calls();
        let bypassed = layer.try_get("1").await;
        assert_eq!(bypassed.error_message(), REMOTE_UNAVAILABLE);
        assert_eq!(store.calls(), calls, "no network call while open");

        store.set_unreachable(false);
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(layer.try_get("1").await.is_not_found());
        assert_eq!(store.calls(), calls + 1);
        assert_eq!(layer.health().state(), HealthState::Healthy);
    }

    /// Accepts every call and never answers
    struct StalledStore;

    #[async_trait::async_trait]
    impl RemoteStore for StalledStore {
        async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
            std::future::pending().await
        }
        async fn set(&self, _: &str, _: String, _: Duration) -> Result<bool, CacheError> {
            std::future::pending().await
        }
        async fn delete(&self, _key: &str) -> Result<bool, CacheError> {
            std::future::pending().await
        }
        async fn exists(&self, _key: &str) -> Result<bool, CacheError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_store_times_out_and_opens_circuit() {
        let layer: RemoteLayer<User> = RemoteLayer::new(
            Arc::new(StalledStore),
            RemoteHealth::new(Duration::from_secs(30), 1),
            "svc",
            Duration::from_secs(60),
            Duration::from_secs(2),
        );

        let started = tokio::time::Instant::now();
        let outcome = layer.try_get("1").await;
        assert_eq!(outcome.kind(), Some(ErrorKind::Unreachable));
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_secs(3));
        assert_eq!(layer.health().state(), HealthState::Unhealthy);

        // cooldown over: a stalled write and delete give up the same way
        tokio::time::advance(Duration::from_secs(30)).await;
        let written = layer.try_add("1", &alice()).await;
        assert_eq!(written.kind(), Some(ErrorKind::Unreachable));

        tokio::time::advance(Duration::from_secs(30)).await;
        let removed = layer.remove("1").await;
        assert_eq!(removed.kind(), Some(ErrorKind::Unreachable));
        assert_eq!(layer.health().state(), HealthState::Unhealthy);
    }

    #[tokio::test]
    async fn test_corrupt_value_is_reported_and_deleted() {
        let (store, layer) = setup();
        layer.health().set_healthy();
        store
            .plant("svc:User:1", "{not json", Duration::from_secs(60))
            .await;

        let outcome = layer.try_get("1").await;
        assert_eq!(outcome.kind(), Some(ErrorKind::Serialization));
        assert_eq!(layer.health().state(), HealthState::Healthy);
        assert_eq!(store.peek("svc:User:1").await, None);
    }

    #[tokio::test]
    async fn test_unconfirmed_write_is_soft_failure() {
        let (store, layer) = setup();
        store.set_drop_writes(true);
        let outcome = layer.try_add("1", &alice()).await;
        assert!(outcome.is_success());
        assert!(layer.try_get("1").await.is_not_found());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (_store, layer) = setup();
        let _ = layer.try_add("1", &alice()).await;
        assert!(layer.remove("1").await.is_success());
        assert!(layer.remove("1").await.is_not_found());
    }
}
