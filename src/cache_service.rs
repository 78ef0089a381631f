//! Model-keyed cache services
//!
//! A [`CacheService`] caches one model type under `{TypeName}_{id}` keys on
//! top of a [`LayeredCache`]. The [`Strategy`] in its configuration decides
//! how L2 is written:
//!
//! - `ReadThrough`: L1 and L2 are both written before a call returns
//! - `WriteBehind`: L1 is written before a call returns, L2 by a background
//!   flusher

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::cache_key::model_key;
use crate::error::BoxError;
use crate::{
    CacheConfig, CacheError, Cacheable, Identified, LayeredCache, Outcome, RemoteStore, Strategy,
};

pub struct CacheService<V: Cacheable> {
    cache: LayeredCache<V>,
}

impl<V: Cacheable> Clone for CacheService<V> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
        }
    }
}

impl<V: Cacheable> CacheService<V> {
    pub async fn new(config: CacheConfig, store: Option<Arc<dyn RemoteStore>>) -> Self {
        Self {
            cache: LayeredCache::new(config, store).await,
        }
    }

    /// Create a service backed by the Redis server named in `config`
    pub async fn connect(config: CacheConfig) -> Result<Self, CacheError> {
        Ok(Self {
            cache: LayeredCache::connect(config).await?,
        })
    }

    pub fn from_cache(cache: LayeredCache<V>) -> Self {
        Self { cache }
    }

    /// The underlying layered cache
    pub fn cache(&self) -> &LayeredCache<V> {
        &self.cache
    }

    pub fn strategy(&self) -> Strategy {
        self.cache.strategy()
    }

    /// Get the model with `id`, loading it with `loader` on a full miss
    pub async fn get_data<F, Fut>(&self, id: &str, loader: F) -> Outcome<Arc<V>>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        let key = model_key::<V>(id);
        let id = id.to_owned();
        self.cache.get_or_load(&key, move || loader(id), None).await
    }

    /// Tag-keyed read-through, same as [`LayeredCache::get`]
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
        self.cache.get(tag, argument, loader).await
    }

    /// Cache `value` as the model with `id`
    pub async fn add_data(&self, id: &str, value: V) -> Outcome<Arc<V>> {
        self.cache.add(&model_key::<V>(id), value).await
    }

    /// Persist `model` through `persist` (e.g. a database insert), then cache
    /// what it returns under that value's own id.
    ///
    /// Nothing is cached when `persist` fails or returns `None`.
    pub async fn add_with<F, Fut>(&self, persist: F, model: V) -> Outcome<Arc<V>>
    where
        V: Identified,
        F: FnOnce(V) -> Fut,
        Fut: Future<Output = Result<Option<V>, BoxError>>,
    {
        match persist(model).await {
            Ok(Some(stored)) => {
                let id = stored.cache_id();
                debug!("Persisted model {}; caching it", id);
                self.add_data(&id, stored).await
            }
            Ok(None) => Outcome::not_found(),
            Err(e) => Outcome::from_error(&CacheError::Loader(e)),
        }
    }

    /// Remove the model with `id` from both layers
    pub async fn remove(&self, id: &str) -> Outcome {
        self.cache.remove(&model_key::<V>(id)).await
    }

    /// Write queued L2 writes now. No-op for read-through.
    pub async fn flush(&self) {
        self.cache.flush().await;
    }

    pub fn pending_writes(&self) -> usize {
        self.cache.pending_writes()
    }

    pub async fn shutdown(&self) {
        self.cache.shutdown().await;
    }
}
