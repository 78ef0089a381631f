//! layercache - Two-layer caching library
//!
//! This library puts two cache layers in front of any loader:
//! - L1: In-memory Moka cache with per-entry TTL (fastest)
//! - L2: Redis cache (shared across instances), guarded by a circuit breaker
//! - Loader: database query, HTTP call, ... run only on a full miss
//!
//! The cache supports:
//! - Read-through and write-behind L2 strategies
//! - Keys derived from a loader tag and its serialized argument
//! - Coalescing of concurrent loads of the same key
//! - Degrading to L1 + loader while Redis is unreachable
//! - Outcome values instead of errors for every cache-level failure

mod cache_key;
mod cache_service;
mod config;
mod error;
mod layered_cache;
mod local_layer;
mod memory_store;
mod outcome;
mod remote_health;
mod remote_layer;
mod remote_store;
mod write_behind;

pub use cache_key::{Identified, derive_key, model_key, validate_tag};
pub use cache_service::CacheService;
pub use config::{CacheConfig, Strategy};
pub use error::{BoxError, CacheError, ErrorKind};
pub use layered_cache::{Cacheable, DataLoader, LayeredCache};
pub use local_layer::{CacheEntry, LocalLayer};
pub use memory_store::MemoryStore;
pub use outcome::{ITEM_DOES_NOT_EXIST, Outcome};
pub use remote_health::{Admission, HealthState, RemoteHealth};
pub use remote_layer::{REMOTE_UNAVAILABLE, RemoteLayer};
pub use remote_store::{RedisStore, RemoteStore};
pub use write_behind::WriteQueue;

// Re-export async_trait for convenience
pub use async_trait::async_trait;
