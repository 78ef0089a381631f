//! In-process [`RemoteStore`] with expiry and fault injection
//!
//! Stands in for Redis in tests and single-process setups. Outages and
//! silently dropped writes can be switched on to exercise the circuit
//! breaker and soft-failure paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{CacheError, RemoteStore};

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, (String, Instant)>>,
    unreachable: AtomicBool,
    drop_writes: AtomicBool,
    calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a network outage: every call fails with `Unreachable`
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Accept SETs without storing them, answering "not applied"
    pub fn set_drop_writes(&self, drop_writes: bool) {
        self.drop_writes.store(drop_writes, Ordering::SeqCst);
    }

    /// Number of calls received, including failed ones
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Raw stored string, bypassing the call counter and outage switch
    pub async fn peek(&self, key: &str) -> Option<String> {
        let records = self.records.lock().await;
        records
            .get(key)
            .filter(|(_, expires_at)| Instant::now() < *expires_at)
            .map(|(value, _)| value.clone())
    }

    /// Store a raw string directly, e.g. to plant a corrupt record
    pub async fn plant(&self, key: &str, value: &str, ttl: Duration) {
        self.records
            .lock()
            .await
            .insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
    }

    fn enter(&self) -> Result<(), CacheError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(CacheError::Unreachable("connection refused".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.enter()?;
        let mut records = self.records.lock().await;
        match records.get(key) {
            Some((value, expires_at)) if Instant::now() < *expires_at => Ok(Some(value.clone())),
            Some(_) => {
                records.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<bool, CacheError> {
        self.enter()?;
        if self.drop_writes.load(Ordering::SeqCst) {
            return Ok(false);
        }
        self.records
            .lock()
            .await
            .insert(key.to_owned(), (value, Instant::now() + ttl));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        self.enter()?;
        let mut records = self.records.lock().await;
        Ok(records
            .remove(key)
            .is_some_and(|(_, expires_at)| Instant::now() < expires_at))
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        self.enter()?;
        let records = self.records.lock().await;
        Ok(records
            .get(key)
            .is_some_and(|(_, expires_at)| Instant::now() < *expires_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_records_expire() {
        let store = MemoryStore::new();
        assert!(store.set("k", "v".into(), Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_switch() {
        let store = MemoryStore::new();
        store.set_unreachable(true);
        let err = store.get("k").await.unwrap_err();
        assert!(err.is_unreachable());
        assert_eq!(store.calls(), 1);

        store.set_unreachable(false);
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_writes() {
        let store = MemoryStore::new();
        store.set_drop_writes(true);
        let applied = store
            .set("k", "v".into(), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(store.peek("k").await, None);
    }

    #[tokio::test]
    async fn test_delete_reports_presence() {
        let store = MemoryStore::new();
        store.plant("k", "v", Duration::from_secs(5)).await;
        assert!(store.delete("k").await.unwrap());
        assert!(!store.delete("k").await.unwrap());
    }
}
