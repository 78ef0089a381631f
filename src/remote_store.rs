//! Key/value contract of the remote store, and its Redis implementation

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::{AsyncCommands, IntoConnectionInfo};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::{CacheConfig, CacheError};

/// Minimal GET/SET/DEL contract the remote layer needs.
///
/// Implementations report connectivity problems as
/// [`CacheError::Unreachable`] so the caller can open the circuit; any other
/// error leaves the health state alone.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store `value` with an expiry. `Ok(false)` means the store answered but
    /// did not apply the write.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<bool, CacheError>;

    /// Delete `key`. `Ok(false)` means there was nothing to delete.
    async fn delete(&self, key: &str) -> Result<bool, CacheError>;

    async fn exists(&self, key: &str) -> Result<bool, CacheError>;
}

/// Redis-backed [`RemoteStore`].
///
/// The connection is established on first use rather than at construction,
/// so building a cache never fails because Redis is down. A failed connect
/// is retried by the next call.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    connect_timeout: Duration,
    operation_timeout: Duration,
    connect_retries: usize,
}

impl RedisStore {
    /// Create a store from the Redis settings in `config`
    pub fn open(config: &CacheConfig) -> Result<Self, CacheError> {
        let mut info = config
            .redis_url
            .as_str()
            .into_connection_info()
            .map_err(|e| CacheError::Unexpected(format!("invalid Redis URL: {e}")))?;
        if let Some(password) = &config.redis_password {
            info.redis.password = Some(password.clone());
        }
        let client = redis::Client::open(info)
            .map_err(|e| CacheError::Unexpected(format!("invalid Redis settings: {e}")))?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            connect_timeout: config.connect_timeout,
            operation_timeout: config.operation_timeout,
            connect_retries: config.connect_retries,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager_config = ConnectionManagerConfig::new()
                    .set_connection_timeout(self.connect_timeout)
                    .set_response_timeout(self.operation_timeout)
                    .set_number_of_retries(self.connect_retries);
                let connect =
                    ConnectionManager::new_with_config(self.client.clone(), manager_config);
                match tokio::time::timeout(self.connect_timeout, connect).await {
                    Ok(Ok(manager)) => {
                        debug!("Connected to Redis");
                        Ok(manager)
                    }
                    Ok(Err(e)) => {
                        warn!("Could not connect to Redis: {}", e);
                        Err(CacheError::Unreachable(e.to_string()))
                    }
                    Err(_) => Err(CacheError::Unreachable(format!(
                        "connect timed out after {:?}",
                        self.connect_timeout
                    ))),
                }
            })
            .await?;
        Ok(manager.clone())
    }

    async fn bounded<T, F>(&self, op: F) -> Result<T, CacheError>
    where
        F: Future<Output = Result<T, redis::RedisError>>,
    {
        match tokio::time::timeout(self.operation_timeout, op).await {
            Ok(result) => result.map_err(CacheError::from),
            Err(_) => Err(CacheError::Unreachable(format!(
                "operation timed out after {:?}",
                self.operation_timeout
            ))),
        }
    }
}

#[async_trait]
impl RemoteStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn),
            )
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let removed: usize = self.bounded(conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        self.bounded(conn.exists::<_, bool>(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_rejects_bad_url() {
        let config = CacheConfig {
            redis_url: "not a url".to_owned(),
            ..CacheConfig::default()
        };
        assert!(matches!(
            RedisStore::open(&config),
            Err(CacheError::Unexpected(_))
        ));
    }

    #[test]
    fn test_open_is_lazy() {
        // nothing listens on port 1; opening must still succeed
        let config = CacheConfig {
            redis_url: "redis://127.0.0.1:1".to_owned(),
            redis_password: Some("secret".to_owned()),
            ..CacheConfig::default()
        };
        assert!(RedisStore::open(&config).is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_server_reports_unreachable() {
        let config = CacheConfig {
            redis_url: "redis://127.0.0.1:1".to_owned(),
            connect_timeout: Duration::from_millis(200),
            connect_retries: 0,
            ..CacheConfig::default()
        };
        let store = RedisStore::open(&config).expect("valid url");
        let err = store.get("k").await.expect_err("nothing listens on port 1");
        assert!(err.is_unreachable());
    }
}
