//! Cache configuration

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

/// How the service variant writes to L2
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// L2 write completes before the caller is answered
    #[default]
    ReadThrough,
    /// L2 write is queued and flushed by a background task
    WriteBehind,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "readthrough" => Ok(Self::ReadThrough),
            "writebehind" => Ok(Self::WriteBehind),
            other => Err(format!("unknown cache strategy '{other}'")),
        }
    }
}

/// Configuration for the two-layer cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Enable the in-process L1 layer
    pub l1_enabled: bool,
    /// Time-to-live for L1 entries
    pub l1_ttl: Duration,
    /// Maximum number of entries in L1
    pub l1_max_capacity: u64,
    /// Enable the Redis L2 layer
    pub l2_enabled: bool,
    /// Time-to-live for L2 (Redis) entries
    pub l2_ttl: Duration,
    /// Redis endpoint
    pub redis_url: String,
    /// Redis password, overrides any password in `redis_url`
    pub redis_password: Option<String>,
    /// Namespace for L2 keys, shared by every cache of this deployment
    pub instance_name: String,
    pub connect_timeout: Duration,
    /// Upper bound on a single L2 round trip
    pub operation_timeout: Duration,
    pub connect_retries: usize,
    /// How long L2 stays bypassed after the circuit opens
    pub health_cooldown: Duration,
    /// Consecutive connectivity failures that open the circuit
    pub failure_threshold: u32,
    /// Coalesce concurrent loader runs for the same key
    pub single_flight: bool,
    pub strategy: Strategy,
    /// Write-behind flush period
    pub write_behind_interval: Duration,
    /// Maximum L2 writes issued per flush round
    pub write_behind_batch_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            l1_enabled: true,
            l1_ttl: Duration::from_secs(300), // 5 minutes
            l1_max_capacity: 10_000,
            l2_enabled: true,
            l2_ttl: Duration::from_secs(900), // 15 minutes
            redis_url: "redis://127.0.0.1:6379".to_owned(),
            redis_password: None,
            instance_name: default_instance_name(),
            connect_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(2),
            connect_retries: 5,
            health_cooldown: Duration::from_secs(30),
            failure_threshold: 1,
            single_flight: true,
            strategy: Strategy::ReadThrough,
            write_behind_interval: Duration::from_millis(100),
            write_behind_batch_size: 64,
        }
    }
}

impl CacheConfig {
    /// Build a configuration from flat key/value settings.
    ///
    /// Absent keys keep their default. Values that fail to parse, and zero
    /// TTLs, are logged and ignored.
    pub fn from_settings(settings: &HashMap<String, String>) -> Self {
        let mut config = Self::default();

        if let Some(v) = setting(settings, "l1.enabled") {
            config.l1_enabled = v;
        }
        if let Some(v) = ttl_setting(settings, "l1.ttl_secs") {
            config.l1_ttl = v;
        }
        if let Some(v) = setting(settings, "l1.max_capacity") {
            config.l1_max_capacity = v;
        }
        if let Some(v) = setting(settings, "l2.enabled") {
            config.l2_enabled = v;
        }
        if let Some(v) = ttl_setting(settings, "l2.ttl_secs") {
            config.l2_ttl = v;
        }
        if let Some(v) = non_empty(settings, "l2.url") {
            config.redis_url = v;
        }
        if let Some(v) = non_empty(settings, "l2.password") {
            config.redis_password = Some(v);
        }
        if let Some(v) = non_empty(settings, "l2.instance_name") {
            config.instance_name = v;
        }
        if let Some(ms) = setting::<u64>(settings, "l2.connect_timeout_ms") {
            config.connect_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = setting::<u64>(settings, "l2.operation_timeout_ms") {
            config.operation_timeout = Duration::from_millis(ms);
        }
        if let Some(v) = setting(settings, "l2.connect_retries") {
            config.connect_retries = v;
        }
        if let Some(secs) = setting::<u64>(settings, "l2.health_cooldown_secs") {
            config.health_cooldown = Duration::from_secs(secs);
        }
        if let Some(v) = setting::<u32>(settings, "l2.failure_threshold") {
            config.failure_threshold = v.max(1);
        }
        if let Some(v) = setting(settings, "single_flight") {
            config.single_flight = v;
        }
        if let Some(v) = setting(settings, "strategy") {
            config.strategy = v;
        }
        if let Some(ms) = setting::<u64>(settings, "write_behind.interval_ms") {
            config.write_behind_interval = Duration::from_millis(ms.max(1));
        }
        if let Some(v) = setting::<usize>(settings, "write_behind.batch_size") {
            config.write_behind_batch_size = v.max(1);
        }

        config
    }
}

fn setting<T>(settings: &HashMap<String, String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = settings.get(key)?;
    match raw.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(e) => {
            warn!("Ignoring setting {} = '{}': {}", key, raw, e);
            None
        }
    }
}

fn ttl_setting(settings: &HashMap<String, String>, key: &str) -> Option<Duration> {
    match setting::<u64>(settings, key)? {
        0 => {
            warn!("Ignoring zero TTL for setting {}; keeping default", key);
            None
        }
        secs => Some(Duration::from_secs(secs)),
    }
}

fn non_empty(settings: &HashMap<String, String>, key: &str) -> Option<String> {
    settings
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn default_instance_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "layercache".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_empty_settings_keep_defaults() {
        let config = CacheConfig::from_settings(&HashMap::new());
        let default = CacheConfig::default();
        assert_eq!(config.l1_ttl, default.l1_ttl);
        assert_eq!(config.l2_ttl, default.l2_ttl);
        assert_eq!(config.health_cooldown, Duration::from_secs(30));
        assert!(config.l1_enabled && config.l2_enabled);
        assert!(!config.instance_name.is_empty());
    }

    #[test]
    fn test_settings_are_applied() {
        let config = CacheConfig::from_settings(&settings(&[
            ("l1.enabled", "false"),
            ("l1.ttl_secs", "5"),
            ("l2.ttl_secs", "60"),
            ("l2.url", "redis://cache.internal:6380"),
            ("l2.password", "hunter2"),
            ("l2.instance_name", "orders"),
            ("l2.connect_timeout_ms", "250"),
            ("l2.health_cooldown_secs", "10"),
            ("strategy", "write-behind"),
            ("write_behind.batch_size", "8"),
        ]));

        assert!(!config.l1_enabled);
        assert_eq!(config.l1_ttl, Duration::from_secs(5));
        assert_eq!(config.l2_ttl, Duration::from_secs(60));
        assert_eq!(config.redis_url, "redis://cache.internal:6380");
        assert_eq!(config.redis_password.as_deref(), Some("hunter2"));
        assert_eq!(config.instance_name, "orders");
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
        assert_eq!(config.health_cooldown, Duration::from_secs(10));
        assert_eq!(config.strategy, Strategy::WriteBehind);
        assert_eq!(config.write_behind_batch_size, 8);
    }

    #[test]
    fn test_bad_and_zero_values_fall_back() {
        let config = CacheConfig::from_settings(&settings(&[
            ("l1.enabled", "maybe"),
            ("l1.ttl_secs", "0"),
            ("l2.ttl_secs", "soon"),
            ("l2.password", "   "),
            ("strategy", "write-around"),
        ]));
        let default = CacheConfig::default();

        assert!(config.l1_enabled);
        assert_eq!(config.l1_ttl, default.l1_ttl);
        assert_eq!(config.l2_ttl, default.l2_ttl);
        assert_eq!(config.redis_password, None);
        assert_eq!(config.strategy, Strategy::ReadThrough);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("ReadThrough".parse::<Strategy>(), Ok(Strategy::ReadThrough));
        assert_eq!("write_behind".parse::<Strategy>(), Ok(Strategy::WriteBehind));
        assert!("lru".parse::<Strategy>().is_err());
    }
}
