//! Configuration management for kvflow.

use redis::{ConnectionAddr, ConnectionInfo, IntoConnectionInfo, RedisConnectionInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{KvflowError, Result};
use crate::queue::IdlePolicy;
use crate::store::RetryPolicy;

/// Prefix for environment variable overrides, e.g. `KVFLOW__QUEUE__CONSUMER_COUNT`.
const ENV_PREFIX: &str = "KVFLOW";

/// Main configuration for kvflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KvflowConfig {
    /// Backing store connection
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Work queue configuration
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Backing store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Full connection URL; takes precedence over host/port/credentials
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Retry policy for establishing the connection
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            retry: RetryConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Where and how to connect. Credentials are handed over verbatim
    /// rather than spliced into a URL, so any characters are allowed.
    pub fn connection_info(&self) -> Result<ConnectionInfo> {
        if let Some(url) = &self.url {
            return url
                .as_str()
                .into_connection_info()
                .map_err(|e| KvflowError::Config(format!("Invalid store url: {}", e)));
        }

        Ok(ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                username: self.username.clone(),
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        })
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    6379
}

/// Connection retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            self.backoff_multiplier,
        )
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    3.0
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Requests admitted per identity within one window
    #[serde(default = "default_max_requests")]
    pub max_requests: u64,

    /// Window length in seconds, starting at an identity's first request
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Prefix prepended to the identity to form the counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            window_seconds: default_window_seconds(),
            key_prefix: default_key_prefix(),
        }
    }
}

impl RateLimitingConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(KvflowError::Config(
                "rate_limiting.max_requests must be greater than zero".to_string(),
            ));
        }
        if self.window_seconds == 0 {
            return Err(KvflowError::Config(
                "rate_limiting.window_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_max_requests() -> u64 {
    3
}

fn default_window_seconds() -> u64 {
    15
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

/// Work queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// List key tasks are pushed to and popped from
    #[serde(default = "default_queue_key")]
    pub queue_key: String,

    /// How long a consumer blocks on an empty queue before going idle
    #[serde(default = "default_dequeue_timeout")]
    pub dequeue_timeout_seconds: u64,

    /// Number of concurrent consumer workers
    #[serde(default = "default_consumer_count")]
    pub consumer_count: usize,

    /// What a consumer does after an idle timeout
    #[serde(default)]
    pub idle_policy: IdlePolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_key: default_queue_key(),
            dequeue_timeout_seconds: default_dequeue_timeout(),
            consumer_count: default_consumer_count(),
            idle_policy: IdlePolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn dequeue_timeout(&self) -> Duration {
        Duration::from_secs(self.dequeue_timeout_seconds)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_key.is_empty() {
            return Err(KvflowError::Config("queue.queue_key must not be empty".to_string()));
        }
        // A zero timeout would block forever and never observe shutdown.
        if self.dequeue_timeout_seconds == 0 {
            return Err(KvflowError::Config(
                "queue.dequeue_timeout_seconds must be greater than zero".to_string(),
            ));
        }
        if self.consumer_count == 0 {
            return Err(KvflowError::Config(
                "queue.consumer_count must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_queue_key() -> String {
    "queue".to_string()
}

fn default_dequeue_timeout() -> u64 {
    10
}

fn default_consumer_count() -> usize {
    1
}

impl KvflowConfig {
    /// Load configuration from a file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KvflowConfig = serde_yaml::from_str(yaml)
            .map_err(|e| KvflowError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load an optional YAML file, then apply `KVFLOW__SECTION__FIELD`
    /// environment overrides on top of it.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let config: KvflowConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| KvflowError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check every section, failing on the first invalid parameter.
    pub fn validate(&self) -> Result<()> {
        self.rate_limiting.validate()?;
        self.queue.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = KvflowConfig::default();
        assert_eq!(config.rate_limiting.max_requests, 3);
        assert_eq!(config.rate_limiting.window_seconds, 15);
        assert_eq!(config.queue.dequeue_timeout_seconds, 10);
        assert_eq!(config.queue.queue_key, "queue");
        assert_eq!(config.queue.idle_policy, IdlePolicy::KeepPolling);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_yaml() {
        let yaml = r#"
rate_limiting:
  max_requests: 10
queue:
  consumer_count: 4
  idle_policy: exit
"#;
        let config = KvflowConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.rate_limiting.max_requests, 10);
        assert_eq!(config.rate_limiting.window_seconds, 15);
        assert_eq!(config.queue.consumer_count, 4);
        assert_eq!(config.queue.idle_policy, IdlePolicy::Exit);
        assert_eq!(config.store.port, 6379);
    }

    #[test]
    fn test_zero_max_requests_rejected() {
        let yaml = r#"
rate_limiting:
  max_requests: 0
"#;
        let err = KvflowConfig::from_yaml(yaml).unwrap_err();
        assert!(matches!(err, KvflowError::Config(_)));
    }

    #[test]
    fn test_invalid_queue_settings_rejected() {
        let mut config = KvflowConfig::default();
        config.queue.queue_key = String::new();
        assert!(config.validate().is_err());

        let mut config = KvflowConfig::default();
        config.queue.dequeue_timeout_seconds = 0;
        assert!(config.validate().is_err());

        let mut config = KvflowConfig::default();
        config.queue.consumer_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml_is_config_error() {
        let err = KvflowConfig::from_yaml("rate_limiting: [").unwrap_err();
        assert!(matches!(err, KvflowError::Config(_)));
    }

    #[test]
    fn test_connection_info_from_parts() {
        let mut store = StoreConfig::default();
        let info = store.connection_info().unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("localhost".to_string(), 6379));
        assert_eq!(info.redis.password, None);

        store.username = Some("app".to_string());
        store.password = Some("p@ss:w/rd#1".to_string());
        let info = store.connection_info().unwrap();
        assert_eq!(info.redis.username.as_deref(), Some("app"));
        assert_eq!(info.redis.password.as_deref(), Some("p@ss:w/rd#1"));
        assert_eq!(info.redis.db, 0);
    }

    #[test]
    fn test_connection_info_from_url() {
        let store = StoreConfig {
            url: Some("redis://cache:6380/2".to_string()),
            ..StoreConfig::default()
        };
        let info = store.connection_info().unwrap();
        assert_eq!(info.addr, ConnectionAddr::Tcp("cache".to_string(), 6380));
        assert_eq!(info.redis.db, 2);

        let store = StoreConfig {
            url: Some("not a url".to_string()),
            ..StoreConfig::default()
        };
        assert!(matches!(store.connection_info(), Err(KvflowError::Config(_))));
    }

    #[test]
    fn test_load_layers_env_over_file() {
        let path = std::env::temp_dir().join(format!("kvflow-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "queue:\n  consumer_count: 2\n  dequeue_timeout_seconds: 9\n",
        )
        .unwrap();

        // No other test reads this variable.
        std::env::set_var("KVFLOW__QUEUE__CONSUMER_COUNT", "7");
        let loaded = KvflowConfig::load(Some(&path));
        std::env::remove_var("KVFLOW__QUEUE__CONSUMER_COUNT");
        std::fs::remove_file(&path).unwrap();

        let config = loaded.unwrap();
        assert_eq!(config.queue.consumer_count, 7);
        assert_eq!(config.queue.dequeue_timeout_seconds, 9);
        assert_eq!(config.rate_limiting.max_requests, 3);
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = RetryConfig::default().policy();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(3));
    }
}
