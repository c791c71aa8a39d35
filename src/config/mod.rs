/// Configuration management for ringpool
///
/// Only the values matter to the clients; the TOML layout below is just the
/// way the bundled binary reads them.
use crate::core::pool::PoolOptions;
use crate::core::router::PoolMode;
use crate::utils::HashKind;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_REDIS_SERVER: &str = "127.0.0.1:6379";
pub const DEFAULT_MEMCACHE_SERVER: &str = "127.0.0.1:11211";
pub const DEFAULT_RABBITMQ_SERVER: &str = "127.0.0.1:5672";
pub const DEFAULT_PREFIX: &str = "pgo_";

/// Main ringpool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Redis client configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
    /// Memcache client configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memcache: Option<MemcacheConfig>,
    /// In-process memory cache configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<MemoryConfig>,
    /// RabbitMq publisher/consumer configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rabbitmq: Option<RabbitMqConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Backend addresses, repeat an address to give it more weight
    pub servers: Vec<String>,
    /// Prepended to every key
    pub prefix: String,
    /// `AUTH` password, empty disables authentication
    pub password: String,
    /// Database index selected after connect
    pub db: u32,
    /// Idle connections kept per backend
    pub max_idle_conn: usize,
    /// Idle time after which a pooled connection is pinged before reuse
    pub max_idle_time_ms: u64,
    /// Dial and per-call socket deadline
    pub net_timeout_ms: u64,
    /// Health probe period, 0 disables probing
    pub probe_interval_ms: u64,
    /// `cluster` or `masterSlave`
    pub mode: PoolMode,
    /// Hash ring function
    pub hash: HashKind,
}

/// Memcache client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemcacheConfig {
    pub servers: Vec<String>,
    pub prefix: String,
    pub max_idle_conn: usize,
    pub max_idle_time_ms: u64,
    pub net_timeout_ms: u64,
    pub probe_interval_ms: u64,
    pub hash: HashKind,
}

/// In-process memory cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Garbage collection period
    pub gc_interval_ms: u64,
    /// Maximum expired entries removed per collection
    pub gc_max_items: usize,
}

/// RabbitMq client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    pub servers: Vec<String>,
    pub user: String,
    pub pass: String,
    /// Published as the `service` header, required
    pub service_name: String,
    /// Exchange `pgo.<exchange_name>` receives every message
    pub exchange_name: String,
    /// `direct`, `fanout`, `topic` or `headers`
    pub exchange_type: String,
    /// Open channels allowed per server, idle ones included
    pub max_channel_num: usize,
    /// Idle channels kept per server
    pub max_idle_channel: usize,
    pub max_idle_channel_time_ms: u64,
    /// How long to wait for a channel once `max_channel_num` are open
    pub max_wait_time_ms: u64,
    pub net_timeout_ms: u64,
    pub probe_interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
    /// Use ANSI colors
    pub ansi: bool,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_REDIS_SERVER.to_string()],
            prefix: DEFAULT_PREFIX.to_string(),
            password: String::new(),
            db: 0,
            max_idle_conn: 10,
            max_idle_time_ms: 60_000,
            net_timeout_ms: 1_000,
            probe_interval_ms: 0,
            mode: PoolMode::Cluster,
            hash: HashKind::Sha1Crc32,
        }
    }
}

impl Default for MemcacheConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_MEMCACHE_SERVER.to_string()],
            prefix: DEFAULT_PREFIX.to_string(),
            max_idle_conn: 10,
            max_idle_time_ms: 60_000,
            net_timeout_ms: 1_000,
            probe_interval_ms: 0,
            hash: HashKind::Sha1Crc32,
        }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            gc_interval_ms: 60_000,
            gc_max_items: 1_000,
        }
    }
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            servers: vec![DEFAULT_RABBITMQ_SERVER.to_string()],
            user: "guest".to_string(),
            pass: "guest".to_string(),
            service_name: String::new(),
            exchange_name: "direct_pgo_dft".to_string(),
            exchange_type: "direct".to_string(),
            max_channel_num: 2_000,
            max_idle_channel: 200,
            max_idle_channel_time_ms: 60_000,
            max_wait_time_ms: 200,
            net_timeout_ms: 1_000,
            probe_interval_ms: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            ansi: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis: Some(RedisConfig::default()),
            memcache: Some(MemcacheConfig::default()),
            memory: Some(MemoryConfig::default()),
            rabbitmq: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl RedisConfig {
    /// Pool options derived from this section
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            servers: self.servers.clone(),
            prefix: self.prefix.clone(),
            max_idle_conn: self.max_idle_conn,
            max_idle_time: Duration::from_millis(self.max_idle_time_ms),
            net_timeout: Duration::from_millis(self.net_timeout_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            mode: self.mode,
            hash: self.hash,
        }
    }
}

impl MemcacheConfig {
    /// Pool options derived from this section, memcache is always clustered
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            servers: self.servers.clone(),
            prefix: self.prefix.clone(),
            max_idle_conn: self.max_idle_conn,
            max_idle_time: Duration::from_millis(self.max_idle_time_ms),
            net_timeout: Duration::from_millis(self.net_timeout_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            mode: PoolMode::Cluster,
            hash: self.hash,
        }
    }
}

impl MemoryConfig {
    pub fn gc_interval(&self) -> Duration {
        Duration::from_millis(self.gc_interval_ms)
    }
}

impl RabbitMqConfig {
    /// Pool options derived from this section; channels are sharded by op code
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            servers: self.servers.clone(),
            prefix: String::new(),
            max_idle_conn: self.max_idle_channel,
            max_idle_time: Duration::from_millis(self.max_idle_channel_time_ms),
            net_timeout: Duration::from_millis(self.net_timeout_ms),
            probe_interval: Duration::from_millis(self.probe_interval_ms),
            mode: PoolMode::Cluster,
            hash: HashKind::default(),
        }
    }

    pub fn max_wait_time(&self) -> Duration {
        Duration::from_millis(self.max_wait_time_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_servers("rabbitmq", &self.servers)?;
        validate_timeout("rabbitmq", self.net_timeout_ms)?;

        if self.exchange_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "rabbitmq exchange_name cannot be empty".to_string(),
            ));
        }
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "rabbitmq service_name cannot be empty".to_string(),
            ));
        }
        if self.max_channel_num == 0 || self.max_idle_channel > self.max_channel_num {
            return Err(ConfigError::ValidationError(format!(
                "rabbitmq max_idle_channel ({}) cannot be larger than max_channel_num ({})",
                self.max_idle_channel, self.max_channel_num
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(redis) = &self.redis {
            validate_servers("redis", &redis.servers)?;
            validate_timeout("redis", redis.net_timeout_ms)?;
        }

        if let Some(memcache) = &self.memcache {
            validate_servers("memcache", &memcache.servers)?;
            validate_timeout("memcache", memcache.net_timeout_ms)?;
        }

        if let Some(rabbitmq) = &self.rabbitmq {
            rabbitmq.validate()?;
        }

        if let Some(memory) = &self.memory {
            if memory.gc_interval_ms == 0 {
                return Err(ConfigError::ValidationError(
                    "memory gc_interval_ms must be greater than 0".to_string(),
                ));
            }
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "cluster" => Config {
                redis: Some(RedisConfig {
                    servers: vec![
                        "10.0.1.20:6379".to_string(),
                        "10.0.1.21:6379".to_string(),
                        "10.0.1.22:6379".to_string(),
                    ],
                    probe_interval_ms: 5_000,
                    ..Default::default()
                }),
                memcache: Some(MemcacheConfig {
                    servers: vec![
                        "10.0.1.30:11211".to_string(),
                        "10.0.1.31:11211".to_string(),
                    ],
                    probe_interval_ms: 5_000,
                    ..Default::default()
                }),
                ..Default::default()
            },
            "masterSlave" => Config {
                redis: Some(RedisConfig {
                    servers: vec![
                        "10.0.1.20:6379".to_string(),
                        "10.0.1.21:6379".to_string(),
                    ],
                    probe_interval_ms: 5_000,
                    mode: PoolMode::MasterSlave,
                    ..Default::default()
                }),
                memcache: None,
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'cluster' or 'masterSlave'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

fn validate_servers(section: &str, servers: &[String]) -> Result<(), ConfigError> {
    if servers.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "{} servers cannot be empty",
            section
        )));
    }

    for server in servers {
        if server.trim().is_empty() {
            return Err(ConfigError::ValidationError(format!(
                "{} server address cannot be blank",
                section
            )));
        }
    }

    Ok(())
}

fn validate_timeout(section: &str, net_timeout_ms: u64) -> Result<(), ConfigError> {
    if net_timeout_ms == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{} net_timeout_ms must be greater than 0",
            section
        )));
    }
    Ok(())
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.redis.as_mut().unwrap().servers.clear();
        assert!(config.validate().is_err());

        config.redis.as_mut().unwrap().servers = vec!["127.0.0.1:6379".to_string()];
        assert!(config.validate().is_ok());

        config.memcache.as_mut().unwrap().net_timeout_ms = 0;
        assert!(config.validate().is_err());

        config.memcache = None;
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [redis]
            servers = ["127.0.0.1:7000", "127.0.0.1:7000", "127.0.0.1:7001"]
            mode = "masterSlave"
            hash = "md5"
            "#,
        )
        .unwrap();

        let redis = parsed.redis.unwrap();
        assert_eq!(redis.mode, PoolMode::MasterSlave);
        assert_eq!(redis.hash, HashKind::Md5);
        assert_eq!(redis.prefix, DEFAULT_PREFIX);
        assert_eq!(redis.max_idle_conn, 10);
        assert!(parsed.memcache.is_none());

        let options = redis.pool_options();
        assert_eq!(options.net_timeout, Duration::from_secs(1));
        assert_eq!(options.servers.len(), 3);
    }

    #[test]
    fn test_rabbitmq_section() {
        let parsed: Config = toml::from_str(
            r#"
            [rabbitmq]
            servers = ["10.0.1.40:5672"]
            service_name = "orders"
            exchange_type = "topic"
            max_idle_channel = 20
            "#,
        )
        .unwrap();
        assert!(parsed.validate().is_ok());

        let rabbitmq = parsed.rabbitmq.unwrap();
        assert_eq!(rabbitmq.user, "guest");
        assert_eq!(rabbitmq.exchange_name, "direct_pgo_dft");
        assert_eq!(rabbitmq.max_wait_time(), Duration::from_millis(200));

        let options = rabbitmq.pool_options();
        assert_eq!(options.max_idle_conn, 20);
        assert_eq!(options.max_idle_time, Duration::from_secs(60));
        assert_eq!(options.mode, PoolMode::Cluster);

        let mut config = RabbitMqConfig::default();
        assert!(config.validate().is_err());
        config.service_name = "orders".to_string();
        assert!(config.validate().is_ok());
        config.max_idle_channel = config.max_channel_num + 1;
        assert!(config.validate().is_err());
        config.max_idle_channel = 10;
        config.exchange_name.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_file_operations() {
        let config = Config::default();
        let temp_file = NamedTempFile::new().unwrap();

        config.save_to_file(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert!(loaded_config.validate().is_ok());
    }

    #[test]
    fn test_example_configs() {
        let temp_file = NamedTempFile::new().unwrap();
        Config::create_example_config(temp_file.path(), "masterSlave").unwrap();
        let loaded = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded.redis.unwrap().mode, PoolMode::MasterSlave);

        assert!(Config::create_example_config(temp_file.path(), "ring").is_err());
    }
}
