//! Configuration management for the admission service.

use std::net::SocketAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AdmissionError, Result};
use crate::ratelimit::{BucketParams, TimeWindow};

/// Prefix for environment overrides, e.g. `ADMISSION__RATE_LIMITING__CAPACITY=50`.
pub const ENV_PREFIX: &str = "ADMISSION";

/// Main configuration for the admission service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// How the middleware derives a client key from a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentifierMode {
    /// Client address, honouring proxy headers
    #[default]
    #[serde(alias = "ip")]
    SourceIp,
    /// Digest of the presented bearer credential
    #[serde(alias = "jwt")]
    CredentialSubject,
    /// Presented API key
    #[serde(alias = "apikey")]
    ApiKey,
    /// User identity derived from either credential
    #[serde(alias = "user")]
    DerivedUser,
}

/// Where bucket state lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendMode {
    /// In-process buckets
    #[default]
    Local,
    /// Buckets shared through Redis
    Distributed,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Install the admission layer at all
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Client identification mode
    #[serde(default)]
    pub identifier: IdentifierMode,

    /// Maximum tokens per bucket
    #[serde(default = "default_capacity")]
    pub capacity: u64,

    /// Tokens added per second
    #[serde(default = "default_refill_rate")]
    pub refill_rate: u64,

    /// Advertised accounting window (informational)
    #[serde(default)]
    pub window: TimeWindow,

    /// Local or distributed bucket state
    #[serde(default)]
    pub backend: BackendMode,

    /// Redis settings, used when `backend` is distributed
    #[serde(default)]
    pub redis: RedisConfig,

    /// Refund the token when the downstream handler answers 2xx
    #[serde(default)]
    pub skip_successful: bool,

    /// Refund the token when the downstream handler answers 4xx/5xx
    #[serde(default)]
    pub skip_failed: bool,

    /// Upper bound on in-memory buckets
    #[serde(default = "default_max_buckets")]
    pub max_local_buckets: usize,

    /// How often idle local buckets are swept, in seconds (0 disables)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            identifier: IdentifierMode::default(),
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            window: TimeWindow::default(),
            backend: BackendMode::default(),
            redis: RedisConfig::default(),
            skip_successful: false,
            skip_failed: false,
            max_local_buckets: default_max_buckets(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_capacity() -> u64 {
    100
}

fn default_refill_rate() -> u64 {
    10
}

fn default_max_buckets() -> usize {
    10000
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    /// Validated bucket shape.
    pub fn bucket_params(&self) -> Result<BucketParams> {
        BucketParams::new(self.capacity, self.refill_rate)
    }
}

/// Redis connection settings for the distributed limiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Full connection URL; overrides host/port/password/db when set
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub db: i64,

    /// Number of multiplexed connections
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Deadline for every round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Prefix prepended to every client key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bucket expiry after the last write, in seconds
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            host: default_redis_host(),
            port: default_redis_port(),
            password: None,
            db: 0,
            pool_size: default_pool_size(),
            timeout_ms: default_timeout_ms(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
        }
    }
}

fn default_redis_host() -> String {
    "localhost".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_pool_size() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_key_prefix() -> String {
    "rate_limit:".to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

impl RedisConfig {
    /// Connection URL understood by the redis client.
    pub fn connection_url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        match self.password.as_deref().filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

impl AdmissionConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `ADMISSION__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        let config: AdmissionConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: AdmissionConfig = serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;
        rl.bucket_params()?;

        if rl.backend == BackendMode::Distributed {
            if rl.redis.pool_size == 0 {
                return Err(AdmissionError::Config("redis.pool_size must be greater than zero".into()));
            }
            if rl.redis.timeout_ms == 0 {
                return Err(AdmissionError::Config("redis.timeout_ms must be greater than zero".into()));
            }
        }
        Ok(())
    }
}
