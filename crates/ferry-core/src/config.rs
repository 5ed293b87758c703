//! Construction-time configuration.
//!
//! Every options struct has production-oriented `Default`s, `#[must_use]`
//! builder setters, and a `FromEnv` impl reading `FERRY_*` variables.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::queue::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Configuration that can be loaded from environment variables.
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Parse an optional variable, falling back to `default` when unset.
pub fn env_parse<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::ParseError {
            key: key.to_string(),
            details: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> Result<Duration, ConfigError> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::ParseError {
                key: key.to_string(),
                details: format!("expected a boolean, got '{other}'"),
            }),
        },
        Err(_) => Ok(default),
    }
}

/// Options shared by every backend.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueOptions {
    /// Queue name; namespaces Redis keys and JetStream subjects.
    pub name: String,

    /// Redeliveries allowed before an item is dead-lettered.
    pub retries: u32,

    /// Visibility timeout of a delivered item.
    pub work_item_timeout: Duration,

    /// Delay before an abandoned item becomes ready again.
    pub retry_delay: Option<Duration>,

    /// Growth factor applied to `retry_delay` per attempt (1.0 = constant delay).
    pub retry_multiplier: f64,

    /// Oldest dead-lettered items are evicted past this length.
    pub dead_letter_max_items: usize,

    /// Upper bound between two timeout sweeps.
    pub maintenance_interval: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            retries: 2,
            work_item_timeout: Duration::from_secs(60),
            retry_delay: None,
            retry_multiplier: 1.0,
            dead_letter_max_items: 100,
            maintenance_interval: Duration::from_secs(1),
        }
    }
}

impl QueueOptions {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    #[must_use]
    pub fn work_item_timeout(mut self, timeout: Duration) -> Self {
        self.work_item_timeout = timeout;
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = (!delay.is_zero()).then_some(delay);
        self
    }

    #[must_use]
    pub fn retry_multiplier(mut self, multiplier: f64) -> Self {
        self.retry_multiplier = multiplier;
        self
    }

    #[must_use]
    pub fn dead_letter_max_items(mut self, max_items: usize) -> Self {
        self.dead_letter_max_items = max_items;
        self
    }

    #[must_use]
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            retries: self.retries,
            base_delay: self.retry_delay,
            multiplier: self.retry_multiplier,
        }
    }

    pub fn validate(&self) -> Result<(), crate::QueueError> {
        if self.name.trim().is_empty() {
            return Err(crate::QueueError::Config("queue name must not be empty".into()));
        }
        if self.work_item_timeout.is_zero() {
            return Err(crate::QueueError::Config(
                "work_item_timeout must be greater than zero".into(),
            ));
        }
        if self.maintenance_interval.is_zero() {
            return Err(crate::QueueError::Config(
                "maintenance_interval must be greater than zero".into(),
            ));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(crate::QueueError::Config(
                "retry_multiplier must be a finite number >= 1.0".into(),
            ));
        }
        Ok(())
    }
}

impl FromEnv for QueueOptions {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let retry_delay = env_millis("FERRY_RETRY_DELAY_MS", Duration::ZERO)?;
        Ok(Self {
            name: env_or_default("FERRY_QUEUE_NAME", &defaults.name),
            retries: env_parse("FERRY_RETRIES", defaults.retries)?,
            work_item_timeout: env_millis("FERRY_WORK_ITEM_TIMEOUT_MS", defaults.work_item_timeout)?,
            retry_delay: (!retry_delay.is_zero()).then_some(retry_delay),
            retry_multiplier: env_parse("FERRY_RETRY_MULTIPLIER", defaults.retry_multiplier)?,
            dead_letter_max_items: env_parse(
                "FERRY_DEAD_LETTER_MAX_ITEMS",
                defaults.dead_letter_max_items,
            )?,
            maintenance_interval: env_millis(
                "FERRY_MAINTENANCE_INTERVAL_MS",
                defaults.maintenance_interval,
            )?,
        })
    }
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq)]
pub struct RedisOptions {
    pub url: String,
    pub key_prefix: String,

    /// How often a blocked dequeue re-checks Redis.
    pub poll_interval: Duration,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "ferry".to_string(),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl RedisOptions {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

impl FromEnv for RedisOptions {
    /// Requires FERRY_REDIS_URL to be set (no default)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            url: env_required("FERRY_REDIS_URL")?,
            key_prefix: env_or_default("FERRY_REDIS_KEY_PREFIX", &defaults.key_prefix),
            poll_interval: env_millis("FERRY_REDIS_POLL_INTERVAL_MS", defaults.poll_interval)?,
        })
    }
}

/// NATS JetStream settings.
#[derive(Debug, Clone, PartialEq)]
pub struct NatsOptions {
    pub url: String,

    /// Stream name; defaults to the upper-cased queue name when empty.
    pub stream: String,

    /// Subject prefix; items go to `<subject_prefix>.<queue name>`.
    pub subject_prefix: String,

    /// Delete and recreate the streams on startup (tests and dev only).
    pub should_recreate: bool,
}

impl Default for NatsOptions {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            stream: String::new(),
            subject_prefix: "ferry".to_string(),
            should_recreate: false,
        }
    }
}

impl NatsOptions {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    #[must_use]
    pub fn subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.subject_prefix = prefix.into();
        self
    }

    #[must_use]
    pub fn should_recreate(mut self, recreate: bool) -> Self {
        self.should_recreate = recreate;
        self
    }
}

impl FromEnv for NatsOptions {
    /// Requires FERRY_NATS_URL to be set (no default)
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            url: env_required("FERRY_NATS_URL")?,
            stream: env_or_default("FERRY_NATS_STREAM", &defaults.stream),
            subject_prefix: env_or_default("FERRY_NATS_SUBJECT_PREFIX", &defaults.subject_prefix),
            should_recreate: env_bool("FERRY_NATS_RECREATE", defaults.should_recreate)?,
        })
    }
}

/// Which store backs a queue.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendConfig {
    Memory,
    Redis(RedisOptions),
    Nats(NatsOptions),
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::Memory => "memory",
            BackendConfig::Redis(_) => "redis",
            BackendConfig::Nats(_) => "nats",
        }
    }
}

impl FromEnv for BackendConfig {
    /// FERRY_BACKEND = memory (default) | redis | nats
    fn from_env() -> Result<Self, ConfigError> {
        let backend = env_or_default("FERRY_BACKEND", "memory");
        match backend.to_ascii_lowercase().as_str() {
            "memory" | "inmemory" | "in-memory" => Ok(BackendConfig::Memory),
            "redis" => Ok(BackendConfig::Redis(RedisOptions::from_env()?)),
            "nats" | "jetstream" => Ok(BackendConfig::Nats(NatsOptions::from_env()?)),
            other => Err(ConfigError::ParseError {
                key: "FERRY_BACKEND".to_string(),
                details: format!("unknown backend '{other}'"),
            }),
        }
    }
}

/// Worker loop tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOptions {
    /// How long one dequeue waits before the loop re-checks for shutdown.
    pub dequeue_wait: Duration,

    /// Pause after a backend error before the next dequeue.
    pub error_backoff: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            dequeue_wait: Duration::from_secs(1),
            error_backoff: Duration::from_millis(500),
        }
    }
}

impl WorkerOptions {
    #[must_use]
    pub fn dequeue_wait(mut self, wait: Duration) -> Self {
        self.dequeue_wait = wait;
        self
    }

    #[must_use]
    pub fn error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }
}

impl FromEnv for WorkerOptions {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            dequeue_wait: env_millis("FERRY_WORKER_DEQUEUE_WAIT_MS", defaults.dequeue_wait)?,
            error_backoff: env_millis("FERRY_WORKER_ERROR_BACKOFF_MS", defaults.error_backoff)?,
        })
    }
}
