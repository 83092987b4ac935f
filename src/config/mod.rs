//! Process configuration.
//!
//! Settings come from built-in defaults, an optional YAML file and CLI flags,
//! in increasing order of precedence. The result is an immutable
//! [`ProxyConfig`] handed to every component constructor.
//!
//! ```yaml
//! server:
//!   port: 8080
//!   shutdown_grace: 10s
//! origin:
//!   url: http://api.example
//! cache:
//!   store_url: redis://127.0.0.1:6379
//!   max_age: 1d
//!   on_store_error: fail-closed
//! ```

mod cli;

pub use cli::CliArgs;

use std::{path::Path, time::Duration};

use serde::Deserialize;
use tracing_subscriber::filter::LevelFilter;

use crate::cache_key::Origin;
use crate::error::{ProxyError, Result};
use crate::{
    DEFAULT_LISTEN, DEFAULT_MAX_AGE, DEFAULT_QUEUE_CAPACITY, DEFAULT_STORE_URL, LOOKUP_TIMEOUT,
    MAX_ORIGIN_BODY_SIZE, ORIGIN_TIMEOUT, REQUEST_TIMEOUT, SHUTDOWN_GRACE, WRITE_TIMEOUT,
};

/// Behavior when a cache lookup fails for reasons other than a miss.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum StoreFailurePolicy {
    /// Answer with a generic 500.
    #[default]
    FailClosed,
    /// Log and serve from the origin as if the lookup missed.
    FailOpen,
}

/// How write-backs treat a key that already holds a live value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    /// `SET ... EX`: last write wins.
    #[default]
    Overwrite,
    /// `SET ... EX ... NX`: refuse to replace a live entry.
    IfAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: LevelFilter,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
            json: false,
        }
    }
}

impl LoggingConfig {
    pub fn resolve(file: &FileConfig, cli: &CliArgs) -> Result<Self> {
        let mut logging = Self::default();
        if let Some(level) = cli.log_level.as_deref().or(file.logging.level.as_deref()) {
            logging.level = level
                .parse()
                .map_err(|_| ProxyError::configuration(format!("invalid log level {level:?}")))?;
        }
        if let Some(json) = cli.log_json.or(file.logging.json) {
            logging.json = json;
        }
        Ok(logging)
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub origin: Origin,
    pub listen: String,
    pub port: u16,
    /// TTL applied to every write-back and used for the freshness header.
    pub max_age: Duration,
    pub store_url: String,
    pub queue_capacity: usize,
    pub lookup_timeout: Duration,
    pub write_timeout: Duration,
    pub origin_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_body_bytes: usize,
    pub store_failure_policy: StoreFailurePolicy,
    pub write_policy: WritePolicy,
    pub coalesce_misses: bool,
    pub logging: LoggingConfig,
}

impl ProxyConfig {
    /// Configuration with defaults for everything but origin and port.
    pub fn new(origin: &str, port: u16) -> Result<Self> {
        let config = Self {
            origin: Origin::parse(origin)?,
            listen: DEFAULT_LISTEN.to_string(),
            port,
            max_age: DEFAULT_MAX_AGE,
            store_url: DEFAULT_STORE_URL.to_string(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            lookup_timeout: LOOKUP_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            origin_timeout: ORIGIN_TIMEOUT,
            request_timeout: REQUEST_TIMEOUT,
            shutdown_grace: SHUTDOWN_GRACE,
            max_body_bytes: MAX_ORIGIN_BODY_SIZE,
            store_failure_policy: StoreFailurePolicy::default(),
            write_policy: WritePolicy::default(),
            coalesce_misses: false,
            logging: LoggingConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_origin_timeout(mut self, timeout: Duration) -> Self {
        self.origin_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_store_failure_policy(mut self, policy: StoreFailurePolicy) -> Self {
        self.store_failure_policy = policy;
        self
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = policy;
        self
    }

    pub fn with_coalesce_misses(mut self, enabled: bool) -> Self {
        self.coalesce_misses = enabled;
        self
    }

    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    /// Merge the configuration file and CLI flags over the defaults.
    pub fn resolve(file: &FileConfig, cli: &CliArgs) -> Result<Self> {
        let origin = cli
            .origin
            .as_deref()
            .or(file.origin.url.as_deref())
            .ok_or_else(|| ProxyError::configuration("origin is required (--origin)"))?;
        let port = cli
            .port
            .or(file.server.port)
            .ok_or_else(|| ProxyError::configuration("port is required (--port)"))?;

        let mut config = Self::new(origin, port)?;

        if let Some(listen) = cli.listen.as_ref().or(file.server.listen.as_ref()) {
            config.listen = listen.clone();
        }
        config.store_url = store_url(file, cli);
        config.max_age = pick_duration(
            cli.max_age.map(Duration::from_secs),
            file.cache.max_age.as_ref(),
            config.max_age,
        )?;
        config.lookup_timeout =
            pick_duration(None, file.cache.lookup_timeout.as_ref(), config.lookup_timeout)?;
        config.write_timeout =
            pick_duration(None, file.cache.write_timeout.as_ref(), config.write_timeout)?;
        config.origin_timeout =
            pick_duration(None, file.origin.timeout.as_ref(), config.origin_timeout)?;
        config.request_timeout =
            pick_duration(None, file.server.request_timeout.as_ref(), config.request_timeout)?;
        config.shutdown_grace =
            pick_duration(None, file.server.shutdown_grace.as_ref(), config.shutdown_grace)?;

        if let Some(capacity) = cli.queue_capacity.or(file.cache.queue_capacity) {
            config.queue_capacity = capacity;
        }
        if let Some(limit) = file.origin.max_body_bytes {
            config.max_body_bytes = limit;
        }
        if let Some(policy) = cli.on_store_error.or(file.cache.on_store_error) {
            config.store_failure_policy = policy;
        }
        if let Some(policy) = cli.write_policy.or(file.cache.write_policy) {
            config.write_policy = policy;
        }
        config.coalesce_misses = cli.coalesce_misses || file.cache.coalesce_misses.unwrap_or(false);
        config.logging = LoggingConfig::resolve(file, cli)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ProxyError::configuration("invalid port 0"));
        }
        if self.max_age.as_secs() == 0 {
            return Err(ProxyError::configuration("max-age must be at least one second"));
        }
        if self.queue_capacity == 0 {
            return Err(ProxyError::configuration("queue capacity must be non-zero"));
        }
        if self.store_url.is_empty() {
            return Err(ProxyError::configuration("store url required"));
        }
        for (name, value) in [
            ("lookup timeout", self.lookup_timeout),
            ("write timeout", self.write_timeout),
            ("origin timeout", self.origin_timeout),
            ("request timeout", self.request_timeout),
        ] {
            if value.is_zero() {
                return Err(ProxyError::configuration(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }
}

/// Store address on its own, for the `--clear-cache` path which needs
/// nothing else.
pub fn store_url(file: &FileConfig, cli: &CliArgs) -> String {
    cli.store_url
        .clone()
        .or_else(|| file.cache.store_url.clone())
        .unwrap_or_else(|| DEFAULT_STORE_URL.to_string())
}

fn pick_duration(
    cli: Option<Duration>,
    file: Option<&DurationValue>,
    default: Duration,
) -> Result<Duration> {
    match (cli, file) {
        (Some(value), _) => Ok(value),
        (None, Some(value)) => value.to_duration(),
        (None, None) => Ok(default),
    }
}

/// YAML configuration file layout. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub server: ServerSection,
    pub origin: OriginSection,
    pub cache: CacheSection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerSection {
    pub listen: Option<String>,
    pub port: Option<u16>,
    pub request_timeout: Option<DurationValue>,
    pub shutdown_grace: Option<DurationValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OriginSection {
    pub url: Option<String>,
    pub timeout: Option<DurationValue>,
    pub max_body_bytes: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub store_url: Option<String>,
    pub max_age: Option<DurationValue>,
    pub lookup_timeout: Option<DurationValue>,
    pub write_timeout: Option<DurationValue>,
    pub queue_capacity: Option<usize>,
    pub on_store_error: Option<StoreFailurePolicy>,
    pub write_policy: Option<WritePolicy>,
    pub coalesce_misses: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSection {
    pub level: Option<String>,
    pub json: Option<bool>,
}

/// A duration written either as plain seconds or as text (`90s`, `1d`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    pub fn to_duration(&self) -> Result<Duration> {
        match self {
            DurationValue::Seconds(secs) => Ok(Duration::from_secs(*secs)),
            DurationValue::Text(text) => parse_ttl(text),
        }
    }
}

impl FileConfig {
    pub fn from_yaml(source: &str) -> Result<Self> {
        serde_yaml::from_str(source)
            .map_err(|e| ProxyError::configuration(format!("invalid configuration file: {e}")))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        let source = tokio::fs::read_to_string(path).await.map_err(|e| {
            ProxyError::configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml(&source)
    }
}

/// Parse a duration such as `30s`, `15m`, `1d`, `2w` or `1y`.
pub fn parse_ttl(ttl: &str) -> Result<Duration> {
    let ttl = ttl.trim();
    let invalid = || ProxyError::configuration(format!("invalid duration {ttl:?}"));

    let day_based = [('y', 365), ('w', 7), ('d', 1)]
        .into_iter()
        .find_map(|(suffix, days)| ttl.strip_suffix(suffix).map(|n| (n, days)))
        .and_then(|(n, days)| n.parse::<u64>().ok().map(|n| n * days * 24 * 3600));

    match day_based {
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => humantime::parse_duration(ttl).map_err(|_| invalid()),
    }
}
