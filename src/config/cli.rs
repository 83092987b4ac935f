use std::path::PathBuf;

use clap::{builder::BoolishValueParser, Parser};

use super::{StoreFailurePolicy, WritePolicy};

/// Command-line arguments for the cache-proxy binary.
///
/// Every flag overrides the matching key of the optional configuration file.
#[derive(Debug, Default, Parser)]
#[command(
    name = "cache-proxy",
    version,
    about = "Read-through caching proxy for a single JSON origin"
)]
pub struct CliArgs {
    /// Optional path to a YAML configuration file.
    #[arg(long = "config-file", env = "CACHE_PROXY_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Upstream origin, scheme and authority only (e.g. http://api.example).
    #[arg(long, env = "CACHE_PROXY_ORIGIN", value_name = "URL")]
    pub origin: Option<String>,

    /// Port the proxy listens on.
    #[arg(long, env = "CACHE_PROXY_PORT", value_name = "PORT")]
    pub port: Option<u16>,

    /// Address the proxy binds to.
    #[arg(long, value_name = "HOST")]
    pub listen: Option<String>,

    /// Lifetime of cached entries in seconds.
    #[arg(long = "max-age", value_name = "SECONDS")]
    pub max_age: Option<u64>,

    /// Flush the cache store and exit without starting the proxy.
    #[arg(long = "clear-cache", action = clap::ArgAction::SetTrue)]
    pub clear_cache: bool,

    /// Redis/Valkey connection URL.
    #[arg(long = "store-url", env = "CACHE_PROXY_STORE_URL", value_name = "URL")]
    pub store_url: Option<String>,

    /// Capacity of the write-back queue.
    #[arg(long = "queue-capacity", value_name = "COUNT")]
    pub queue_capacity: Option<usize>,

    /// What to do when a cache lookup fails.
    #[arg(long = "on-store-error", value_enum, value_name = "POLICY")]
    pub on_store_error: Option<StoreFailurePolicy>,

    /// Whether write-backs replace live entries.
    #[arg(long = "write-policy", value_enum, value_name = "POLICY")]
    pub write_policy: Option<WritePolicy>,

    /// Let concurrent misses for the same resource share one origin fetch.
    #[arg(long = "coalesce-misses", action = clap::ArgAction::SetTrue)]
    pub coalesce_misses: bool,

    /// Base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}
