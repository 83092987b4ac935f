use std::sync::Once;

use metrics::{describe_counter, Unit};
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;
use crate::error::{ProxyError, Result};
use crate::proxy::{METRIC_CACHE_HIT, METRIC_CACHE_MISS, METRIC_ORIGIN_FAILURE};
use crate::writeback::{
    METRIC_WRITEBACK_DROPPED, METRIC_WRITEBACK_ENQUEUED, METRIC_WRITEBACK_FAILED,
    METRIC_WRITEBACK_WRITTEN,
};

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install the global tracing subscriber. `RUST_LOG` refines the configured
/// base level.
pub fn init(logging: &LoggingConfig) -> Result<()> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = if logging.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .boxed()
    } else {
        fmt::layer().compact().with_target(true).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            ProxyError::configuration(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(METRIC_CACHE_HIT, Unit::Count, "Requests answered from the cache store.");
        describe_counter!(METRIC_CACHE_MISS, Unit::Count, "Requests that had to go to the origin.");
        describe_counter!(
            METRIC_ORIGIN_FAILURE,
            Unit::Count,
            "Misses that ended in an origin or decode failure."
        );
        describe_counter!(
            METRIC_WRITEBACK_ENQUEUED,
            Unit::Count,
            "Origin responses handed to the write-back worker."
        );
        describe_counter!(
            METRIC_WRITEBACK_DROPPED,
            Unit::Count,
            "Write-backs dropped because the queue was full."
        );
        describe_counter!(
            METRIC_WRITEBACK_WRITTEN,
            Unit::Count,
            "Write-backs persisted to the cache store."
        );
        describe_counter!(
            METRIC_WRITEBACK_FAILED,
            Unit::Count,
            "Write-backs the cache store rejected or timed out on."
        );
    });
}
