use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the caches emit.
///
/// Safe to call more than once; only the first call registers.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "fragcache_output_hit_total",
            Unit::Count,
            "Total number of output cache hits, labelled by tier."
        );
        describe_counter!(
            "fragcache_output_miss_total",
            Unit::Count,
            "Total number of output cache lookups that left a fill obligation."
        );
        describe_counter!(
            "fragcache_output_compute_total",
            Unit::Count,
            "Total number of loader invocations."
        );
        describe_counter!(
            "fragcache_output_uncacheable_total",
            Unit::Count,
            "Total number of uncacheable entries stored as null markers."
        );
        describe_counter!(
            "fragcache_output_invalidated_total",
            Unit::Count,
            "Total number of full output cache invalidations."
        );
        describe_counter!(
            "fragcache_output_evict_total",
            Unit::Count,
            "Total number of primary tier evictions due to capacity."
        );
        describe_counter!(
            "fragcache_object_hit_total",
            Unit::Count,
            "Total number of object cache hits."
        );
        describe_counter!(
            "fragcache_object_miss_total",
            Unit::Count,
            "Total number of object cache misses."
        );
        describe_counter!(
            "fragcache_object_evict_total",
            Unit::Count,
            "Total number of object cache evictions, labelled by reason."
        );
        describe_gauge!(
            "fragcache_event_queue_len",
            Unit::Count,
            "Current number of pending cache events in the queue."
        );
        describe_counter!(
            "fragcache_event_dropped_total",
            Unit::Count,
            "Total number of cache events dropped due to queue overflow."
        );
        describe_histogram!(
            "fragcache_consume_ms",
            Unit::Milliseconds,
            "Cache consumption latency in milliseconds."
        );
    });
}
