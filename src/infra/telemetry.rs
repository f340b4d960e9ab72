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

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_histogram!(
            "canopy_cache_dispatch_ms",
            Unit::Milliseconds,
            "Time spent running handlers for one event, labelled by lane mode."
        );
        describe_counter!(
            "canopy_handler_failure_total",
            Unit::Count,
            "Total number of event handler failures."
        );
        describe_counter!(
            "canopy_cache_fallback_total",
            Unit::Count,
            "Reads served from the store because an optional cache was unavailable."
        );
        describe_histogram!(
            "canopy_cache_init_ms",
            Unit::Milliseconds,
            "Cold-start bulk load latency per cache in milliseconds."
        );
        describe_gauge!(
            "canopy_event_queue_len",
            Unit::Count,
            "Current number of events waiting for asynchronous delivery."
        );
        describe_counter!(
            "canopy_mirror_hit_total",
            Unit::Count,
            "Total number of client mirror hits."
        );
        describe_counter!(
            "canopy_mirror_miss_total",
            Unit::Count,
            "Total number of client mirror misses, expired entries included."
        );
        describe_counter!(
            "canopy_mirror_evict_total",
            Unit::Count,
            "Total number of client mirror evictions due to capacity."
        );
    });
}
