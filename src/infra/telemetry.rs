use std::path::Path;
use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing::info;
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{self, LogFormat, LoggingSettings, Settings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Load settings and install telemetry from them.
pub fn bootstrap(config_file: Option<&Path>) -> Result<Settings, InfraError> {
    let settings = config::load(config_file)?;
    init(&settings.logging)?;
    info!(
        response_cache = settings.cache.enable_response_cache,
        default_locale = %settings.cache.default_locale,
        "Telemetry initialized"
    );
    Ok(settings)
}

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
        describe_counter!(
            "viewcache_response_hit_total",
            Unit::Count,
            "Total number of response-cache hits."
        );
        describe_counter!(
            "viewcache_response_miss_total",
            Unit::Count,
            "Total number of response-cache misses, including lookups degraded by store errors."
        );
        describe_counter!(
            "viewcache_response_commit_total",
            Unit::Count,
            "Total number of responses written to the cache store."
        );
        describe_counter!(
            "viewcache_store_error_total",
            Unit::Count,
            "Total number of failed store calls by store and operation."
        );
        describe_counter!(
            "viewcache_memory_evict_total",
            Unit::Count,
            "Total number of in-memory responses evicted due to capacity."
        );
        describe_counter!(
            "viewcache_change_event_total",
            Unit::Count,
            "Total number of change events published by kind."
        );
        describe_counter!(
            "viewcache_invalidation_total",
            Unit::Count,
            "Total number of successful rule invalidations by scope."
        );
        describe_counter!(
            "viewcache_invalidation_failed_total",
            Unit::Count,
            "Total number of rule invalidations that failed."
        );
        describe_counter!(
            "viewcache_evicted_keys_total",
            Unit::Count,
            "Total number of cache keys removed by invalidation."
        );
        describe_histogram!(
            "viewcache_invalidation_ms",
            Unit::Milliseconds,
            "Duration of one rule invalidation in milliseconds."
        );
    });
}
