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

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "depthcast_cache_hit_total",
            Unit::Count,
            "Requests answered from a finished result on their first lookup."
        );
        describe_counter!(
            "depthcast_cache_miss_total",
            Unit::Count,
            "Requests that had to wait for a render."
        );
        describe_counter!(
            "depthcast_cache_evict_total",
            Unit::Count,
            "Result store entries dropped, labelled by cause (expired or capacity)."
        );
        describe_counter!(
            "depthcast_cache_corrupt_total",
            Unit::Count,
            "Persisted results discarded because they could not be read back."
        );
        describe_counter!(
            "depthcast_admission_total",
            Unit::Count,
            "Jobs admitted into the render queue."
        );
        describe_gauge!(
            "depthcast_queue_depth",
            Unit::Count,
            "Jobs currently waiting for a render worker."
        );
        describe_counter!(
            "depthcast_queue_rejected_total",
            Unit::Count,
            "Jobs refused by the render queue, labelled by reason."
        );
        describe_histogram!(
            "depthcast_queue_wait_ms",
            Unit::Milliseconds,
            "Time a job spent queued before a worker picked it up."
        );
        describe_counter!(
            "depthcast_render_total",
            Unit::Count,
            "Renders completed, labelled by result."
        );
        describe_histogram!(
            "depthcast_render_ms",
            Unit::Milliseconds,
            "Renderer wall-clock time in milliseconds."
        );
        describe_counter!(
            "depthcast_gateway_timeout_total",
            Unit::Count,
            "Requests that gave up waiting for their render."
        );
        describe_histogram!(
            "depthcast_gateway_request_ms",
            Unit::Milliseconds,
            "End-to-end gateway latency, labelled by result."
        );
        describe_counter!(
            "depthcast_http_busy_total",
            Unit::Count,
            "Requests turned away because the in-flight limit was reached."
        );
    });
}
