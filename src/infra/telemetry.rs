use std::io;
use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
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
///
/// Logs go to stderr; stdout carries command output only.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_writer(io::stderr)
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_writer(io::stderr)
            .with_target(true)
            .boxed(),
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
            "scan2ebook_jobs_submitted_total",
            Unit::Count,
            "Total number of conversion jobs accepted by the service."
        );
        describe_counter!(
            "scan2ebook_submission_failures_total",
            Unit::Count,
            "Total number of job submissions rejected or lost in transit."
        );
        describe_counter!(
            "scan2ebook_poll_ticks_total",
            Unit::Count,
            "Total number of status poll ticks."
        );
        describe_counter!(
            "scan2ebook_poll_failures_total",
            Unit::Count,
            "Total number of status requests that failed."
        );
        describe_histogram!(
            "scan2ebook_upload_bytes",
            Unit::Bytes,
            "Size of the images uploaded per job in bytes."
        );
    });
}
