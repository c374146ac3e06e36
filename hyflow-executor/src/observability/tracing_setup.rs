//! Tracing subscriber setup with format selection.

use anyhow::{Context, Result};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use super::config::{LogFormat, TracingConfig};

/// Keeps the subscriber installed for as long as it is held.
#[derive(Debug)]
pub struct TracingGuard {
    format: LogFormat,
}

impl TracingGuard {
    /// Format the subscriber was installed with.
    pub fn format(&self) -> LogFormat {
        self.format
    }
}

impl Drop for TracingGuard {
    fn drop(&mut self) {
        tracing::debug!(format = ?self.format, "Tracing guard released");
    }
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init_tracing(config: TracingConfig) -> Result<TracingGuard> {
    let filter =
        EnvFilter::try_new(config.log_filter()).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt_layer(&config))
        .with(filter)
        .try_init()
        .context("Failed to initialize tracing subscriber")?;

    Ok(TracingGuard {
        format: config.log_format(),
    })
}

fn fmt_layer(config: &TracingConfig) -> Box<dyn Layer<Registry> + Send + Sync> {
    let layer = fmt::layer()
        .with_file(config.include_location())
        .with_line_number(config.include_location())
        .with_thread_names(config.include_thread_names());

    match config.log_format() {
        LogFormat::Json => layer
            .json()
            .with_span_events(FmtSpan::CLOSE)
            .flatten_event(true)
            .boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Compact => layer.compact().boxed(),
    }
}
