//! Logging setup for hyflow.
//!
//! The log format is controlled via `HYFLOW_LOG_FORMAT`:
//! - `json` - structured JSON, one event per line
//! - `pretty` - multi-line human-readable output
//! - `compact` - single-line output (default)
//!
//! The filter comes from `HYFLOW_LOG_LEVEL`, then `RUST_LOG`, then `info`.
//!
//! # Example
//!
//! ```ignore
//! use hyflow_executor::observability::{init_tracing, TracingConfig};
//!
//! let _guard = init_tracing(TracingConfig::from_env())?;
//! ```

mod config;
mod tracing_setup;

pub use config::{LogFormat, TracingConfig, TracingConfigBuilder};
pub use tracing_setup::{init_tracing, TracingGuard};

/// Span for one subgraph run on a stage.
#[macro_export]
macro_rules! instrument_run {
    ($graph:expr, $stage:expr, $iteration:expr) => {
        tracing::info_span!(
            "subgraph_run",
            graph = %$graph,
            stage = %$stage,
            iteration = $iteration,
        )
    };
}

/// Span for a pipeline operation.
#[macro_export]
macro_rules! instrument_pipeline {
    ($run_id:expr, $operation:expr) => {
        tracing::info_span!(
            "pipeline_operation",
            run_id = %$run_id,
            operation = $operation,
        )
    };
}

/// Span for a listener request served by a model executor.
#[macro_export]
macro_rules! instrument_request {
    ($request_id:expr, $graph:expr) => {
        tracing::info_span!(
            "model_request",
            request_id = $request_id,
            graph = %$graph,
        )
    };
}
