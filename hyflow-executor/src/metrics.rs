//! Prometheus metrics for the executor.
//!
//! # Metrics
//!
//! ## Counters
//! - `hyflow_runs_total` - runs by graph and outcome
//! - `hyflow_node_failures_total` - failed node executions by op type
//!
//! ## Histograms
//! - `hyflow_run_duration_seconds` - run durations by graph
//! - `hyflow_node_execution_seconds` - dispatch-to-completion time by op type
//!
//! ## Gauges
//! - `hyflow_nodes_in_flight` - nodes dispatched but not yet completed

use prometheus::{CounterVec, HistogramOpts, HistogramVec, IntGauge, Opts, Registry};
use std::fmt;

/// Histogram buckets for run durations (in seconds).
const RUN_DURATION_BUCKETS: &[f64] = &[
    0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Histogram buckets for node executions (in seconds).
const NODE_DURATION_BUCKETS: &[f64] = &[
    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
];

/// Metrics for one executor instance, in their own registry.
#[derive(Clone)]
pub struct ExecutorMetrics {
    registry: Registry,
    /// Runs by graph and outcome.
    pub runs: CounterVec,
    /// Failed node executions by op type.
    pub node_failures: CounterVec,
    /// Run durations by graph.
    pub run_duration: HistogramVec,
    /// Node durations by op type.
    pub node_duration: HistogramVec,
    /// Nodes currently in flight.
    pub nodes_in_flight: IntGauge,
}

impl ExecutorMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let runs = CounterVec::new(
            Opts::new("runs_total", "Total graph runs by outcome").namespace("hyflow"),
            &["graph", "outcome"],
        )?;
        let node_failures = CounterVec::new(
            Opts::new("node_failures_total", "Total failed node executions").namespace("hyflow"),
            &["op_type"],
        )?;
        let run_duration = HistogramVec::new(
            HistogramOpts::new("run_duration_seconds", "Duration of graph runs in seconds")
                .namespace("hyflow")
                .buckets(RUN_DURATION_BUCKETS.to_vec()),
            &["graph"],
        )?;
        let node_duration = HistogramVec::new(
            HistogramOpts::new(
                "node_execution_seconds",
                "Dispatch-to-completion time of node executions in seconds",
            )
            .namespace("hyflow")
            .buckets(NODE_DURATION_BUCKETS.to_vec()),
            &["op_type"],
        )?;
        let nodes_in_flight = IntGauge::with_opts(
            Opts::new("nodes_in_flight", "Nodes dispatched but not completed").namespace("hyflow"),
        )?;

        registry.register(Box::new(runs.clone()))?;
        registry.register(Box::new(node_failures.clone()))?;
        registry.register(Box::new(run_duration.clone()))?;
        registry.register(Box::new(node_duration.clone()))?;
        registry.register(Box::new(nodes_in_flight.clone()))?;

        Ok(Self {
            registry,
            runs,
            node_failures,
            run_duration,
            node_duration,
            nodes_in_flight,
        })
    }

    /// The registry holding every metric.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a finished run.
    pub fn record_run(&self, graph: &str, outcome: &str, duration_secs: f64) {
        self.runs.with_label_values(&[graph, outcome]).inc();
        self.run_duration
            .with_label_values(&[graph])
            .observe(duration_secs);
    }

    /// Record a node leaving the dispatcher.
    pub fn node_dispatched(&self) {
        self.nodes_in_flight.inc();
    }

    /// Record a node completion.
    pub fn node_completed(&self, op_type: &str, duration_secs: f64, success: bool) {
        self.nodes_in_flight.dec();
        self.node_duration
            .with_label_values(&[op_type])
            .observe(duration_secs);
        if !success {
            self.node_failures.with_label_values(&[op_type]).inc();
        }
    }

    /// Encode all metrics in Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

impl fmt::Debug for ExecutorMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorMetrics")
            .field("nodes_in_flight", &self.nodes_in_flight.get())
            .finish_non_exhaustive()
    }
}
