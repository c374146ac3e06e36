//! Executor configuration.

use hyflow_core::error::{HyflowError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration shared by the scheduler, pipeline and model executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Timeout for the stream synchronize at the end of each run.
    pub stream_sync_timeout_ms: u64,
    /// Timeout for each callback-bridge event wait.
    pub event_wait_timeout_ms: u64,
    /// Capacity of each pipeline stage's task queue.
    pub stage_queue_capacity: usize,
    /// Capacity of the model executor's request queue.
    pub request_queue_capacity: usize,
    /// Number of loop iterations a pipelined execute runs.
    pub iteration_end: u64,
    /// Record per-node dispatch and completion timestamps.
    pub enable_profiling: bool,
    /// Record prometheus metrics.
    pub enable_metrics: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            stream_sync_timeout_ms: 30_000,
            event_wait_timeout_ms: 30_000,
            stage_queue_capacity: 2,
            request_queue_capacity: 64,
            iteration_end: 1,
            enable_profiling: false,
            enable_metrics: false,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|s| matches!(s.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
}

impl ExecutorConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads the following environment variables, falling back to defaults
    /// for anything unset or unparsable:
    /// - `HYFLOW_STREAM_SYNC_TIMEOUT_MS`
    /// - `HYFLOW_EVENT_WAIT_TIMEOUT_MS`
    /// - `HYFLOW_STAGE_QUEUE_CAPACITY`
    /// - `HYFLOW_REQUEST_QUEUE_CAPACITY`
    /// - `HYFLOW_ITERATION_END`
    /// - `HYFLOW_PROFILING`: "true" or "1"
    /// - `HYFLOW_METRICS`: "true" or "1"
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stream_sync_timeout_ms: env_parse("HYFLOW_STREAM_SYNC_TIMEOUT_MS")
                .unwrap_or(defaults.stream_sync_timeout_ms),
            event_wait_timeout_ms: env_parse("HYFLOW_EVENT_WAIT_TIMEOUT_MS")
                .unwrap_or(defaults.event_wait_timeout_ms),
            stage_queue_capacity: env_parse("HYFLOW_STAGE_QUEUE_CAPACITY")
                .unwrap_or(defaults.stage_queue_capacity)
                .max(1),
            request_queue_capacity: env_parse("HYFLOW_REQUEST_QUEUE_CAPACITY")
                .unwrap_or(defaults.request_queue_capacity)
                .max(1),
            iteration_end: env_parse("HYFLOW_ITERATION_END").unwrap_or(defaults.iteration_end),
            enable_profiling: env_flag("HYFLOW_PROFILING").unwrap_or(defaults.enable_profiling),
            enable_metrics: env_flag("HYFLOW_METRICS").unwrap_or(defaults.enable_metrics),
        }
    }

    /// Parse a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| HyflowError::ConfigParse {
            cause: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| HyflowError::ConfigParse {
            cause: format!("{}: {e}", path.display()),
        })?;
        Self::from_yaml_str(&yaml)
    }

    /// Reject values the executor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.stage_queue_capacity == 0 {
            return Err(HyflowError::ConfigValue {
                field: "stage_queue_capacity".to_string(),
                cause: "must be at least 1".to_string(),
            });
        }
        if self.request_queue_capacity == 0 {
            return Err(HyflowError::ConfigValue {
                field: "request_queue_capacity".to_string(),
                cause: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Stream synchronize timeout.
    #[must_use]
    pub fn stream_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_sync_timeout_ms)
    }

    /// Event wait timeout.
    #[must_use]
    pub fn event_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.event_wait_timeout_ms)
    }

    /// Set the stream synchronize timeout.
    #[must_use]
    pub fn with_stream_sync_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.stream_sync_timeout_ms = timeout_ms;
        self
    }

    /// Set the event wait timeout.
    #[must_use]
    pub fn with_event_wait_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.event_wait_timeout_ms = timeout_ms;
        self
    }

    /// Set the stage queue capacity.
    #[must_use]
    pub fn with_stage_queue_capacity(mut self, capacity: usize) -> Self {
        self.stage_queue_capacity = capacity.max(1);
        self
    }

    /// Set the request queue capacity.
    #[must_use]
    pub fn with_request_queue_capacity(mut self, capacity: usize) -> Self {
        self.request_queue_capacity = capacity.max(1);
        self
    }

    /// Set the number of pipelined iterations.
    #[must_use]
    pub fn with_iteration_end(mut self, iterations: u64) -> Self {
        self.iteration_end = iterations;
        self
    }

    /// Enable or disable profiling.
    #[must_use]
    pub fn with_profiling(mut self, enabled: bool) -> Self {
        self.enable_profiling = enabled;
        self
    }

    /// Enable or disable metrics.
    #[must_use]
    pub fn with_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn builders_clamp_capacities() {
        let config = ExecutorConfig::default()
            .with_stage_queue_capacity(0)
            .with_request_queue_capacity(0)
            .with_iteration_end(4);
        assert_eq!(config.stage_queue_capacity, 1);
        assert_eq!(config.request_queue_capacity, 1);
        assert_eq!(config.iteration_end, 4);
    }

    #[test]
    fn yaml_fills_defaults() {
        let config = ExecutorConfig::from_yaml_str("iteration_end: 3\nenable_profiling: true\n")
            .unwrap();
        assert_eq!(config.iteration_end, 3);
        assert!(config.enable_profiling);
        assert_eq!(config.stream_sync_timeout_ms, 30_000);
    }

    #[test]
    fn yaml_rejects_zero_capacity() {
        let err = ExecutorConfig::from_yaml_str("stage_queue_capacity: 0").unwrap_err();
        assert_eq!(err.code(), "E601");
        let err = ExecutorConfig::from_yaml_str("iteration_end: [").unwrap_err();
        assert_eq!(err.code(), "E602");
    }

    #[test]
    fn yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "event_wait_timeout_ms: 250").unwrap();
        let config = ExecutorConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.event_wait_timeout(), Duration::from_millis(250));
    }

    #[test]
    fn from_env_does_not_panic() {
        let config = ExecutorConfig::from_env();
        assert!(config.stage_queue_capacity >= 1);
    }
}
