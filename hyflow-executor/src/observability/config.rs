//! Configuration types for logging.

use std::env;
use std::str::FromStr;

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per event.
    Json,
    /// Multi-line human-readable output.
    Pretty,
    /// Single-line output.
    #[default]
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "pretty" => Self::Pretty,
            _ => Self::Compact,
        })
    }
}

/// Configuration for the tracing subscriber.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    log_format: LogFormat,
    log_filter: String,
    include_location: bool,
    include_thread_names: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_format: LogFormat::default(),
            log_filter: "info".to_string(),
            include_location: false,
            include_thread_names: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|s| s == "true" || s == "1")
        .unwrap_or(false)
}

impl TracingConfig {
    /// Create a new builder.
    pub fn builder() -> TracingConfigBuilder {
        TracingConfigBuilder::default()
    }

    /// Create configuration from environment variables.
    ///
    /// - `HYFLOW_LOG_FORMAT`: "json", "pretty" or "compact"
    /// - `HYFLOW_LOG_LEVEL` or `RUST_LOG`: filter directives
    /// - `HYFLOW_LOG_LOCATION`: include file and line
    /// - `HYFLOW_LOG_THREAD_NAMES`: include thread names, useful because
    ///   every stream, bridge and stage runs on its own named thread
    pub fn from_env() -> Self {
        let log_format = env::var("HYFLOW_LOG_FORMAT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let log_filter = env::var("HYFLOW_LOG_LEVEL")
            .or_else(|_| env::var("RUST_LOG"))
            .unwrap_or_else(|_| "info".to_string());

        Self {
            log_format,
            log_filter,
            include_location: env_flag("HYFLOW_LOG_LOCATION"),
            include_thread_names: env_flag("HYFLOW_LOG_THREAD_NAMES"),
        }
    }

    /// Log format.
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Filter directives.
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Whether file and line are logged.
    pub fn include_location(&self) -> bool {
        self.include_location
    }

    /// Whether thread names are logged.
    pub fn include_thread_names(&self) -> bool {
        self.include_thread_names
    }
}

/// Builder for [`TracingConfig`].
#[derive(Debug, Default)]
pub struct TracingConfigBuilder {
    log_format: Option<LogFormat>,
    log_filter: Option<String>,
    include_location: Option<bool>,
    include_thread_names: Option<bool>,
}

impl TracingConfigBuilder {
    /// Set the log format.
    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    /// Set the filter directives.
    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    /// Include file and line.
    pub fn include_location(mut self, include: bool) -> Self {
        self.include_location = Some(include);
        self
    }

    /// Include thread names.
    pub fn include_thread_names(mut self, include: bool) -> Self {
        self.include_thread_names = Some(include);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> TracingConfig {
        let defaults = TracingConfig::default();
        TracingConfig {
            log_format: self.log_format.unwrap_or(defaults.log_format),
            log_filter: self.log_filter.unwrap_or(defaults.log_filter),
            include_location: self.include_location.unwrap_or(defaults.include_location),
            include_thread_names: self
                .include_thread_names
                .unwrap_or(defaults.include_thread_names),
        }
    }
}
