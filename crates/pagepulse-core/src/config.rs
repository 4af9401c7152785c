//! Configuration management for pagepulse
//!
//! The pipeline reads its configuration once, at initialization. Sources are
//! a TOML document (file or string) layered over built-in defaults.
//!
//! ```toml
//! enabled = true
//! sample_rate = 0.25
//! max_queue_size = 200
//! flush_interval_ms = 15000
//! outbox_dir = "/var/tmp/pagepulse"
//!
//! [sink]
//! endpoint = "https://collector.example.com"
//! timeout_ms = 5000
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::logging::LogConfig;

/// Output format for log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for collectors
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => f.write_str("pretty"),
            Self::Json => f.write_str("json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Global feature flag. Nothing is collected when false.
    pub enabled: bool,

    /// Probability in [0, 1] that a session is sampled in.
    pub sample_rate: f64,

    /// Maximum number of pending events held in memory.
    pub max_queue_size: usize,

    /// Period of the `interval` flush trigger, in milliseconds.
    pub flush_interval_ms: u64,

    /// Directory for the teardown outbox. `None` accepts the teardown loss
    /// window.
    pub outbox_dir: Option<PathBuf>,

    /// Remote sink settings
    pub sink: SinkConfig,

    /// Logging settings
    pub logging: LogConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sample_rate: 1.0,
            max_queue_size: default_max_queue_size(),
            flush_interval_ms: default_flush_interval_ms(),
            outbox_dir: None,
            sink: SinkConfig::default(),
            logging: LogConfig::default(),
        }
    }
}

fn default_max_queue_size() -> usize {
    200
}

fn default_flush_interval_ms() -> u64 {
    15_000
}

/// Remote sink configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Base URL of the collector. Required for the HTTP sink.
    pub endpoint: Option<String>,

    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_ms: 5_000,
        }
    }
}

impl PipelineConfig {
    /// Parse and validate configuration from a TOML document.
    pub fn from_toml_str(source: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(source).map_err(|err| ConfigError::ParseError(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> crate::Result<Self> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()).into());
        }
        let source = std::fs::read_to_string(path).map_err(|err| ConfigError::ReadFailed {
            path: path.display().to_string(),
            message: err.to_string(),
        })?;
        Ok(Self::from_toml_str(&source)?)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.sample_rate.is_finite() || !(0.0..=1.0).contains(&self.sample_rate) {
            return Err(ConfigError::InvalidValue {
                field: "sample_rate",
                reason: format!("{} is not within [0, 1]", self.sample_rate),
            });
        }
        if self.max_queue_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_queue_size",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::InvalidValue {
                field: "flush_interval_ms",
                reason: "must be at least 1".to_string(),
            });
        }
        if let Some(endpoint) = &self.sink.endpoint {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "sink.endpoint",
                    reason: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }

    /// Flush interval as a `Duration`.
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    /// Sink request timeout as a `Duration`.
    #[must_use]
    pub fn sink_timeout(&self) -> Duration {
        Duration::from_millis(self.sink.timeout_ms.max(1))
    }
}
