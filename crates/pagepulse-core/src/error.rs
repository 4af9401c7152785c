//! Error types for pagepulse-core
//!
//! Pipeline entry points never return these: sink and outbox failures are
//! logged and absorbed where they happen. They surface only from the
//! pre-pipeline steps (config loading, logging init) and from the sink and
//! outbox APIs themselves.

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for pagepulse-core
#[derive(Error, Debug)]
pub enum Error {
    /// Persistence sink errors
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Durable outbox errors
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Tab-scoped session storage errors
    #[error("Session store error: {0}")]
    SessionStore(#[from] SessionStoreError),
}

/// Persistence sink errors
#[derive(Error, Debug)]
pub enum SinkError {
    /// The batch could not be built or encoded
    #[error("failed to encode batch: {0}")]
    Encode(String),

    /// Network or client failure before a response arrived
    #[error("transport failure: {0}")]
    Transport(String),

    /// The sink answered with a non-success status
    #[error("sink returned status {status}: {body}")]
    Status { status: u16, body: String },

    /// The sink refused the batch (quota, auth, validation)
    #[error("batch rejected: {0}")]
    Rejected(String),

    /// The sink panicked while committing
    #[error("sink panicked during commit")]
    Panicked,
}

impl SinkError {
    /// Whether a later attempt could plausibly succeed.
    ///
    /// Every failure is restored to the queue either way; this only decides
    /// the log level.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Panicked => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            Self::Encode(_) | Self::Rejected(_) => false,
        }
    }
}

impl From<serde_json::Error> for SinkError {
    fn from(err: serde_json::Error) -> Self {
        Self::Encode(err.to_string())
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to read config file {path}: {message}")]
    ReadFailed { path: String, message: String },

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid config value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Tab-scoped session storage refused a write
#[derive(Error, Debug)]
#[error("session store unavailable: {0}")]
pub struct SessionStoreError(pub String);

/// Durable outbox errors
#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("failed to write outbox {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read outbox {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("outbox {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },
}
