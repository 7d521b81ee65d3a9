//! Error types for the ingestion pipeline

use thiserror::Error;

/// Failure to persist one log entry.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to open log file '{path}': {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("write failure: {0}")]
    WriteFailure(String),
}

/// Failure to read a health value.
#[derive(Error, Debug)]
pub enum HealthError {
    #[error("health source unavailable: {0}")]
    Unavailable(String),

    #[error("unparseable health reading '{raw}'")]
    Parse { raw: String },
}

/// Result type for sink operations
pub type SinkResult<T> = Result<T, SinkError>;
