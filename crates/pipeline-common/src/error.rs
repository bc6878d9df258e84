//! Error types for forecast-pipeline services.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using PipelineError.
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Primary error type for pipeline and serving operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    // === Input Errors ===
    #[error("Malformed source data: {0}")]
    SourceFormat(String),

    #[error("Timestamp outside dataset range: {0}")]
    MissingTimestamp(chrono::DateTime<chrono::Utc>),

    // === Transform Errors ===
    #[error("Transform failed: {0}")]
    Transform(String),

    // === Loader Errors ===
    #[error("Staging failed: {0}")]
    Staging(String),

    #[error("Promotion failed: {0}")]
    Promotion(String),

    // === Read-Path Errors ===
    #[error("Not found: {0}")]
    NotFound(String),

    // === Infrastructure Errors ===
    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Stable machine-readable kind, reported to external callers so they
    /// can decide whether to retry, alert, or wait for corrected input.
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::SourceFormat(_) => ErrorKind::SourceFormat,
            PipelineError::MissingTimestamp(_) => ErrorKind::MissingTimestamp,
            PipelineError::Transform(_) => ErrorKind::Transform,
            PipelineError::Staging(_) => ErrorKind::Staging,
            PipelineError::Promotion(_) => ErrorKind::Promotion,
            PipelineError::NotFound(_) => ErrorKind::NotFound,
            PipelineError::Database(_) => ErrorKind::Database,
            PipelineError::Internal(_) | PipelineError::Io(_) => ErrorKind::Internal,
        }
    }

    /// HTTP status code for read-path responses.
    pub fn http_status_code(&self) -> u16 {
        match self {
            PipelineError::NotFound(_) => 404,
            PipelineError::MissingTimestamp(_) | PipelineError::SourceFormat(_) => 400,
            _ => 500,
        }
    }
}

/// Machine-readable error classification.
///
/// `SourceFormat` and `MissingTimestamp` are not retryable without fixing
/// the input; `Staging` means discard and retry from scratch; `Promotion`
/// means the staged data may still be valid and only the swap needs
/// attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SourceFormat,
    MissingTimestamp,
    Transform,
    Staging,
    Promotion,
    NotFound,
    Database,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::SourceFormat => "source_format",
            ErrorKind::MissingTimestamp => "missing_timestamp",
            ErrorKind::Transform => "transform",
            ErrorKind::Staging => "staging",
            ErrorKind::Promotion => "promotion",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Database => "database",
            ErrorKind::Internal => "internal",
        };
        f.write_str(s)
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SourceFormat(format!("JSON error: {}", err))
    }
}
