//! Structured error types for the margin-cache pipeline
//!
//! Library code returns `MarginError` so callers can distinguish failure
//! modes programmatically; the CLI boundary converts to `anyhow` for
//! display. Task errors are surfaced unchanged through the phase-wait
//! calls so the failing partition stays identifiable.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the library
pub type MarginResult<T> = Result<T, MarginError>;

/// Main error type for margin-cache operations
#[derive(Debug, Error)]
pub enum MarginError {
    #[error("Invalid configuration for {field}: {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Failed to {operation} {path}")]
    Io {
        path: PathBuf,
        operation: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Resume plan at {path} is corrupted: {details}")]
    PlanCorrupted { path: PathBuf, details: String },

    #[error("Margin pair table {path} is invalid: {details}")]
    MarginPairTable { path: PathBuf, details: String },

    #[error("Catalog at {path} is invalid: {details}")]
    InvalidCatalog { path: PathBuf, details: String },

    #[error("Partition {path} has an unusable schema: {details}")]
    PartitionSchema { path: PathBuf, details: String },

    #[error("Malformed coordinates in {path} at row {row}: {details}")]
    MalformedCoordinates {
        path: PathBuf,
        row: usize,
        details: String,
    },

    #[error("Parquet error on {path}")]
    Parquet {
        path: PathBuf,
        #[source]
        source: parquet::errors::ParquetError,
    },

    #[error("Arrow error while {context}")]
    Arrow {
        context: String,
        #[source]
        source: arrow::error::ArrowError,
    },

    #[error("CSV error on {path}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("JSON error on {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Worker task panicked: {details}")]
    TaskPanicked { details: String },
}

impl MarginError {
    /// Build an I/O error with path and operation context
    pub fn io(path: impl Into<PathBuf>, operation: &'static str, source: std::io::Error) -> Self {
        MarginError::Io {
            path: path.into(),
            operation,
            source,
        }
    }

    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        MarginError::InvalidConfiguration {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_display_includes_path_and_operation() {
        let err = MarginError::io(
            "/tmp/part.parquet",
            "read",
            std::io::Error::new(std::io::ErrorKind::NotFound, "missing"),
        );
        let msg = err.to_string();
        assert!(msg.contains("read"));
        assert!(msg.contains("/tmp/part.parquet"));
    }

    #[test]
    fn malformed_coordinates_names_the_row() {
        let err = MarginError::MalformedCoordinates {
            path: PathBuf::from("Npix=4.parquet"),
            row: 17,
            details: "ra is null".to_string(),
        };
        assert!(err.to_string().contains("row 17"));
    }
}
