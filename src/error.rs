//! Error types for the rwi library.
//!
//! All fallible operations return [`Result`], whose error type is the
//! [`RwiError`] enum. Storage-layer I/O failures propagate up to the
//! index-cell boundary as explicit errors; query-level absence (a term
//! hash without postings) is never an error.

use std::io;

use thiserror::Error;

/// The main error type for rwi operations.
#[derive(Error, Debug)]
pub enum RwiError {
    /// I/O errors (file operations, sync failures, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Storage backend errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Segment file errors (format violations, failed merges)
    #[error("Segment error: {0}")]
    Segment(String),

    /// Index cell errors
    #[error("Index error: {0}")]
    Index(String),

    /// Query-level errors (infrastructure failure during a search)
    #[error("Query error: {0}")]
    Query(String),

    /// Configuration errors (schema mismatch, invalid tuning values)
    #[error("Config error: {0}")]
    Config(String),

    /// JSON serialization/deserialization errors (cell manifest)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with RwiError.
pub type Result<T> = std::result::Result<T, RwiError>;

impl RwiError {
    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        RwiError::Storage(msg.into())
    }

    /// Create a new segment error.
    pub fn segment<S: Into<String>>(msg: S) -> Self {
        RwiError::Segment(msg.into())
    }

    /// Create a new index error.
    pub fn index<S: Into<String>>(msg: S) -> Self {
        RwiError::Index(msg.into())
    }

    /// Create a new query error.
    pub fn query<S: Into<String>>(msg: S) -> Self {
        RwiError::Query(msg.into())
    }

    /// Create a new config error.
    pub fn config<S: Into<String>>(msg: S) -> Self {
        RwiError::Config(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RwiError::storage("disk unavailable");
        assert_eq!(err.to_string(), "Storage error: disk unavailable");

        let err = RwiError::segment("record out of bounds");
        assert_eq!(err.to_string(), "Segment error: record out of bounds");

        let err = RwiError::config("row width mismatch");
        assert_eq!(err.to_string(), "Config error: row width mismatch");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "missing");
        let err: RwiError = io_err.into();
        assert!(matches!(err, RwiError::Io(_)));
    }
}
