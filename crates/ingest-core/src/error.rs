//! Error types for the ingestion pipeline.
//!
//! This module defines the crate-wide error enum returned by every pipeline
//! stage, the cache layer, and the upload transaction coordinator.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for ingest-core.
#[derive(Debug, Error)]
pub enum IngestError {
    // Network errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        cause: Option<String>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Rate limited by {service}, retry after {retry_after_secs:?} seconds")]
    RateLimited {
        service: String,
        retry_after_secs: Option<u64>,
    },

    #[error("Source exhausted all backends for {0} unresolved input(s)")]
    SourceExhausted(usize),

    // Cache errors
    #[error("Cache error in namespace {namespace}: {message}")]
    Cache { namespace: String, message: String },

    #[error("Cache entry corrupt for slug {slug} in namespace {namespace}: {message}")]
    CacheCorrupt {
        namespace: String,
        slug: String,
        message: String,
    },

    #[error("Failed to acquire cache lock for {namespace}: {message}")]
    CacheLock { namespace: String, message: String },

    // Database errors (cache index + relational upload store)
    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("Relational store error: {message}")]
    Store {
        message: String,
        #[source]
        source: Option<sqlx::Error>,
    },

    #[error("Upload transaction failed for article {slug}: {message}")]
    UploadTransaction { slug: String, message: String },

    // File system errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),

    #[error("Path is not a directory: {0}")]
    NotADirectory(PathBuf),

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("YAML error: {message}")]
    Yaml {
        message: String,
        #[source]
        source: Option<serde_yaml::Error>,
    },

    // Identifier errors
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    // Download / extraction errors
    #[error("Download failed for {url}: {message}")]
    DownloadFailed { url: String, message: String },

    #[error("Hash mismatch for {path}: expected {expected}, got {actual}")]
    HashMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Extraction failed for {slug}: {message}")]
    ExtractionFailed { slug: String, message: String },

    // create_analyses / LLM errors
    #[error("LLM response for {slug} failed schema validation: {message}")]
    LlmSchema { slug: String, message: String },

    #[error("LLM request failed for {slug}: {message}")]
    LlmRequest { slug: String, message: String },

    // Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    // Validation errors
    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for ingest-core operations.
pub type Result<T> = std::result::Result<T, IngestError>;

impl From<std::io::Error> for IngestError {
    fn from(err: std::io::Error) -> Self {
        IngestError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        IngestError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_yaml::Error> for IngestError {
    fn from(err: serde_yaml::Error) -> Self {
        IngestError::Yaml {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        IngestError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Store {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for IngestError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            IngestError::Timeout(std::time::Duration::from_secs(0))
        } else {
            IngestError::Network {
                message: err.to_string(),
                cause: Some(err.to_string()),
            }
        }
    }
}

impl IngestError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        IngestError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Check if this error should trigger a retry at the scheduler level.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IngestError::Network { .. }
                | IngestError::Timeout(_)
                | IngestError::RateLimited { .. }
                | IngestError::DownloadFailed { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IngestError::InvalidIdentifier("pmid:".into());
        assert_eq!(err.to_string(), "Invalid identifier: pmid:");
    }

    #[test]
    fn test_retryable_errors() {
        assert!(IngestError::Timeout(std::time::Duration::from_secs(5)).is_retryable());
        assert!(!IngestError::InvalidIdentifier("x".into()).is_retryable());
    }
}
