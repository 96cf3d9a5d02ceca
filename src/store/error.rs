//! Error types for the document store
//!
//! A missing document is not an error: `FileStore::read` returns `Ok(None)`.

use std::io;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Key is empty or contains characters that are not filename-safe
    #[error("Invalid document key: {0:?}")]
    InvalidKey(String),

    /// On-disk bytes are not valid JSON
    #[error("Corrupt data in document {key}: {source}")]
    CorruptData {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// I/O failure during a write; the previous state is left in place
    #[error("Failed to write document {key}: {source}")]
    WriteFailure {
        key: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure while reading or deleting
    #[error("I/O error on document {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

impl StoreError {
    pub(crate) fn write_failure(key: &str, source: io::Error) -> Self {
        Self::WriteFailure {
            key: key.to_string(),
            source,
        }
    }

    pub(crate) fn io(key: &str, source: io::Error) -> Self {
        Self::Io {
            key: key.to_string(),
            source,
        }
    }

    /// The document key the error refers to
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::InvalidKey(key)
            | Self::CorruptData { key, .. }
            | Self::WriteFailure { key, .. }
            | Self::Io { key, .. } => key,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
