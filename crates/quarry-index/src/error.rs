//! Error types for quarry-index.

use std::num::TryFromIntError;

use quarry_memory::{GatewayError, VectorStoreError};

/// Errors that can occur during indexing and search.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    /// A single file could not be parsed. Non-fatal to a directory run.
    #[error("parse failed for {path}: {reason}")]
    ParseFailure { path: String, reason: String },

    /// The inference backend failed for the whole batch. Retryable.
    #[error("embedding backend unavailable: {0}")]
    EmbeddingBackendUnavailable(String),

    /// The vector store could not be reached. Retryable with backoff.
    #[error("vector store unavailable: {0}")]
    VectorStoreUnavailable(String),

    /// The vector store refused the request. Not retried as-is.
    #[error("vector store rejected request: {0}")]
    VectorStoreRejected(String),

    /// The file exceeds the configured size limit and was not read.
    #[error("file too large: {path} is {size} bytes (limit {limit})")]
    FileTooLarge { path: String, size: u64, limit: u64 },

    /// A cache entry failed validation. Handled internally as a miss.
    #[error("cache entry corrupt: {0}")]
    CacheCorruption(String),

    /// IO error reading source files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// `SQLite` database error.
    #[error("database error: {0}")]
    Sqlite(#[from] sqlx::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// File watcher error.
    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    /// Integer conversion error.
    #[error("integer conversion failed: {0}")]
    IntConversion(#[from] TryFromIntError),

    /// Generic catch-all error.
    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// Whether the same operation may succeed if tried again later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingBackendUnavailable(_) | Self::VectorStoreUnavailable(_)
        )
    }
}

impl From<VectorStoreError> for IndexError {
    fn from(e: VectorStoreError) -> Self {
        if e.is_retryable() {
            Self::VectorStoreUnavailable(e.to_string())
        } else {
            Self::VectorStoreRejected(e.to_string())
        }
    }
}

impl From<GatewayError> for IndexError {
    fn from(e: GatewayError) -> Self {
        if e.is_unavailable() {
            Self::VectorStoreUnavailable(e.to_string())
        } else {
            Self::VectorStoreRejected(e.to_string())
        }
    }
}

impl From<quarry_llm::LlmError> for IndexError {
    fn from(e: quarry_llm::LlmError) -> Self {
        Self::EmbeddingBackendUnavailable(e.to_string())
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_unavailable_variants_are_retryable() {
        assert!(IndexError::EmbeddingBackendUnavailable("down".into()).is_retryable());
        assert!(IndexError::VectorStoreUnavailable("down".into()).is_retryable());
        assert!(!IndexError::VectorStoreRejected("bad".into()).is_retryable());
        assert!(
            !IndexError::ParseFailure {
                path: "a.py".into(),
                reason: "utf-8".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn store_errors_map_by_retryability() {
        let down: IndexError = VectorStoreError::Unavailable("timeout".into()).into();
        assert!(matches!(down, IndexError::VectorStoreUnavailable(_)));
        let bad: IndexError = VectorStoreError::Rejected("dim".into()).into();
        assert!(matches!(bad, IndexError::VectorStoreRejected(_)));
    }

    #[test]
    fn llm_errors_become_backend_unavailable() {
        let e: IndexError = quarry_llm::LlmError::RateLimited.into();
        assert!(e.is_retryable());
    }
}
