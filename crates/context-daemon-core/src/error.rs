//! Error taxonomy for the context engine.
//!
//! None of these are fatal to the daemon. Per-source errors are contained at
//! the adapter boundary and turned into "no items" plus a health update.

use thiserror::Error;

use crate::models::SourceId;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("source {source_id} timed out after {timeout_ms} ms")]
    SourceTimeout { source_id: SourceId, timeout_ms: u64 },

    #[error("source {source_id} unavailable: {message}")]
    SourceUnavailable { source_id: SourceId, message: String },

    #[error("source {source_id} returned a malformed result: {message}")]
    SourceMalformedResult { source_id: SourceId, message: String },

    /// The current file alone is larger than the budget. Tolerated and logged.
    #[error("mandatory item of {item_bytes} bytes exceeds the {budget_bytes} byte budget")]
    BudgetExceededByMandatoryItem { item_bytes: usize, budget_bytes: usize },

    /// A snapshot could not be decoded; the index is rebuilt from scratch.
    #[error("index snapshot is corrupt: {0}")]
    IndexCorrupt(String),

    /// Two writers raced on the same cache key. Last write wins; never surfaced.
    #[error("concurrent cache write for {0}")]
    CacheWriteRaced(String),

    #[error("embedding failed: {0}")]
    Embedding(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ContextError {
    pub fn unavailable(source_id: &SourceId, message: impl Into<String>) -> Self {
        ContextError::SourceUnavailable {
            source_id: source_id.clone(),
            message: message.into(),
        }
    }

    pub fn malformed(source_id: &SourceId, message: impl Into<String>) -> Self {
        ContextError::SourceMalformedResult {
            source_id: source_id.clone(),
            message: message.into(),
        }
    }

    /// Whether a single retry is worthwhile.
    pub fn is_transient(&self) -> bool {
        match self {
            ContextError::SourceTimeout { .. } | ContextError::SourceUnavailable { .. } => true,
            ContextError::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::PermissionDenied
                    | std::io::ErrorKind::InvalidData
            ),
            _ => false,
        }
    }

    /// Short machine-readable label used in logs and diagnostics.
    pub fn code(&self) -> &'static str {
        match self {
            ContextError::SourceTimeout { .. } => "source_timeout",
            ContextError::SourceUnavailable { .. } => "source_unavailable",
            ContextError::SourceMalformedResult { .. } => "source_malformed_result",
            ContextError::BudgetExceededByMandatoryItem { .. } => {
                "budget_exceeded_by_mandatory_item"
            }
            ContextError::IndexCorrupt(_) => "index_corrupt",
            ContextError::CacheWriteRaced(_) => "cache_write_raced",
            ContextError::Embedding(_) => "embedding",
            ContextError::Io(_) => "io",
        }
    }
}
