//! The [`ContextSource`] capability.
//!
//! Every origin of context (open buffers, resource-protocol servers, the
//! semantic index) sits behind this trait. The gatherer depends only on the
//! capability; it looks at [`ContextSource::id`] and
//! [`ContextSource::kind`] solely for health and cache keying.

use async_trait::async_trait;

use crate::error::ContextError;
use crate::models::{CacheClass, CompletionQuery, ContextItem, SourceId, SourceKind};

#[async_trait]
pub trait ContextSource: Send + Sync {
    /// Stable identifier, unique among configured sources.
    fn id(&self) -> &SourceId;

    fn kind(&self) -> SourceKind;

    /// TTL class for caching this source's results.
    fn cache_class(&self) -> CacheClass {
        self.kind().cache_class()
    }

    /// Fingerprint of the parts of `query` this source's result depends on,
    /// plus every file path the result references (for save invalidation).
    ///
    /// The default keys on file path and language.
    fn fingerprint(&self, query: &CompletionQuery) -> QueryFingerprint {
        QueryFingerprint::new(
            format!("{}|{}", query.file_path, query.language),
            vec![query.file_path.clone()],
        )
    }

    /// Fetch candidate items for `query`. May perform network or file I/O.
    async fn fetch(&self, query: &CompletionQuery) -> Result<Vec<ContextItem>, ContextError>;
}

/// Cache-relevant digest of a query, as seen by one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFingerprint {
    pub key: String,
    pub paths: Vec<String>,
}

impl QueryFingerprint {
    pub fn new(key: impl Into<String>, paths: Vec<String>) -> Self {
        Self {
            key: key.into(),
            paths,
        }
    }
}
