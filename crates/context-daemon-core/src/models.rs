//! Core data models shared by the gatherer, the cache, and the sources.
//!
//! A [`ContextItem`] is produced by exactly one source and never mutated
//! afterwards. The gatherer merges items from every source into one
//! [`ContextBundle`] per completion request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Stable identifier of a context source (e.g. `"buffer"`, `"mcp:git"`).
///
/// Used as the health-tracker key and as the first half of every cache key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceId(String);

impl SourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// The concrete origin behind a source adapter.
///
/// The gatherer never branches on this; it only feeds cache TTL selection
/// and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Buffer,
    FilesystemResource,
    VersionControlResource,
    DocumentationResource,
    SemanticIndex,
}

impl SourceKind {
    /// TTL class used when caching results from this kind of source.
    pub fn cache_class(self) -> CacheClass {
        match self {
            SourceKind::Buffer => CacheClass::FileContent,
            SourceKind::FilesystemResource | SourceKind::VersionControlResource => {
                CacheClass::ResourceListing
            }
            SourceKind::DocumentationResource => CacheClass::Documentation,
            SourceKind::SemanticIndex => CacheClass::Uncached,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SourceKind::Buffer => "buffer",
            SourceKind::FilesystemResource => "filesystem",
            SourceKind::VersionControlResource => "version_control",
            SourceKind::DocumentationResource => "documentation",
            SourceKind::SemanticIndex => "semantic",
        };
        f.write_str(s)
    }
}

/// Cache lifetime class. Each class maps to a configured TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheClass {
    FileContent,
    ResourceListing,
    Documentation,
    /// Never cached; the semantic index is its own cache layer.
    Uncached,
}

/// Cursor position in a text document (0-indexed).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// A completion request as seen by the context engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionQuery {
    /// Path of the file being edited.
    pub file_path: String,
    #[serde(default)]
    pub cursor: Position,
    #[serde(default)]
    pub language: String,
    /// Restrict the request to these sources. `None` means every configured source.
    #[serde(default)]
    pub enabled_sources: Option<BTreeSet<SourceId>>,
    /// Logical editor session; a newer request for the same session supersedes older ones.
    #[serde(default)]
    pub session_id: Option<String>,
    /// Unsaved buffer snapshot for `file_path`, if the editor sent one.
    #[serde(default)]
    pub buffer: Option<String>,
}

impl CompletionQuery {
    pub fn new(
        file_path: impl Into<String>,
        cursor: Position,
        language: impl Into<String>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            cursor,
            language: language.into(),
            enabled_sources: None,
            session_id: None,
            buffer: None,
        }
    }

    /// Whether `source` may be consulted for this request.
    pub fn allows(&self, source: &SourceId) -> bool {
        match &self.enabled_sources {
            Some(set) => set.contains(source),
            None => true,
        }
    }

    /// Directory containing `file_path` (empty for bare file names).
    pub fn directory(&self) -> &str {
        match self.file_path.rfind('/') {
            Some(idx) => &self.file_path[..idx],
            None => "",
        }
    }
}

/// One piece of supporting material for a completion request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextItem {
    source_id: SourceId,
    content: String,
    byte_size: usize,
    relevance_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    origin_path: Option<String>,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    current_file: bool,
}

impl ContextItem {
    pub fn new(source_id: SourceId, content: impl Into<String>, relevance_score: f32) -> Self {
        let content = content.into();
        Self {
            source_id,
            byte_size: content.len(),
            content,
            relevance_score,
            origin_path: None,
            timestamp: Utc::now(),
            current_file: false,
        }
    }

    pub fn with_origin(mut self, path: impl Into<String>) -> Self {
        self.origin_path = Some(path.into());
        self
    }

    pub fn with_timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = ts;
        self
    }

    /// Mark this item as the mandatory current-file item.
    pub fn as_current_file(mut self) -> Self {
        self.current_file = true;
        self
    }

    pub fn source_id(&self) -> &SourceId {
        &self.source_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn relevance_score(&self) -> f32 {
        self.relevance_score
    }

    pub fn origin_path(&self) -> Option<&str> {
        self.origin_path.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn is_current_file(&self) -> bool {
        self.current_file
    }
}

/// Outcome classification of a gathered bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleStatus {
    Complete,
    /// The mandatory current-file read failed after its retry.
    Degraded,
    /// A newer request for the same session arrived before this one finished.
    Superseded,
}

/// Ranked, size-bounded context for a single completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextBundle {
    pub items: Vec<ContextItem>,
    pub total_bytes: usize,
    pub sources_used: BTreeSet<SourceId>,
    pub status: BundleStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    pub elapsed_ms: u64,
}

impl ContextBundle {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            total_bytes: 0,
            sources_used: BTreeSet::new(),
            status: BundleStatus::Complete,
            warnings: Vec::new(),
            elapsed_ms: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn current_file(&self) -> Option<&ContextItem> {
        self.items.iter().find(|i| i.is_current_file())
    }

    pub fn is_degraded(&self) -> bool {
        self.status == BundleStatus::Degraded
    }
}
