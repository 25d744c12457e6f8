//! Open-buffer source.
//!
//! The editor pushes unsaved buffer snapshots into a shared [`BufferStore`].
//! [`BufferSource`] serves two purposes from it:
//!
//! - the mandatory current-file read ([`CurrentFileReader`]): the query's own
//!   buffer snapshot if it carried one, else the stored snapshot, else the
//!   file on disk;
//! - sibling context: other open buffers plus same-directory files with the
//!   current file's extension, scored by a pluggable [`RelevanceScorer`]
//!   and capped by count and size.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;

use context_daemon_core::score::{PathProximityScorer, RelevanceScorer};
use context_daemon_core::source::{ContextSource, QueryFingerprint};
use context_daemon_core::{CompletionQuery, ContextError, ContextItem, SourceId, SourceKind};

use crate::config::{BufferConfig, BUFFER_SOURCE};
use crate::gather::CurrentFileReader;

#[derive(Debug, Clone)]
pub struct BufferSnapshot {
    pub text: Arc<str>,
    pub updated_at: DateTime<Utc>,
}

/// Unsaved editor buffers keyed by file path.
#[derive(Default)]
pub struct BufferStore {
    buffers: DashMap<String, BufferSnapshot>,
}

impl BufferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, path: &str, text: impl Into<Arc<str>>) {
        self.buffers.insert(
            path.to_string(),
            BufferSnapshot {
                text: text.into(),
                updated_at: Utc::now(),
            },
        );
    }

    /// Returns whether a snapshot was held for `path`.
    pub fn close(&self, path: &str) -> bool {
        self.buffers.remove(path).is_some()
    }

    pub fn get(&self, path: &str) -> Option<BufferSnapshot> {
        self.buffers.get(path).map(|b| b.clone())
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.buffers.iter().map(|e| e.key().clone()).collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }
}

pub struct BufferSource {
    id: SourceId,
    store: Arc<BufferStore>,
    scorer: Arc<dyn RelevanceScorer>,
    max_sibling_files: usize,
    max_sibling_bytes: usize,
}

impl BufferSource {
    pub fn new(store: Arc<BufferStore>, config: &BufferConfig) -> Self {
        Self {
            id: SourceId::new(BUFFER_SOURCE),
            store,
            scorer: Arc::new(PathProximityScorer::default()),
            max_sibling_files: config.max_sibling_files,
            max_sibling_bytes: config.max_sibling_bytes,
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Same-directory files on disk sharing the current file's extension.
    async fn disk_siblings(&self, query: &CompletionQuery) -> Result<Vec<String>, ContextError> {
        let dir = query.directory();
        let dir_path = if dir.is_empty() { Path::new(".") } else { Path::new(dir) };
        let extension = Path::new(&query.file_path).extension().map(|e| e.to_owned());

        let mut entries = match tokio::fs::read_dir(dir_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if !file_type.is_file() {
                continue;
            }
            let path = entry.path();
            if extension.is_some() && path.extension().map(|e| e.to_owned()) != extension {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let joined = if dir.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", dir, name)
            };
            if joined != query.file_path {
                paths.push(joined);
            }
        }
        Ok(paths)
    }

    async fn sibling_text(&self, path: &str) -> Option<String> {
        if let Some(snapshot) = self.store.get(path) {
            return (snapshot.text.len() <= self.max_sibling_bytes)
                .then(|| snapshot.text.to_string());
        }
        let meta = tokio::fs::metadata(path).await.ok()?;
        if meta.len() as usize > self.max_sibling_bytes {
            return None;
        }
        let bytes = tokio::fs::read(path).await.ok()?;
        String::from_utf8(bytes).ok()
    }
}

#[async_trait]
impl ContextSource for BufferSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Buffer
    }

    /// Also depends on the directory, so a buffer opened or a file created
    /// next to the current file invalidates the sibling list.
    fn fingerprint(&self, query: &CompletionQuery) -> QueryFingerprint {
        let mut paths = vec![query.file_path.clone()];
        let dir = query.directory();
        if !dir.is_empty() {
            paths.push(dir.to_string());
        }
        QueryFingerprint::new(format!("siblings|{}", query.file_path), paths)
    }

    async fn fetch(&self, query: &CompletionQuery) -> Result<Vec<ContextItem>, ContextError> {
        let mut candidates = self.store.paths();
        for path in self.disk_siblings(query).await? {
            if !candidates.contains(&path) {
                candidates.push(path);
            }
        }
        candidates.retain(|p| p != &query.file_path);

        let mut scored: Vec<(f32, String)> = candidates
            .into_iter()
            .map(|p| (self.scorer.score(query, &p), p))
            .filter(|(score, _)| *score > 0.0)
            .collect();
        // Path order first so equal scores come out the same way every time.
        scored.sort_by(|a, b| a.1.cmp(&b.1));
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));

        let mut items = Vec::new();
        for (score, path) in scored {
            if items.len() >= self.max_sibling_files {
                break;
            }
            let Some(text) = self.sibling_text(&path).await else {
                continue;
            };
            if text.trim().is_empty() {
                continue;
            }
            items.push(ContextItem::new(self.id.clone(), text, score).with_origin(path));
        }
        Ok(items)
    }
}

#[async_trait]
impl CurrentFileReader for BufferSource {
    async fn read_current(&self, query: &CompletionQuery) -> Result<String, ContextError> {
        if let Some(text) = &query.buffer {
            return Ok(text.clone());
        }
        if let Some(snapshot) = self.store.get(&query.file_path) {
            return Ok(snapshot.text.to_string());
        }
        let bytes = tokio::fs::read(&query.file_path).await?;
        String::from_utf8(bytes).map_err(|_| {
            ContextError::malformed(&self.id, format!("{} is not valid UTF-8", query.file_path))
        })
    }
}
