//! Semantic index source.
//!
//! Embeds the lines just above the cursor and returns the most similar
//! indexed chunks from other files. Results are never cached: the index is
//! its own cache layer.
//!
//! Index keys are canonical paths, so the current file is compared in that
//! form when excluding its own chunks.

use async_trait::async_trait;
use std::sync::Arc;

use context_daemon_core::rag::RagStore;
use context_daemon_core::source::{ContextSource, QueryFingerprint};
use context_daemon_core::{CompletionQuery, ContextError, ContextItem, SourceId, SourceKind};

use crate::config::{RagConfig, SEMANTIC_SOURCE};
use crate::gather::CurrentFileReader;
use crate::paths::PathNormalizer;

pub struct SemanticSource {
    id: SourceId,
    rag: Arc<RagStore>,
    reader: Arc<dyn CurrentFileReader>,
    paths: PathNormalizer,
    top_k: usize,
    min_score: f32,
    window_lines: usize,
}

impl SemanticSource {
    pub fn new(rag: Arc<RagStore>, reader: Arc<dyn CurrentFileReader>, config: &RagConfig) -> Self {
        Self {
            id: SourceId::new(SEMANTIC_SOURCE),
            rag,
            reader,
            paths: PathNormalizer::new(&config.root),
            top_k: config.top_k,
            min_score: config.min_score,
            window_lines: config.query_window_lines,
        }
    }
}

/// The `window` lines ending at (and including) the cursor line.
pub fn query_window(text: &str, cursor_line: usize, window: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let end = cursor_line.min(lines.len() - 1) + 1;
    let start = end.saturating_sub(window.max(1));
    lines[start..end].join("\n")
}

#[async_trait]
impl ContextSource for SemanticSource {
    fn id(&self) -> &SourceId {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::SemanticIndex
    }

    fn fingerprint(&self, query: &CompletionQuery) -> QueryFingerprint {
        QueryFingerprint::new(
            format!("{}|{}", query.file_path, query.cursor.line),
            vec![query.file_path.clone()],
        )
    }

    async fn fetch(&self, query: &CompletionQuery) -> Result<Vec<ContextItem>, ContextError> {
        let text = self.reader.read_current(query).await?;
        let window = query_window(&text, query.cursor.line, self.window_lines);
        if window.trim().is_empty() {
            return Ok(Vec::new());
        }

        let current = self.paths.key(&query.file_path);
        // Over-fetch so dropping the current file's own chunks still leaves top_k.
        let hits = self
            .rag
            .search(&window, self.top_k * 2, self.min_score)
            .await?;

        Ok(hits
            .into_iter()
            .filter(|hit| hit.chunk.file_path != current)
            .take(self.top_k)
            .map(|hit| {
                let mtime =
                    chrono::DateTime::from_timestamp(hit.chunk.mtime, 0).unwrap_or_default();
                ContextItem::new(self.id.clone(), hit.chunk.content, hit.score)
                    .with_origin(hit.chunk.file_path)
                    .with_timestamp(mtime)
            })
            .collect())
    }
}
