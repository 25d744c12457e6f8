//! In-memory semantic chunk index.
//!
//! Chunks are grouped per file. Each file's chunk set is an immutable
//! [`FileChunks`] behind an `Arc`, and the whole file map is itself an
//! `Arc<BTreeMap>` that writers replace copy-on-write. A search clones the
//! current map pointer and scores against it, so it always sees either the
//! old or the new chunk set for a file and never a mix.
//!
//! Readers only hold the map lock for the duration of an `Arc` clone, and
//! writers only for the final pointer swap. Writers are serialized with
//! each other by a separate mutex so concurrent swaps cannot lose updates.

mod snapshot;

pub use snapshot::{IndexSnapshot, SNAPSHOT_VERSION};

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::Serialize;

use crate::embedding::cosine_similarity;

/// One embedded chunk of an indexed file.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedChunk {
    pub chunk_id: String,
    pub file_path: String,
    pub byte_range: Range<usize>,
    pub embedding: Vec<f32>,
    /// SHA-256 of the chunk text, hex encoded.
    pub content_hash: String,
    /// File modification time, unix seconds.
    pub mtime: i64,
    pub content: String,
}

/// The complete chunk set of one file at one content version.
#[derive(Debug, Clone, PartialEq)]
pub struct FileChunks {
    /// SHA-256 of the whole file content.
    pub content_hash: String,
    pub mtime: i64,
    pub chunks: Vec<IndexedChunk>,
}

/// A search result.
#[derive(Debug, Clone)]
pub struct ChunkHit {
    pub chunk: IndexedChunk,
    pub score: f32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexStats {
    pub files: usize,
    pub chunks: usize,
}

type FileMap = BTreeMap<String, Arc<FileChunks>>;

#[derive(Default)]
pub struct ChunkIndex {
    files: RwLock<Arc<FileMap>>,
    writer: Mutex<()>,
}

impl ChunkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<FileMap> {
        self.files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Apply `edit` to a private copy of the file map and publish it.
    fn update<R>(&self, edit: impl FnOnce(&mut FileMap) -> R) -> R {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let mut next = (*self.current()).clone();
        let out = edit(&mut next);
        *self.files.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        out
    }

    /// Whole-file content hash of the indexed version of `path`, if any.
    pub fn file_hash(&self, path: &str) -> Option<String> {
        self.current().get(path).map(|f| f.content_hash.clone())
    }

    /// Replace every chunk of `path` with `file`. Returns the number of
    /// chunks removed.
    pub fn replace_file(&self, path: &str, file: FileChunks) -> usize {
        let file = Arc::new(file);
        self.update(|map| {
            map.insert(path.to_string(), file)
                .map_or(0, |old| old.chunks.len())
        })
    }

    /// Remove every chunk of `path`. Returns the number removed; calling it
    /// for an unknown path is a no-op.
    pub fn delete_file(&self, path: &str) -> usize {
        if !self.current().contains_key(path) {
            return 0;
        }
        self.update(|map| map.remove(path).map_or(0, |old| old.chunks.len()))
    }

    pub fn chunk_count_for(&self, path: &str) -> usize {
        self.current().get(path).map_or(0, |f| f.chunks.len())
    }

    pub fn contains_file(&self, path: &str) -> bool {
        self.current().contains_key(path)
    }

    pub fn file_paths(&self) -> Vec<String> {
        self.current().keys().cloned().collect()
    }

    pub fn stats(&self) -> IndexStats {
        let map = self.current();
        IndexStats {
            files: map.len(),
            chunks: map.values().map(|f| f.chunks.len()).sum(),
        }
    }

    pub fn clear(&self) {
        self.update(|map| map.clear());
    }

    /// Return up to `k` chunks whose cosine similarity to `query` is at least
    /// `min_score`, ordered by descending similarity, then most recent
    /// `mtime`, then path and byte offset.
    pub fn search(&self, query: &[f32], k: usize, min_score: f32) -> Vec<ChunkHit> {
        if k == 0 {
            return Vec::new();
        }
        let map = self.current();
        let mut hits: Vec<ChunkHit> = map
            .values()
            .flat_map(|file| file.chunks.iter())
            .filter_map(|chunk| {
                let score = cosine_similarity(query, &chunk.embedding);
                (score >= min_score).then(|| ChunkHit {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.chunk.mtime.cmp(&a.chunk.mtime))
                .then_with(|| a.chunk.file_path.cmp(&b.chunk.file_path))
                .then_with(|| a.chunk.byte_range.start.cmp(&b.chunk.byte_range.start))
        });
        hits.truncate(k);
        hits
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(path: &str, start: usize, embedding: Vec<f32>, mtime: i64) -> IndexedChunk {
        IndexedChunk {
            chunk_id: format!("{path}:{start}"),
            file_path: path.to_string(),
            byte_range: start..start + 10,
            embedding,
            content_hash: format!("h{start}"),
            mtime,
            content: format!("chunk at {start}"),
        }
    }

    fn file(hash: &str, chunks: Vec<IndexedChunk>) -> FileChunks {
        FileChunks {
            content_hash: hash.to_string(),
            mtime: chunks.first().map_or(0, |c| c.mtime),
            chunks,
        }
    }

    #[test]
    fn replace_swaps_whole_file() {
        let index = ChunkIndex::new();
        index.replace_file(
            "a.rs",
            file(
                "v1",
                vec![
                    chunk("a.rs", 0, vec![1.0, 0.0], 1),
                    chunk("a.rs", 10, vec![0.0, 1.0], 1),
                    chunk("a.rs", 20, vec![1.0, 1.0], 1),
                ],
            ),
        );
        assert_eq!(index.chunk_count_for("a.rs"), 3);

        let removed =
            index.replace_file("a.rs", file("v2", vec![chunk("a.rs", 0, vec![1.0, 0.0], 2)]));
        assert_eq!(removed, 3);
        assert_eq!(index.chunk_count_for("a.rs"), 1);
        assert_eq!(index.file_hash("a.rs").as_deref(), Some("v2"));
    }

    #[test]
    fn delete_is_idempotent() {
        let index = ChunkIndex::new();
        index.replace_file("a.rs", file("v1", vec![chunk("a.rs", 0, vec![1.0], 1)]));
        assert_eq!(index.delete_file("a.rs"), 1);
        assert_eq!(index.delete_file("a.rs"), 0);
        assert_eq!(index.delete_file("never.rs"), 0);
        assert!(!index.contains_file("a.rs"));
    }

    #[test]
    fn search_orders_by_score_then_mtime() {
        let index = ChunkIndex::new();
        index.replace_file("old.rs", file("o", vec![chunk("old.rs", 0, vec![1.0, 0.0], 100)]));
        index.replace_file("new.rs", file("n", vec![chunk("new.rs", 0, vec![1.0, 0.0], 200)]));
        index.replace_file("far.rs", file("f", vec![chunk("far.rs", 0, vec![0.0, 1.0], 300)]));
        index.replace_file("mid.rs", file("m", vec![chunk("mid.rs", 0, vec![1.0, 1.0], 50)]));

        let hits = index.search(&[1.0, 0.0], 10, 0.5);
        let paths: Vec<&str> = hits.iter().map(|h| h.chunk.file_path.as_str()).collect();
        assert_eq!(paths, vec!["new.rs", "old.rs", "mid.rs"]);
    }

    #[test]
    fn search_respects_k_and_min_score() {
        let index = ChunkIndex::new();
        let chunks = (0..5)
            .map(|i| chunk("a.rs", i * 10, vec![1.0, i as f32 * 0.1], 1))
            .collect();
        index.replace_file("a.rs", file("v", chunks));

        assert_eq!(index.search(&[1.0, 0.0], 2, 0.0).len(), 2);
        assert!(index.search(&[0.0, 1.0], 5, 0.99).is_empty());
        assert!(index.search(&[1.0, 0.0], 0, 0.0).is_empty());
    }

    #[test]
    fn reader_keeps_its_snapshot_across_swap() {
        let index = ChunkIndex::new();
        index.replace_file("a.rs", file("v1", vec![chunk("a.rs", 0, vec![1.0], 1)]));
        let before = index.current();
        index.replace_file(
            "a.rs",
            file("v2", vec![chunk("a.rs", 0, vec![1.0], 2), chunk("a.rs", 10, vec![1.0], 2)]),
        );
        assert_eq!(before["a.rs"].chunks.len(), 1);
        assert_eq!(index.chunk_count_for("a.rs"), 2);
    }

    #[test]
    fn stats_count_files_and_chunks() {
        let index = ChunkIndex::new();
        index.replace_file("a.rs", file("a", vec![chunk("a.rs", 0, vec![1.0], 1)]));
        index.replace_file(
            "b.rs",
            file("b", vec![chunk("b.rs", 0, vec![1.0], 1), chunk("b.rs", 10, vec![1.0], 1)]),
        );
        let stats = index.stats();
        assert_eq!(stats.files, 2);
        assert_eq!(stats.chunks, 3);
        index.clear();
        assert_eq!(index.stats().chunks, 0);
    }
}
