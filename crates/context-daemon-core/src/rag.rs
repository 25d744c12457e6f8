//! Retrieval store: chunking, embedding, and similarity search over files.
//!
//! [`RagStore`] ties the [`chunk_code`] chunker and an
//! [`EmbeddingProvider`] to a [`ChunkIndex`]. Reindexing a file builds its
//! complete new chunk set off to the side, embeddings included, and only
//! then swaps it into the index, so searches never see a partial update.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::chunk::{chunk_code, content_hash, ChunkParams, CodeChunk};
use crate::embedding::EmbeddingProvider;
use crate::error::ContextError;
use crate::store::{ChunkHit, ChunkIndex, FileChunks, IndexSnapshot, IndexStats, IndexedChunk};

/// Result of [`RagStore::index_file`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexOutcome {
    /// Content hash matched the indexed version; nothing was touched.
    Unchanged,
    Indexed { removed: usize, inserted: usize },
}

pub struct RagStore {
    index: ChunkIndex,
    embedder: Arc<dyn EmbeddingProvider>,
    params: ChunkParams,
    batch_size: usize,
}

impl RagStore {
    pub fn new(embedder: Arc<dyn EmbeddingProvider>, params: ChunkParams) -> Self {
        Self {
            index: ChunkIndex::new(),
            embedder,
            params,
            batch_size: 64,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn index(&self) -> &ChunkIndex {
        &self.index
    }

    pub fn embedder(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.embedder
    }

    /// (Re)index one file. Unchanged content is a no-op; otherwise every
    /// previous chunk of `path` is replaced by the new chunking in one swap.
    pub async fn index_file(
        &self,
        path: &str,
        content: &str,
        mtime: i64,
    ) -> Result<IndexOutcome, ContextError> {
        let file_hash = content_hash(content.as_bytes());
        if self.index.file_hash(path).as_deref() == Some(file_hash.as_str()) {
            return Ok(IndexOutcome::Unchanged);
        }

        let chunks = chunk_code(content, self.params);
        let embeddings = self.embed_chunks(&chunks).await?;

        let indexed: Vec<IndexedChunk> = chunks
            .into_iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| IndexedChunk {
                chunk_id: chunk_id(path, &chunk),
                file_path: path.to_string(),
                byte_range: chunk.byte_range,
                embedding,
                content_hash: chunk.hash,
                mtime,
                content: chunk.text,
            })
            .collect();
        let inserted = indexed.len();

        let removed = self.index.replace_file(
            path,
            FileChunks {
                content_hash: file_hash,
                mtime,
                chunks: indexed,
            },
        );
        tracing::debug!(path, removed, inserted, "reindexed file");
        Ok(IndexOutcome::Indexed { removed, inserted })
    }

    async fn embed_chunks(&self, chunks: &[CodeChunk]) -> Result<Vec<Vec<f32>>, ContextError> {
        let dims = self.embedder.dims();
        let mut out = Vec::with_capacity(chunks.len());
        for batch in chunks.chunks(self.batch_size) {
            let texts: Vec<String> = batch.iter().map(|c| c.text.clone()).collect();
            let vectors = self.embedder.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(ContextError::Embedding(format!(
                    "expected {} embeddings, got {}",
                    texts.len(),
                    vectors.len()
                )));
            }
            if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
                return Err(ContextError::Embedding(format!(
                    "expected {} dims, got {}",
                    dims,
                    bad.len()
                )));
            }
            out.extend(vectors);
        }
        Ok(out)
    }

    pub fn delete_file(&self, path: &str) -> usize {
        self.index.delete_file(path)
    }

    /// Embed `query` and search the index.
    pub async fn search(
        &self,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<ChunkHit>, ContextError> {
        if query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_one(query).await?;
        Ok(self.index.search(&vector, k, min_score))
    }

    pub fn stats(&self) -> IndexStats {
        self.index.stats()
    }

    pub fn save_snapshot(&self, path: &Path) -> Result<(), ContextError> {
        self.index
            .to_snapshot(self.embedder.model_name(), self.embedder.dims())
            .write_to(path)
    }

    /// Restore the index from `path`. Returns `Ok(None)` when no snapshot
    /// exists. A snapshot that is unreadable or was built by another
    /// embedder yields [`ContextError::IndexCorrupt`] and leaves the index
    /// as it was.
    pub fn load_snapshot(&self, path: &Path) -> Result<Option<IndexStats>, ContextError> {
        let Some(snapshot) = IndexSnapshot::read_from(path)? else {
            return Ok(None);
        };
        snapshot.check_compatible(self.embedder.model_name(), self.embedder.dims())?;
        self.index.restore(snapshot).map(Some)
    }
}

fn chunk_id(path: &str, chunk: &CodeChunk) -> String {
    let mut hasher = Sha256::new();
    hasher.update(path.as_bytes());
    hasher.update([0u8]);
    hasher.update(chunk.byte_range.start.to_le_bytes());
    hasher.update(chunk.byte_range.end.to_le_bytes());
    hasher.update(chunk.hash.as_bytes());
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;

    fn store() -> RagStore {
        RagStore::new(
            Arc::new(HashingEmbedder::new(128)),
            ChunkParams {
                max_bytes: 80,
                overlap_bytes: 10,
            },
        )
    }

    fn functions(names: &[&str]) -> String {
        names
            .iter()
            .map(|n| format!("fn {n}() {{\n    {n}_body();\n}}\n"))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[tokio::test]
    async fn unchanged_content_short_circuits() {
        let rag = store();
        let src = functions(&["alpha", "beta", "gamma"]);
        let first = rag.index_file("src/lib.rs", &src, 10).await.unwrap();
        assert!(matches!(first, IndexOutcome::Indexed { removed: 0, .. }));

        let again = rag.index_file("src/lib.rs", &src, 11).await.unwrap();
        assert_eq!(again, IndexOutcome::Unchanged);
    }

    #[tokio::test]
    async fn reindex_leaves_no_stale_chunks() {
        let rag = store();
        let v1 = functions(&["alpha", "beta", "gamma", "delta", "epsilon"]);
        let v2 = functions(&["zeta"]);

        rag.index_file("src/lib.rs", &v1, 1).await.unwrap();
        let old_count = rag.index().chunk_count_for("src/lib.rs");
        assert_eq!(old_count, chunk_code(&v1, rag.params).len());

        let outcome = rag.index_file("src/lib.rs", &v2, 2).await.unwrap();
        let expected = chunk_code(&v2, rag.params);
        assert_eq!(
            outcome,
            IndexOutcome::Indexed {
                removed: old_count,
                inserted: expected.len()
            }
        );
        assert_eq!(rag.index().chunk_count_for("src/lib.rs"), expected.len());

        let hits = rag.search("alpha_body", 50, -1.0).await.unwrap();
        assert!(hits.iter().all(|h| !h.chunk.content.contains("alpha")));
    }

    #[tokio::test]
    async fn search_finds_related_file() {
        let rag = store();
        rag.index_file("src/pool.rs", "fn connection_pool_acquire() {}\n", 1)
            .await
            .unwrap();
        rag.index_file("src/render.rs", "fn render_html_template() {}\n", 1)
            .await
            .unwrap();

        let hits = rag.search("pool.acquire connection", 1, 0.0).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].chunk.file_path, "src/pool.rs");
    }

    #[tokio::test]
    async fn delete_then_reindex_same_content_inserts_again() {
        let rag = store();
        let src = functions(&["alpha"]);
        rag.index_file("a.rs", &src, 1).await.unwrap();
        assert!(rag.delete_file("a.rs") > 0);
        assert_eq!(rag.delete_file("a.rs"), 0);
        let outcome = rag.index_file("a.rs", &src, 1).await.unwrap();
        assert!(matches!(outcome, IndexOutcome::Indexed { removed: 0, .. }));
    }

    #[tokio::test]
    async fn snapshot_roundtrip_reproduces_search() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rag.json");

        let rag = store();
        rag.index_file("a.rs", &functions(&["open_file", "read_bytes"]), 5)
            .await
            .unwrap();
        rag.index_file("b.rs", &functions(&["parse_header", "read_frame"]), 6)
            .await
            .unwrap();
        rag.save_snapshot(&path).unwrap();

        let restored = store();
        let stats = restored.load_snapshot(&path).unwrap().unwrap();
        assert_eq!(stats.chunks, rag.stats().chunks);

        for q in ["read", "parse header", "open file bytes"] {
            let a = rag.search(q, 10, -1.0).await.unwrap();
            let b = restored.search(q, 10, -1.0).await.unwrap();
            let ids_a: Vec<_> = a.iter().map(|h| h.chunk.chunk_id.clone()).collect();
            let ids_b: Vec<_> = b.iter().map(|h| h.chunk.chunk_id.clone()).collect();
            assert_eq!(ids_a, ids_b);
        }

        // Unchanged content after restore is still a no-op.
        let again = restored
            .index_file("a.rs", &functions(&["open_file", "read_bytes"]), 5)
            .await
            .unwrap();
        assert_eq!(again, IndexOutcome::Unchanged);
    }

    #[tokio::test]
    async fn snapshot_from_other_model_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rag.json");
        store().save_snapshot(&path).unwrap();

        let other = RagStore::new(Arc::new(HashingEmbedder::new(64)), ChunkParams::default());
        let err = other.load_snapshot(&path).unwrap_err();
        assert!(matches!(err, ContextError::IndexCorrupt(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn searches_see_whole_versions_during_reindex() {
        let rag = Arc::new(store());
        let v1 = functions(&["one", "two"]);
        let v2 = functions(&["one", "two", "three", "four", "five", "six"]);
        let n1 = chunk_code(&v1, rag.params).len();
        let n2 = chunk_code(&v2, rag.params).len();
        rag.index_file("f.rs", &v1, 1).await.unwrap();

        let writer = {
            let rag = rag.clone();
            tokio::spawn(async move {
                for i in 0..50 {
                    let src = if i % 2 == 0 { &v2 } else { &v1 };
                    rag.index_file("f.rs", src, i).await.unwrap();
                }
            })
        };

        let mut readers = Vec::new();
        for _ in 0..4 {
            let rag = rag.clone();
            readers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let hits = rag.search("one two three", 100, -1.0).await.unwrap();
                    let count = hits.iter().filter(|h| h.chunk.file_path == "f.rs").count();
                    assert!(count == n1 || count == n2, "saw {count} chunks");
                    tokio::task::yield_now().await;
                }
            }));
        }

        writer.await.unwrap();
        for r in readers {
            r.await.unwrap();
        }
    }
}
