//! JSON snapshot format for [`ChunkIndex`].
//!
//! Vectors are stored as base64 of little-endian `f32` bytes, so a restored
//! index holds bit-identical embeddings and answers identical queries
//! identically. Files are written to a temporary sibling and renamed into
//! place.

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{ChunkIndex, FileChunks, IndexStats, IndexedChunk};
use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::ContextError;

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub version: u32,
    pub model: String,
    pub dims: usize,
    pub files: Vec<SnapshotFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub path: String,
    pub content_hash: String,
    pub mtime: i64,
    pub chunks: Vec<SnapshotChunk>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotChunk {
    pub chunk_id: String,
    pub start: usize,
    pub end: usize,
    pub content_hash: String,
    pub content: String,
    pub vector: String,
}

impl IndexSnapshot {
    /// Read a snapshot from disk. A missing file is `Ok(None)`; anything that
    /// does not parse is [`ContextError::IndexCorrupt`].
    pub fn read_from(path: &Path) -> Result<Option<Self>, ContextError> {
        let raw = match std::fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: IndexSnapshot = serde_json::from_slice(&raw)
            .map_err(|e| ContextError::IndexCorrupt(format!("{}: {}", path.display(), e)))?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(ContextError::IndexCorrupt(format!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(Some(snapshot))
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ContextError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        // A failed write is an I/O problem; IndexCorrupt is only for reads.
        let json = serde_json::to_vec(self).map_err(std::io::Error::other)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// A snapshot built by a different embedding model cannot be searched
    /// with this one's query vectors.
    pub fn check_compatible(&self, model: &str, dims: usize) -> Result<(), ContextError> {
        if self.model != model || self.dims != dims {
            return Err(ContextError::IndexCorrupt(format!(
                "snapshot built with {} ({} dims), current embedder is {} ({} dims)",
                self.model, self.dims, model, dims
            )));
        }
        Ok(())
    }
}

impl ChunkIndex {
    pub fn to_snapshot(&self, model: &str, dims: usize) -> IndexSnapshot {
        let files = self
            .current()
            .iter()
            .map(|(path, file)| SnapshotFile {
                path: path.clone(),
                content_hash: file.content_hash.clone(),
                mtime: file.mtime,
                chunks: file
                    .chunks
                    .iter()
                    .map(|c| SnapshotChunk {
                        chunk_id: c.chunk_id.clone(),
                        start: c.byte_range.start,
                        end: c.byte_range.end,
                        content_hash: c.content_hash.clone(),
                        content: c.content.clone(),
                        vector: BASE64.encode(vec_to_blob(&c.embedding)),
                    })
                    .collect(),
            })
            .collect();
        IndexSnapshot {
            version: SNAPSHOT_VERSION,
            model: model.to_string(),
            dims,
            files,
        }
    }

    /// Replace the whole index with the contents of `snapshot`. The index is
    /// left untouched if any chunk fails to decode.
    pub fn restore(&self, snapshot: IndexSnapshot) -> Result<IndexStats, ContextError> {
        let mut decoded = Vec::with_capacity(snapshot.files.len());
        for file in snapshot.files {
            let mut chunks = Vec::with_capacity(file.chunks.len());
            for c in file.chunks {
                let blob = BASE64.decode(c.vector.as_bytes()).map_err(|e| {
                    ContextError::IndexCorrupt(format!("{} chunk {}: {}", file.path, c.chunk_id, e))
                })?;
                let embedding = blob_to_vec(&blob)
                    .filter(|v| v.len() == snapshot.dims)
                    .ok_or_else(|| {
                        ContextError::IndexCorrupt(format!(
                            "{} chunk {}: vector does not have {} dims",
                            file.path, c.chunk_id, snapshot.dims
                        ))
                    })?;
                if c.start > c.end {
                    return Err(ContextError::IndexCorrupt(format!(
                        "{} chunk {}: inverted byte range",
                        file.path, c.chunk_id
                    )));
                }
                chunks.push(IndexedChunk {
                    chunk_id: c.chunk_id,
                    file_path: file.path.clone(),
                    byte_range: c.start..c.end,
                    embedding,
                    content_hash: c.content_hash,
                    mtime: file.mtime,
                    content: c.content,
                });
            }
            decoded.push((
                file.path,
                Arc::new(FileChunks {
                    content_hash: file.content_hash,
                    mtime: file.mtime,
                    chunks,
                }),
            ));
        }

        self.update(|map| {
            map.clear();
            map.extend(decoded);
        });
        Ok(self.stats())
    }
}
