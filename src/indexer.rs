//! Background indexer for the semantic chunk index.
//!
//! Runs as a single tokio task consuming [`IndexJob`]s from a queue, so
//! indexing never competes with itself and stays off the request path. Each
//! processed file is followed by a `rag.index_interval_ms` pause.
//!
//! A full [`IndexJob::Scan`] walks `rag.root` with `walkdir`, filters with
//! `globset` include/exclude patterns (plus `.git`, `target`, and
//! `node_modules` excludes), reindexes every match, and drops index entries
//! for files that no longer exist.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use context_daemon_core::rag::{IndexOutcome, RagStore};

use crate::config::RagConfig;
use crate::paths::PathNormalizer;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IndexJob {
    Upsert(PathBuf),
    Remove(PathBuf),
    Scan,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanStats {
    pub indexed: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Cheap handle for queueing index work.
#[derive(Clone)]
pub struct IndexerHandle {
    tx: mpsc::UnboundedSender<IndexJob>,
}

impl IndexerHandle {
    pub fn submit(&self, job: IndexJob) {
        if self.tx.send(job).is_err() {
            debug!("indexer stopped; dropping job");
        }
    }

    pub fn upsert(&self, path: impl Into<PathBuf>) {
        self.submit(IndexJob::Upsert(path.into()));
    }

    pub fn remove(&self, path: impl Into<PathBuf>) {
        self.submit(IndexJob::Remove(path.into()));
    }

    pub fn scan(&self) {
        self.submit(IndexJob::Scan);
    }
}

/// Decides which files under the root are indexed.
pub struct FileMatcher {
    paths: PathNormalizer,
    include: GlobSet,
    exclude: GlobSet,
    max_file_bytes: u64,
}

impl FileMatcher {
    pub fn new(config: &RagConfig) -> Result<Self> {
        if !config.root.exists() {
            bail!("rag.root does not exist: {}", config.root.display());
        }
        let paths = PathNormalizer::new(&config.root);

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(config.exclude_globs.iter().cloned());

        Ok(Self {
            paths,
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
            max_file_bytes: config.max_file_bytes,
        })
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    pub fn paths(&self) -> &PathNormalizer {
        &self.paths
    }

    /// Whether `path` (already normalized) is under the root and passes the
    /// glob filters.
    pub fn matches(&self, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(self.paths.root()) else {
            return false;
        };
        let rel = relative.to_string_lossy();
        !self.exclude.is_match(rel.as_ref()) && self.include.is_match(rel.as_ref())
    }

    /// Every matching file under the root, sorted.
    pub fn walk(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(self.paths.root()) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable path during scan");
                    continue;
                }
            };
            if entry.file_type().is_file() && self.matches(entry.path()) {
                files.push(entry.into_path());
            }
        }
        files.sort();
        Ok(files)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn mtime_secs(modified: std::io::Result<SystemTime>) -> i64 {
    modified
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

enum FileOutcome {
    Indexed,
    Unchanged,
    Removed,
    Skipped,
}

pub struct Indexer {
    rag: Arc<RagStore>,
    matcher: Arc<FileMatcher>,
    interval: Duration,
}

impl Indexer {
    pub fn new(rag: Arc<RagStore>, config: &RagConfig) -> Result<Self> {
        Ok(Self {
            rag,
            matcher: Arc::new(FileMatcher::new(config)?),
            interval: Duration::from_millis(config.index_interval_ms),
        })
    }

    pub fn root(&self) -> &Path {
        self.matcher.root()
    }

    /// Start the background task. It exits when `token` is cancelled or
    /// every handle is dropped.
    pub fn spawn(self, token: CancellationToken) -> (IndexerHandle, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx, token));
        (IndexerHandle { tx }, handle)
    }

    async fn run(self, mut rx: mpsc::UnboundedReceiver<IndexJob>, token: CancellationToken) {
        info!(root = %self.matcher.root().display(), "indexer started");
        loop {
            let job = tokio::select! {
                _ = token.cancelled() => break,
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            match job {
                IndexJob::Upsert(path) => {
                    if let Err(e) = self.index_path(&path).await {
                        warn!(path = %path.display(), error = %e, "failed to index file");
                    }
                    self.pause().await;
                }
                IndexJob::Remove(path) => {
                    let key = self.matcher.paths().key(&path);
                    let removed = self.rag.delete_file(&key);
                    debug!(path = %key, removed, "removed file from index");
                }
                IndexJob::Scan => match self.scan(&token).await {
                    Ok(stats) => info!(
                        indexed = stats.indexed,
                        unchanged = stats.unchanged,
                        removed = stats.removed,
                        failed = stats.failed,
                        "index scan complete"
                    ),
                    Err(e) => warn!(error = %e, "index scan failed"),
                },
            }
        }
        info!("indexer stopped");
    }

    async fn pause(&self) {
        if self.interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.interval).await;
        }
    }

    /// Walk the root and bring the index in line with it.
    pub async fn scan(&self, token: &CancellationToken) -> Result<ScanStats> {
        let matcher = Arc::clone(&self.matcher);
        let files = tokio::task::spawn_blocking(move || matcher.walk()).await??;
        let mut stats = ScanStats::default();

        let present: HashSet<String> = files.iter().map(|p| path_key(p)).collect();
        for stale in self
            .rag
            .index()
            .file_paths()
            .into_iter()
            .filter(|p| Path::new(p).starts_with(self.matcher.root()) && !present.contains(p))
        {
            stats.removed += usize::from(self.rag.delete_file(&stale) > 0);
        }

        for path in files {
            if token.is_cancelled() {
                debug!("scan cancelled");
                break;
            }
            match self.index_path(&path).await {
                Ok(FileOutcome::Indexed) => stats.indexed += 1,
                Ok(FileOutcome::Unchanged) => stats.unchanged += 1,
                Ok(FileOutcome::Removed) => stats.removed += 1,
                Ok(FileOutcome::Skipped) => stats.skipped += 1,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to index file");
                    stats.failed += 1;
                }
            }
            self.pause().await;
        }
        Ok(stats)
    }

    async fn index_path(&self, path: &Path) -> Result<FileOutcome> {
        let path = self.matcher.paths().normalize(path);
        if !self.matcher.matches(&path) {
            return Ok(FileOutcome::Skipped);
        }
        let key = path_key(&path);

        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.rag.delete_file(&key);
                return Ok(FileOutcome::Removed);
            }
            Err(e) => return Err(e.into()),
        };
        if meta.len() > self.matcher.max_file_bytes {
            debug!(path = %key, bytes = meta.len(), "file too large to index");
            self.rag.delete_file(&key);
            return Ok(FileOutcome::Skipped);
        }

        let bytes = tokio::fs::read(&path).await?;
        let Ok(content) = String::from_utf8(bytes) else {
            debug!(path = %key, "skipping non-UTF-8 file");
            return Ok(FileOutcome::Skipped);
        };

        match self
            .rag
            .index_file(&key, &content, mtime_secs(meta.modified()))
            .await?
        {
            IndexOutcome::Unchanged => Ok(FileOutcome::Unchanged),
            IndexOutcome::Indexed { .. } => Ok(FileOutcome::Indexed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context_daemon_core::chunk::ChunkParams;
    use context_daemon_core::embedding::HashingEmbedder;

    fn rag() -> Arc<RagStore> {
        Arc::new(RagStore::new(
            Arc::new(HashingEmbedder::new(64)),
            ChunkParams::default(),
        ))
    }

    fn config(root: &Path) -> RagConfig {
        RagConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.rs".to_string()],
            index_interval_ms: 0,
            ..RagConfig::default()
        }
    }

    #[test]
    fn matcher_applies_default_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let matcher = FileMatcher::new(&config(dir.path())).unwrap();
        let root = matcher.root().to_path_buf();
        assert!(matcher.matches(&root.join("src/lib.rs")));
        assert!(!matcher.matches(&root.join("target/debug/build.rs")));
        assert!(!matcher.matches(&root.join(".git/hooks/x.rs")));
        assert!(!matcher.matches(&root.join("README.md")));
        assert!(!matcher.matches(Path::new("/elsewhere/lib.rs")));
    }

    #[test]
    fn missing_root_is_an_error() {
        let cfg = RagConfig {
            root: PathBuf::from("/definitely/not/here"),
            ..RagConfig::default()
        };
        assert!(FileMatcher::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn scan_indexes_and_prunes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/a.rs"), "fn a() {}\n").unwrap();
        std::fs::write(dir.path().join("src/b.rs"), "fn b() {}\n").unwrap();
        std::fs::write(dir.path().join("notes.md"), "# notes\n").unwrap();

        let rag = rag();
        let indexer = Indexer::new(rag.clone(), &config(dir.path())).unwrap();
        let token = CancellationToken::new();

        let first = indexer.scan(&token).await.unwrap();
        assert_eq!(first.indexed, 2);
        assert_eq!(rag.stats().files, 2);

        let second = indexer.scan(&token).await.unwrap();
        assert_eq!(second.indexed, 0);
        assert_eq!(second.unchanged, 2);

        std::fs::remove_file(dir.path().join("src/b.rs")).unwrap();
        let third = indexer.scan(&token).await.unwrap();
        assert_eq!(third.removed, 1);
        assert_eq!(rag.stats().files, 1);
    }

    #[tokio::test]
    async fn background_jobs_upsert_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let rag = rag();
        let indexer = Indexer::new(rag.clone(), &config(dir.path())).unwrap();
        let file = indexer.root().join("live.rs");
        std::fs::write(&file, "fn live() {}\n").unwrap();

        let token = CancellationToken::new();
        let (handle, task) = indexer.spawn(token.clone());
        handle.upsert(file.clone());

        let key = file.to_string_lossy().to_string();
        for _ in 0..100 {
            if rag.index().contains_file(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(rag.index().contains_file(&key));

        handle.remove(file.clone());
        for _ in 0..100 {
            if !rag.index().contains_file(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!rag.index().contains_file(&key));

        token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn relative_jobs_use_canonical_keys() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::write(dir.path().join("src/rel.rs"), "fn rel() {}\n").unwrap();
        let rag = rag();
        let indexer = Indexer::new(rag.clone(), &config(dir.path())).unwrap();
        let key = indexer.root().join("src/rel.rs").to_string_lossy().to_string();

        assert!(matches!(
            indexer.index_path(Path::new("src/./rel.rs")).await.unwrap(),
            FileOutcome::Indexed
        ));
        assert_eq!(rag.index().file_paths(), vec![key.clone()]);

        let token = CancellationToken::new();
        let (handle, task) = indexer.spawn(token.clone());
        handle.remove("src/rel.rs");
        for _ in 0..100 {
            if !rag.index().contains_file(&key) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!rag.index().contains_file(&key));

        token.cancel();
        task.await.unwrap();
    }
}
