//! Daemon lifecycle: construction of all process-wide state, editor
//! notifications, and orderly shutdown.
//!
//! [`Daemon::start`] builds, in order: the context cache, the health
//! tracker, the buffer store, one adapter per configured resource server,
//! the semantic index (restored from its snapshot when one exists), the
//! gatherer, the background indexer, and the cache sweeper.
//!
//! [`Daemon::shutdown`] cancels the background tasks, stops server
//! processes, flushes the cache, and persists the index snapshot.
//!
//! Every path arriving from the editor goes through [`Daemon::normalize_path`]
//! first, so requests, notifications and the index agree on one key per file.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use context_daemon_core::cache::ContextCache;
use context_daemon_core::health::{HealthSnapshot, HealthTracker};
use context_daemon_core::rag::RagStore;
use context_daemon_core::store::IndexStats;
use context_daemon_core::{CompletionQuery, ContextBundle, ContextError};

use crate::config::Config;
use crate::embedding::create_provider;
use crate::gather::ContextGatherer;
use crate::indexer::{Indexer, IndexerHandle};
use crate::mcp::StdioResourceClient;
use crate::paths::PathNormalizer;
use crate::source_buffer::{BufferSource, BufferStore};
use crate::source_resource::ResourceSource;
use crate::source_semantic::SemanticSource;
use crate::sources::SourceInfo;

pub struct Daemon {
    config: Config,
    paths: PathNormalizer,
    gatherer: Arc<ContextGatherer>,
    buffers: Arc<BufferStore>,
    rag: Option<Arc<RagStore>>,
    indexer: Option<IndexerHandle>,
    clients: Vec<Arc<StdioResourceClient>>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Daemon {
    pub async fn start(config: Config) -> Result<Self> {
        let token = CancellationToken::new();
        let mut tasks = Vec::new();
        let paths = PathNormalizer::new(&config.rag.root);

        let cache = Arc::new(ContextCache::new(config.cache.ttls()));
        let health = Arc::new(HealthTracker::new(config.breaker.to_breaker_config()));
        let buffers = Arc::new(BufferStore::new());

        let buffer_source = Arc::new(BufferSource::new(Arc::clone(&buffers), &config.buffer));
        let mut gatherer =
            ContextGatherer::new(Arc::clone(&cache), Arc::clone(&health), config.context.clone())
                .with_current_file_reader(buffer_source.clone(), config.buffer.current_file_score)
                .with_source(buffer_source.clone());

        let mut clients = Vec::new();
        for server in config.servers.iter().filter(|s| !s.disabled) {
            let client = Arc::new(StdioResourceClient::new(server.clone()));
            let source = ResourceSource::from_config(server, client.clone());
            gatherer = gatherer.with_source(Arc::new(source));
            clients.push(client);
        }

        let mut rag = None;
        let mut indexer = None;
        if let Some(provider) = create_provider(&config.embedding)? {
            let store = Arc::new(
                RagStore::new(provider, config.rag.chunk_params())
                    .with_batch_size(config.embedding.batch_size),
            );
            restore_snapshot(&store, config.rag.snapshot_path.as_ref());

            gatherer = gatherer.with_source(Arc::new(SemanticSource::new(
                Arc::clone(&store),
                buffer_source.clone(),
                &config.rag,
            )));

            match Indexer::new(Arc::clone(&store), &config.rag) {
                Ok(ix) => {
                    let (handle, task) = ix.spawn(token.child_token());
                    // Brings a restored snapshot up to date; unchanged files are no-ops.
                    handle.scan();
                    tasks.push(task);
                    indexer = Some(handle);
                }
                Err(e) => warn!(error = %e, "indexer disabled"),
            }
            rag = Some(store);
        }

        tasks.push(spawn_cache_sweeper(
            Arc::clone(&cache),
            Duration::from_secs(config.daemon.cache_sweep_interval_secs.max(1)),
            token.child_token(),
        ));

        info!(
            sources = gatherer.sources().len(),
            semantic = rag.is_some(),
            "daemon started"
        );

        Ok(Self {
            config,
            paths,
            gatherer: Arc::new(gatherer),
            buffers,
            rag,
            indexer,
            clients,
            token,
            tasks,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn gatherer(&self) -> &Arc<ContextGatherer> {
        &self.gatherer
    }

    pub fn rag(&self) -> Option<&Arc<RagStore>> {
        self.rag.as_ref()
    }

    /// Canonical key for an editor-supplied path. Relative paths resolve
    /// against `rag.root`.
    pub fn normalize_path(&self, path: &str) -> String {
        self.paths.key(path)
    }

    pub async fn gather(&self, mut query: CompletionQuery) -> ContextBundle {
        query.file_path = self.normalize_path(&query.file_path);
        self.gatherer.gather(query).await
    }

    /// Drop cache entries that depend on `key` or list its directory.
    fn invalidate(&self, key: &str) -> usize {
        let cache = self.gatherer.cache();
        let mut removed = cache.invalidate(key);
        if let Some(dir) = Path::new(key).parent() {
            removed += cache.invalidate(&dir.to_string_lossy());
        }
        removed
    }

    /// A file was written to disk.
    pub fn file_saved(&self, path: &str) {
        let key = self.normalize_path(path);
        let removed = self.invalidate(&key);
        tracing::debug!(path = %key, removed, "file saved");
        if let Some(indexer) = &self.indexer {
            indexer.upsert(PathBuf::from(key));
        }
    }

    /// A file was removed from disk.
    pub fn file_deleted(&self, path: &str) {
        let key = self.normalize_path(path);
        self.invalidate(&key);
        self.buffers.close(&key);
        if let Some(indexer) = &self.indexer {
            indexer.remove(PathBuf::from(key));
        } else if let Some(rag) = &self.rag {
            rag.delete_file(&key);
        }
    }

    pub fn buffer_update(&self, path: &str, text: String) {
        let key = self.normalize_path(path);
        self.buffers.update(&key, text);
        self.invalidate(&key);
    }

    pub fn buffer_closed(&self, path: &str) {
        let key = self.normalize_path(path);
        if self.buffers.close(&key) {
            self.invalidate(&key);
        }
    }

    pub fn source_health(&self) -> Vec<HealthSnapshot> {
        self.gatherer.health().snapshot()
    }

    pub fn sources(&self) -> Vec<SourceInfo> {
        let ttls = self.gatherer.cache().ttls();
        self.gatherer
            .sources()
            .iter()
            .map(|s| SourceInfo {
                id: s.id().clone(),
                kind: s.kind(),
                cached: ttls.ttl_for(s.cache_class()).is_some(),
                enabled: self.config.context.is_enabled(s.id()),
            })
            .collect()
    }

    pub fn index_stats(&self) -> Option<IndexStats> {
        self.rag.as_ref().map(|r| r.stats())
    }

    pub async fn shutdown(self) -> Result<()> {
        info!("daemon shutting down");
        self.token.cancel();
        for task in self.tasks {
            if tokio::time::timeout(Duration::from_secs(5), task).await.is_err() {
                warn!("background task did not stop in time");
            }
        }
        for client in &self.clients {
            client.shutdown().await;
        }
        self.gatherer.cache().clear();

        if let (Some(rag), Some(path)) = (&self.rag, &self.config.rag.snapshot_path) {
            rag.save_snapshot(path)
                .with_context(|| format!("Failed to write index snapshot: {}", path.display()))?;
            let stats = rag.stats();
            info!(
                path = %path.display(),
                files = stats.files,
                chunks = stats.chunks,
                "index snapshot saved"
            );
        }
        info!("daemon stopped");
        Ok(())
    }
}

/// Load the snapshot into `store`. An unusable snapshot is logged and the
/// index starts empty; the startup scan rebuilds it.
pub fn restore_snapshot(store: &RagStore, path: Option<&PathBuf>) {
    let Some(path) = path else {
        return;
    };
    match store.load_snapshot(path) {
        Ok(Some(stats)) => info!(
            path = %path.display(),
            files = stats.files,
            chunks = stats.chunks,
            "index snapshot restored"
        ),
        Ok(None) => info!(path = %path.display(), "no index snapshot; building from scratch"),
        Err(e @ ContextError::IndexCorrupt(_)) => {
            warn!(
                path = %path.display(),
                error = %e,
                "index snapshot unusable; rebuilding from scratch"
            )
        }
        Err(e) => warn!(path = %path.display(), error = %e, "failed to read index snapshot"),
    }
}

fn spawn_cache_sweeper(
    cache: Arc<ContextCache>,
    every: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    let swept = cache.sweep_expired();
                    if swept > 0 {
                        tracing::debug!(swept, "expired cache entries swept");
                    }
                }
            }
        }
    })
}
