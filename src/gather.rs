//! Context Gatherer: concurrent fan-out, deadline-bounded collection, and
//! ranking into one [`ContextBundle`].
//!
//! # Request lifecycle
//!
//! 1. A newer request for the same `session_id` cancels the older one's
//!    [`CancellationToken`]; the older request returns what it has, marked
//!    [`BundleStatus::Superseded`].
//! 2. Every enabled source gets its own task. A task answers from the
//!    [`ContextCache`] when it can, otherwise asks the [`HealthTracker`] for
//!    admission and fetches under the source's soft timeout. A fetch that
//!    misses its timeout is reported as a timeout, then left running for up
//!    to `late_result_grace_ms` so its result can still be cached.
//! 3. The current file is read in parallel, with one retry on a transient
//!    error. It is not gated by the breaker. If it cannot be read the bundle
//!    is marked [`BundleStatus::Degraded`].
//! 4. The collector waits until every task has answered or the total
//!    deadline passes, whichever comes first.
//! 5. Results are ordered by source registration order (never by arrival
//!    order) and handed to [`rank_and_truncate`].
//!
//! Source failures never escape `gather`; they only mean fewer items.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

use context_daemon_core::cache::ContextCache;
use context_daemon_core::health::{Admission, HealthTracker};
use context_daemon_core::rank::rank_and_truncate;
use context_daemon_core::source::{ContextSource, QueryFingerprint};
use context_daemon_core::{
    BundleStatus, CompletionQuery, ContextBundle, ContextError, ContextItem, SourceId,
};

use crate::config::{ContextConfig, BUFFER_SOURCE};

/// Reads the text of the file being edited.
#[async_trait]
pub trait CurrentFileReader: Send + Sync {
    async fn read_current(&self, query: &CompletionQuery) -> Result<String, ContextError>;
}

/// What one source task reported back.
#[derive(Debug)]
enum SourceOutcome {
    Cached(Arc<Vec<ContextItem>>),
    Fetched(Vec<ContextItem>),
    Failed(ContextError),
    Skipped(&'static str),
}

enum Message {
    Current(Result<String, ContextError>),
    Source {
        index: usize,
        id: SourceId,
        outcome: SourceOutcome,
    },
}

struct Session {
    seq: u64,
    token: CancellationToken,
}

pub struct ContextGatherer {
    sources: Vec<Arc<dyn ContextSource>>,
    current: Option<Arc<dyn CurrentFileReader>>,
    current_file_score: f32,
    cache: Arc<ContextCache>,
    health: Arc<HealthTracker>,
    settings: ContextConfig,
    sessions: DashMap<String, Session>,
    next_seq: AtomicU64,
}

impl ContextGatherer {
    pub fn new(
        cache: Arc<ContextCache>,
        health: Arc<HealthTracker>,
        settings: ContextConfig,
    ) -> Self {
        Self {
            sources: Vec::new(),
            current: None,
            current_file_score: 1.0,
            cache,
            health,
            settings,
            sessions: DashMap::new(),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn with_current_file_reader(
        mut self,
        reader: Arc<dyn CurrentFileReader>,
        score: f32,
    ) -> Self {
        self.current = Some(reader);
        self.current_file_score = score;
        self
    }

    /// Register a source. Registration order is the tie-break order of the
    /// final bundle.
    pub fn with_source(mut self, source: Arc<dyn ContextSource>) -> Self {
        self.health.register(source.id());
        self.sources.push(source);
        self
    }

    pub fn sources(&self) -> &[Arc<dyn ContextSource>] {
        &self.sources
    }

    pub fn cache(&self) -> &Arc<ContextCache> {
        &self.cache
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn settings(&self) -> &ContextConfig {
        &self.settings
    }

    /// Gather a bundle for `query`. Never fails.
    pub async fn gather(&self, query: CompletionQuery) -> ContextBundle {
        let request_id = uuid::Uuid::new_v4();
        let span = info_span!("gather", %request_id, file = %query.file_path);
        self.gather_inner(query).instrument(span).await
    }

    fn begin_session(&self, query: &CompletionQuery) -> (CancellationToken, Option<(String, u64)>) {
        let token = CancellationToken::new();
        let Some(session_id) = &query.session_id else {
            return (token, None);
        };
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let previous = self.sessions.insert(
            session_id.clone(),
            Session {
                seq,
                token: token.clone(),
            },
        );
        if let Some(previous) = previous {
            debug!(session = %session_id, "superseding in-flight request");
            previous.token.cancel();
        }
        (token, Some((session_id.clone(), seq)))
    }

    fn end_session(&self, session: Option<(String, u64)>) {
        if let Some((id, seq)) = session {
            self.sessions.remove_if(&id, |_, s| s.seq == seq);
        }
    }

    async fn gather_inner(&self, query: CompletionQuery) -> ContextBundle {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + self.settings.total_timeout();
        let (token, session) = self.begin_session(&query);
        let query = Arc::new(query);

        let active: Vec<(usize, Arc<dyn ContextSource>)> = self
            .sources
            .iter()
            .enumerate()
            .filter(|(_, s)| self.settings.is_enabled(s.id()) && query.allows(s.id()))
            .map(|(i, s)| (i, Arc::clone(s)))
            .collect();

        let (tx, mut rx) = mpsc::channel(active.len() + 1);
        let mut pending = active.len();

        let read_current = self.current.is_some();
        if let Some(reader) = &self.current {
            pending += 1;
            let reader = Arc::clone(reader);
            let query = Arc::clone(&query);
            let tx = tx.clone();
            let timeout = Duration::from_millis(self.settings.current_file_timeout_ms);
            tokio::spawn(
                async move {
                    let result = read_current_with_retry(reader.as_ref(), &query, timeout).await;
                    let _ = tx.send(Message::Current(result)).await;
                }
                .in_current_span(),
            );
        }

        for (index, source) in active {
            let task = SourceTask {
                index,
                timeout: self.settings.source_timeout(source.id()),
                source,
                query: Arc::clone(&query),
                token: token.clone(),
                cache: Arc::clone(&self.cache),
                health: Arc::clone(&self.health),
                grace: Duration::from_millis(self.settings.late_result_grace_ms),
                tx: tx.clone(),
            };
            tokio::spawn(task.run().in_current_span());
        }
        drop(tx);

        let mut current: Option<Result<String, ContextError>> = None;
        let mut collected: Vec<(usize, Vec<ContextItem>)> = Vec::new();
        let mut superseded = false;

        while pending > 0 {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    superseded = true;
                    break;
                }
                _ = tokio::time::sleep_until(deadline) => {
                    debug!(pending, "total gather deadline reached");
                    break;
                }
                message = rx.recv() => {
                    let Some(message) = message else { break };
                    pending -= 1;
                    match message {
                        Message::Current(result) => current = Some(result),
                        Message::Source { index, id, outcome } => match outcome {
                            SourceOutcome::Cached(items) => {
                                debug!(source = %id, items = items.len(), "cache hit");
                                collected.push((index, items.as_ref().clone()));
                            }
                            SourceOutcome::Fetched(items) => {
                                debug!(source = %id, items = items.len(), "source answered");
                                collected.push((index, items));
                            }
                            SourceOutcome::Failed(err) => {
                                debug!(
                                    source = %id,
                                    error = %err,
                                    code = err.code(),
                                    "source failed"
                                );
                            }
                            SourceOutcome::Skipped(reason) => {
                                debug!(source = %id, reason, "source skipped");
                            }
                        },
                    }
                }
            }
        }
        self.end_session(session);

        collected.sort_by_key(|(index, _)| *index);

        let mut warnings = Vec::new();
        let mut items = Vec::new();
        let mut current_ok = !read_current;
        match current {
            Some(Ok(text)) => {
                current_ok = true;
                items.push(
                    ContextItem::new(SourceId::new(BUFFER_SOURCE), text, self.current_file_score)
                        .with_origin(query.file_path.clone())
                        .as_current_file(),
                );
            }
            Some(Err(err)) => {
                warn!(error = %err, "current file could not be read");
                warnings.push(format!("current file unavailable: {}", err));
            }
            None if read_current => {
                warnings.push("current file not read before the gather deadline".to_string());
            }
            None => {}
        }
        items.extend(collected.into_iter().flat_map(|(_, items)| items));

        let truncation = rank_and_truncate(items, self.settings.context_budget_bytes);
        if let Some(overrun) = truncation.overrun {
            warn!(error = %overrun, "mandatory current file exceeds the context budget");
            warnings.push(overrun.to_string());
        }

        let sources_used: BTreeSet<SourceId> = truncation
            .items
            .iter()
            .map(|i| i.source_id().clone())
            .collect();
        let status = if superseded {
            BundleStatus::Superseded
        } else if !current_ok {
            BundleStatus::Degraded
        } else {
            BundleStatus::Complete
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        debug!(
            items = truncation.items.len(),
            total_bytes = truncation.total_bytes,
            excluded = truncation.excluded_by_budget,
            elapsed_ms,
            ?status,
            "bundle ready"
        );

        ContextBundle {
            items: truncation.items,
            total_bytes: truncation.total_bytes,
            sources_used,
            status,
            warnings,
            elapsed_ms,
        }
    }
}

async fn read_current_with_retry(
    reader: &dyn CurrentFileReader,
    query: &CompletionQuery,
    timeout: Duration,
) -> Result<String, ContextError> {
    let attempt = || async {
        match tokio::time::timeout(timeout, reader.read_current(query)).await {
            Ok(result) => result,
            Err(_) => Err(ContextError::SourceTimeout {
                source_id: SourceId::new(BUFFER_SOURCE),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    };
    match attempt().await {
        Err(err) if err.is_transient() => {
            debug!(error = %err, "retrying current file read");
            attempt().await
        }
        other => other,
    }
}

/// One source's work for one request.
struct SourceTask {
    index: usize,
    source: Arc<dyn ContextSource>,
    query: Arc<CompletionQuery>,
    token: CancellationToken,
    cache: Arc<ContextCache>,
    health: Arc<HealthTracker>,
    timeout: Duration,
    grace: Duration,
    tx: mpsc::Sender<Message>,
}

impl SourceTask {
    async fn send(&self, outcome: SourceOutcome) {
        // The collector may already have returned; the outcome is then moot.
        let _ = self
            .tx
            .send(Message::Source {
                index: self.index,
                id: self.source.id().clone(),
                outcome,
            })
            .await;
    }

    /// Cache `items`, indexed by the fingerprint's paths plus every path the
    /// items came from, so saving any of them invalidates the entry.
    fn store(&self, fingerprint: &QueryFingerprint, items: &[ContextItem]) {
        let mut paths = fingerprint.paths.clone();
        for path in items.iter().filter_map(|i| i.origin_path()) {
            if !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
        let key = ContextCache::key_for(self.source.id(), fingerprint);
        self.cache
            .put_for_class(key, items.to_vec(), paths, self.source.cache_class());
    }

    async fn run(self) {
        if self.token.is_cancelled() {
            self.send(SourceOutcome::Skipped("request superseded")).await;
            return;
        }

        let id = self.source.id().clone();
        let fingerprint = self.source.fingerprint(&self.query);
        let cacheable = self.cache.ttls().ttl_for(self.source.cache_class()).is_some();
        if cacheable {
            let key = ContextCache::key_for(&id, &fingerprint);
            if let Some(hit) = self.cache.get(&key) {
                self.send(SourceOutcome::Cached(hit)).await;
                return;
            }
        }

        let attempt = match self.health.admit(&id) {
            Admission::Allowed(attempt) => attempt,
            Admission::Trial(attempt) => {
                debug!(source = %id, "half-open trial request");
                attempt
            }
            Admission::Rejected { retry_in } => {
                debug!(source = %id, retry_in_ms = retry_in.as_millis() as u64, "breaker open");
                self.send(SourceOutcome::Skipped("circuit open")).await;
                return;
            }
        };

        let fetch = self.source.fetch(&self.query);
        tokio::pin!(fetch);

        let result = tokio::select! {
            result = &mut fetch => Some(result),
            _ = tokio::time::sleep(self.timeout) => None,
        };

        match result {
            Some(Ok(items)) => {
                attempt.succeed();
                if cacheable {
                    self.store(&fingerprint, &items);
                }
                self.send(SourceOutcome::Fetched(items)).await;
            }
            Some(Err(err)) => {
                attempt.fail(&err);
                self.send(SourceOutcome::Failed(err)).await;
            }
            None => {
                let err = ContextError::SourceTimeout {
                    source_id: id.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                };
                warn!(
                    source = %id,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "source timed out"
                );
                attempt.fail(&err);
                self.send(SourceOutcome::Failed(err)).await;

                if cacheable {
                    if let Ok(Ok(items)) = tokio::time::timeout(self.grace, &mut fetch).await {
                        debug!(source = %id, items = items.len(), "caching late result");
                        self.store(&fingerprint, &items);
                    }
                }
            }
        }
    }
}
