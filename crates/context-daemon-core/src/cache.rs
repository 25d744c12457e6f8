//! Time-bounded memoization of source fetch results.
//!
//! Entries are keyed by source id plus a query fingerprint and live in a
//! sharded concurrent map, so a slow writer for one key never stalls reads
//! of unrelated keys. Insertion replaces a whole entry under the shard lock:
//! readers see either the old value or the new one.
//!
//! Expired entries are logically absent. They are reclaimed lazily on
//! [`ContextCache::get`] or in bulk by [`ContextCache::sweep_expired`].
//!
//! A reverse index maps each referenced path to the keys that depend on it,
//! so invalidating a path touches only those entries. It may hold keys whose
//! entry has since moved on to other paths; every removal re-checks the
//! entry itself, and the sweep prunes such leftovers.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::trace;

use crate::error::ContextError;
use crate::models::{CacheClass, ContextItem, SourceId};
use crate::source::QueryFingerprint;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source_id: SourceId,
    pub fingerprint: String,
}

impl CacheKey {
    pub fn new(source_id: SourceId, fingerprint: impl Into<String>) -> Self {
        Self {
            source_id,
            fingerprint: fingerprint.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Arc<Vec<ContextItem>>,
    /// File paths this entry depends on; used by [`ContextCache::invalidate`].
    pub paths: Vec<String>,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) >= self.ttl
    }
}

/// TTL per [`CacheClass`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtls {
    pub file_content: Duration,
    pub resource_listing: Duration,
    pub documentation: Duration,
}

impl Default for CacheTtls {
    fn default() -> Self {
        Self {
            file_content: Duration::from_secs(30),
            resource_listing: Duration::from_secs(60),
            documentation: Duration::from_secs(300),
        }
    }
}

impl CacheTtls {
    /// `None` for classes that are never cached.
    pub fn ttl_for(&self, class: CacheClass) -> Option<Duration> {
        match class {
            CacheClass::FileContent => Some(self.file_content),
            CacheClass::ResourceListing => Some(self.resource_listing),
            CacheClass::Documentation => Some(self.documentation),
            CacheClass::Uncached => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

pub struct ContextCache {
    entries: DashMap<CacheKey, CacheEntry>,
    by_path: DashMap<String, HashSet<CacheKey>>,
    ttls: CacheTtls,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContextCache {
    pub fn new(ttls: CacheTtls) -> Self {
        Self {
            entries: DashMap::new(),
            by_path: DashMap::new(),
            ttls,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    pub fn key_for(source_id: &SourceId, fingerprint: &QueryFingerprint) -> CacheKey {
        CacheKey::new(source_id.clone(), fingerprint.key.clone())
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<Vec<ContextItem>>> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &CacheKey, now: Instant) -> Option<Arc<Vec<ContextItem>>> {
        let live = match self.entries.get(key) {
            Some(entry) if !entry.is_expired_at(now) => Some(Arc::clone(&entry.value)),
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match live {
            Some(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                // Only drop it if nobody replaced it in the meantime.
                self.entries.remove_if(key, |_, e| e.is_expired_at(now));
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or replace an entry. Last write wins.
    pub fn put(&self, key: CacheKey, value: Vec<ContextItem>, paths: Vec<String>, ttl: Duration) {
        self.put_at(key, value, paths, ttl, Instant::now());
    }

    pub fn put_at(
        &self,
        key: CacheKey,
        value: Vec<ContextItem>,
        paths: Vec<String>,
        ttl: Duration,
        now: Instant,
    ) {
        // Index before inserting so a concurrent invalidate cannot miss it.
        for path in &paths {
            self.by_path
                .entry(path.clone())
                .or_default()
                .insert(key.clone());
        }
        let entry = CacheEntry {
            value: Arc::new(value),
            paths,
            inserted_at: now,
            ttl,
        };
        if let Some(previous) = self.entries.insert(key.clone(), entry) {
            if !previous.is_expired_at(now) {
                trace!(
                    source = %key.source_id,
                    error = %ContextError::CacheWriteRaced(key.fingerprint.clone()),
                    "last write wins"
                );
            }
        }
    }

    /// Insert using the TTL of `class`. Returns `false` if the class is uncached.
    pub fn put_for_class(
        &self,
        key: CacheKey,
        value: Vec<ContextItem>,
        paths: Vec<String>,
        class: CacheClass,
    ) -> bool {
        match self.ttls.ttl_for(class) {
            Some(ttl) => {
                self.put(key, value, paths, ttl);
                true
            }
            None => false,
        }
    }

    /// Remove every entry whose fingerprint references `path`.
    pub fn invalidate(&self, path: &str) -> usize {
        let Some((_, keys)) = self.by_path.remove(path) else {
            return 0;
        };
        let removed = keys
            .iter()
            .filter(|key| {
                self.entries
                    .remove_if(*key, |_, entry| entry.paths.iter().any(|p| p == path))
                    .is_some()
            })
            .count();
        if removed > 0 {
            trace!(path, removed, "cache invalidated");
        }
        removed
    }

    /// Physically reclaim expired entries.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        let removed = before.saturating_sub(self.entries.len());
        self.by_path.retain(|path, keys| {
            keys.retain(|key| {
                self.entries
                    .get(key)
                    .is_some_and(|entry| entry.paths.iter().any(|p| p == path))
            });
            !keys.is_empty()
        });
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.by_path.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

impl Default for ContextCache {
    fn default() -> Self {
        Self::new(CacheTtls::default())
    }
}
