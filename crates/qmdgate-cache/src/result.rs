//! Fingerprint-keyed LRU result cache with TTL and version invalidation.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::Serialize;

use qmdgate_core::Hit;

/// The request fields that influence the result set. Two requests with equal
/// fingerprints must produce equal results from the cache.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SearchFingerprint {
    pub query: String,
    pub mode: String,
    pub collection: String,
    pub min_score: f64,
    pub top_k: usize,
    pub fallback: bool,
    pub files_only: bool,
    pub files_all: bool,
}

impl SearchFingerprint {
    /// Stable hex key for this fingerprint.
    pub fn key(&self) -> String {
        let data = serde_json::to_vec(self).expect("fingerprint serialization");
        blake3::hash(&data).to_hex().to_string()
    }
}

/// A finalized response stored in the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub results: Vec<Hit>,
    /// Backend primitive that produced the results
    pub mode: String,
    pub collections: Vec<String>,
    pub fallback_triggered: bool,
    pub degraded: bool,
    pub degrade_reason: String,
    pub index_version: String,
    pub created_at: Instant,
}

/// Cache behavior knobs.
#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub ttl: Duration,
    pub max_entries: usize,
    pub version_aware: bool,
}

struct Inner {
    entries: LruCache<String, CacheEntry>,
    version: String,
    hits: u64,
    misses: u64,
}

/// Capacity-bounded LRU keyed by search fingerprint.
pub struct ResultCache {
    inner: Mutex<Inner>,
    ttl: Duration,
    version_aware: bool,
    enabled: bool,
}

impl ResultCache {
    pub fn new(settings: &CacheSettings) -> Self {
        let cap = NonZeroUsize::new(settings.max_entries.max(1)).unwrap();
        Self {
            inner: Mutex::new(Inner {
                entries: LruCache::new(cap),
                version: String::new(),
                hits: 0,
                misses: 0,
            }),
            ttl: settings.ttl,
            version_aware: settings.version_aware,
            enabled: settings.enabled,
        }
    }

    /// Look up a fingerprint. Expired or version-stale entries are evicted
    /// and count as misses; a hit moves the entry to most-recently-used.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        if !self.enabled {
            return None;
        }

        let mut inner = self.inner.lock().unwrap();

        let stale = match inner.entries.peek(key) {
            None => None,
            Some(entry) => Some(
                entry.created_at.elapsed() > self.ttl
                    || (self.version_aware && entry.index_version != inner.version),
            ),
        };

        match stale {
            None => {
                inner.misses += 1;
                None
            }
            Some(true) => {
                inner.entries.pop(key);
                inner.misses += 1;
                None
            }
            Some(false) => {
                inner.hits += 1;
                inner.entries.get(key).cloned()
            }
        }
    }

    /// Insert at most-recently-used, stamping creation time and the current
    /// index version. The LRU evicts from the tail when over capacity.
    pub fn put(&self, key: String, mut entry: CacheEntry) {
        if !self.enabled {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        entry.index_version = inner.version.clone();
        entry.created_at = Instant::now();
        inner.entries.put(key, entry);
    }

    /// Atomically switch the index version; subsequent gets treat entries
    /// stamped with another version as misses.
    pub fn set_version(&self, version: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.version = version.to_string();
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
    }

    /// Sweep expired and version-mismatched entries; returns how many were
    /// removed.
    pub fn cleanup(&self) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let version = inner.version.clone();
        let stale: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| {
                e.created_at.elapsed() > self.ttl
                    || (self.version_aware && e.index_version != version)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for key in &stale {
            inner.entries.pop(key);
        }
        stale.len()
    }

    /// (current size, hits, misses). Counters are monotonic.
    pub fn stats(&self) -> (usize, u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.entries.len(), inner.hits, inner.misses)
    }

    pub fn healthy(&self) -> bool {
        !self.inner.is_poisoned()
    }
}
