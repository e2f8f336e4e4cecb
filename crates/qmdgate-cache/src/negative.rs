//! Deep-negative cache.
//!
//! Records recent deep-path failures so the orchestrator can short-circuit
//! deep attempts that are likely to fail again. Two record kinds share one
//! lock:
//!
//! - *exact*: keyed by (scope, normalized query prefix), expires after the
//!   configured TTL
//! - *scope cooldown*: installed once a scope accumulates enough failures
//!   inside a rolling window; while active, every deep attempt in that scope
//!   is deflected

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

const SCOPE_FAIL_THRESHOLD: usize = 3;
const SCOPE_FAIL_WINDOW: Duration = Duration::from_secs(300);
const EXACT_KEY_MAX_RUNES: usize = 64;

/// Why a deep attempt was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    ExactNegative,
    ScopeCooldown,
}

impl SkipReason {
    /// The degrade-reason string reported to clients.
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::ExactNegative => "deep_negative_cached_fallback_broad",
            SkipReason::ScopeCooldown => "deep_negative_scope_cooldown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeepNegativeConfig {
    /// TTL for exact records; zero disables the cache entirely
    pub ttl: Duration,
    /// Cooldown installed after repeated scope failures; zero disables
    pub scope_cooldown: Duration,
    /// Scope cooldowns only apply while the deep path is enabled
    pub deep_enabled: bool,
}

#[derive(Default)]
struct Inner {
    /// key -> expiry
    entries: HashMap<String, Instant>,
    /// scope -> failure timestamps within the rolling window
    scope_fails: HashMap<String, Vec<Instant>>,
    mark_count: u64,
    exact_hit_count: u64,
    scope_hit_count: u64,
}

/// Shared deep-failure memory, one mutex for both maps.
pub struct DeepNegativeCache {
    cfg: DeepNegativeConfig,
    inner: Mutex<Inner>,
}

impl DeepNegativeCache {
    pub fn new(cfg: DeepNegativeConfig) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Whether a deep attempt for (query, scope) should be skipped, and why.
    /// Expired records encountered on the read path are dropped in place.
    pub fn should_skip(&self, query: &str, scope: &str) -> Option<SkipReason> {
        if self.cfg.ttl.is_zero() {
            return None;
        }

        let now = Instant::now();
        let exact_key = exact_key(query, scope);
        let cooldown_key = scope_cooldown_key(scope);

        let mut inner = self.inner.lock().unwrap();

        if let Some(&expiry) = inner.entries.get(&exact_key) {
            if now > expiry {
                inner.entries.remove(&exact_key);
            } else {
                inner.exact_hit_count += 1;
                return Some(SkipReason::ExactNegative);
            }
        }

        // Scope cooldown is only meaningful when deep query is enabled.
        if !self.cfg.deep_enabled {
            return None;
        }

        if let Some(&expiry) = inner.entries.get(&cooldown_key) {
            if now > expiry {
                inner.entries.remove(&cooldown_key);
            } else {
                inner.scope_hit_count += 1;
                return Some(SkipReason::ScopeCooldown);
            }
        }

        None
    }

    /// Record a deep failure: install the exact record and, when deep is
    /// enabled, contribute to the scope's failure window.
    pub fn mark_failure(&self, query: &str, scope: &str) {
        if self.cfg.ttl.is_zero() {
            return;
        }

        let now = Instant::now();
        let exact = exact_key(query, scope);

        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(exact, now + self.cfg.ttl);
        inner.mark_count += 1;

        if !self.cfg.deep_enabled || self.cfg.scope_cooldown.is_zero() {
            return;
        }

        let scope = normalize_scope(scope);
        let fails = inner.scope_fails.entry(scope.clone()).or_default();
        fails.retain(|&ts| now.duration_since(ts) <= SCOPE_FAIL_WINDOW);
        fails.push(now);

        if fails.len() < SCOPE_FAIL_THRESHOLD {
            return;
        }

        inner.scope_fails.remove(&scope);
        inner
            .entries
            .insert(scope_cooldown_key(&scope), now + self.cfg.scope_cooldown);
        warn!(%scope, cooldown = ?self.cfg.scope_cooldown, "deep negative scope cooldown activated");
    }

    /// Drop expired records and prune stale window entries; returns how many
    /// expired records were removed.
    pub fn cleanup(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();

        let before = inner.entries.len();
        inner.entries.retain(|_, &mut expiry| now <= expiry);
        let removed = before - inner.entries.len();

        inner.scope_fails.retain(|_, fails| {
            fails.retain(|&ts| now.duration_since(ts) <= SCOPE_FAIL_WINDOW);
            !fails.is_empty()
        });

        removed
    }

    /// (marks, exact hits, scope hits) for telemetry.
    pub fn counters(&self) -> (u64, u64, u64) {
        let inner = self.inner.lock().unwrap();
        (inner.mark_count, inner.exact_hit_count, inner.scope_hit_count)
    }
}

fn normalize_scope(scope: &str) -> String {
    let scope = scope.trim();
    if scope.is_empty() {
        "all".to_string()
    } else {
        scope.to_string()
    }
}

/// Exact key: hash of scope plus the lowercased, whitespace-collapsed query
/// truncated to 64 runes.
fn exact_key(query: &str, scope: &str) -> String {
    let q = query.trim().to_lowercase();
    let q = q.split_whitespace().collect::<Vec<_>>().join(" ");
    let q: String = q.chars().take(EXACT_KEY_MAX_RUNES).collect();
    blake3::hash(format!("{scope}|{q}").as_bytes())
        .to_hex()
        .to_string()
}

fn scope_cooldown_key(scope: &str) -> String {
    let scope = normalize_scope(scope);
    blake3::hash(format!("scope_cooldown|{scope}").as_bytes())
        .to_hex()
        .to_string()
}
