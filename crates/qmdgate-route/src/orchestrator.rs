//! The search orchestrator.
//!
//! Composes the executor, collection registry, result cache, CPU guard, and
//! deep-negative cache into the full search pipeline:
//!
//! 1. cache lookup by fingerprint
//! 2. mode resolution (explicit tag or router heuristics, downgraded under
//!    overload or missing capabilities)
//! 3. single-collection or tier-1 fan-out execution, with tier-2 fallback
//! 4. deep/broad concurrent racing when the deep path is chosen
//! 5. finalization (dedup, diversity cap, snippet budgets) and cache write
//!
//! The orchestrator owns the deep-negative cache and the overload search
//! semaphore; the cache, guard, and registry are injected at construction.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use qmdgate_cache::{
    CacheEntry, DeepNegativeCache, DeepNegativeConfig, ResultCache, SearchFingerprint,
};
use qmdgate_core::{Capability, Error, Executor, Hit, Result, SearchMeta, SearchOpts};
use qmdgate_core::text::{count_cjk, count_words_max_fields_or_cjk};
use qmdgate_guard::CpuGuard;

use crate::finalize::{clean_snippets, dedup_sort_limit, enforce_max_chars, filter_min_score};
use crate::registry::CollectionRegistry;
use crate::router::{detect_mode, ExecMode};

const OBSERVATION_LOG_EVERY: u64 = 50;
const OBSERVATION_LOG_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Search tuning taken from the `search` config group.
#[derive(Debug, Clone)]
pub struct SearchSettings {
    pub coarse_k: usize,
    pub top_k: usize,
    pub min_score: f64,
    pub max_chars: usize,
    pub fallback_enabled: bool,
    pub files_all_max_hits: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            coarse_k: 20,
            top_k: 8,
            min_score: 0.3,
            max_chars: 9000,
            fallback_enabled: true,
            files_all_max_hits: 200,
        }
    }
}

/// Runtime budgets taken from the `runtime` config group.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub low_resource_mode: bool,
    pub allow_cpu_deep_query: bool,
    pub smart_routing: bool,
    pub cpu_deep_min_words: usize,
    pub cpu_deep_min_chars: usize,
    pub cpu_deep_max_words: usize,
    pub cpu_deep_max_chars: usize,
    pub cpu_deep_max_abstract_cues: usize,
    pub query_timeout: Duration,
    pub deep_fail_timeout: Duration,
    pub deep_negative_ttl: Duration,
    pub deep_negative_scope_cooldown: Duration,
    pub overload_max_concurrent_search: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            low_resource_mode: false,
            allow_cpu_deep_query: false,
            smart_routing: false,
            cpu_deep_min_words: 10,
            cpu_deep_min_chars: 24,
            cpu_deep_max_words: 28,
            cpu_deep_max_chars: 160,
            cpu_deep_max_abstract_cues: 2,
            query_timeout: Duration::from_secs(120),
            deep_fail_timeout: Duration::from_secs(15),
            deep_negative_ttl: Duration::from_secs(600),
            deep_negative_scope_cooldown: Duration::from_secs(600),
            overload_max_concurrent_search: 2,
        }
    }
}

/// One search request as seen by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub query: String,
    /// Requested mode tag: empty/`auto`, or `search`/`vsearch`/`query`
    pub mode: String,
    /// Single collection; empty means wildcard over primary tiers
    pub collection: String,
    /// 0 takes the configured default (or unlimited for files_all)
    pub top_k: usize,
    /// 0 takes the configured default
    pub min_score: f64,
    pub fallback: bool,
    pub files_only: bool,
    pub files_all: bool,
    pub disable_deep_escalation: bool,
    pub confirm: bool,
}

/// Finalized hits plus routing metadata.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub results: Vec<Hit>,
    pub meta: SearchMeta,
}

/// Constructor injection bundle.
pub struct OrchestratorDeps {
    pub exec: Arc<dyn Executor>,
    pub registry: Arc<CollectionRegistry>,
    pub cache: Arc<ResultCache>,
    pub guard: Arc<CpuGuard>,
    pub search: SearchSettings,
    pub runtime: RuntimeSettings,
}

#[derive(Default)]
struct Observation {
    count: AtomicU64,
    latency_ms_sum: AtomicU64,
    hits_sum: AtomicU64,
    hit_zero: AtomicU64,
    hit_low: AtomicU64,
    hit_mid: AtomicU64,
    hit_high: AtomicU64,
    degraded: AtomicU64,
    last_log_at: Mutex<Option<Instant>>,
}

pub struct Orchestrator {
    exec: Arc<dyn Executor>,
    registry: Arc<CollectionRegistry>,
    cache: Arc<ResultCache>,
    guard: Arc<CpuGuard>,
    deep_negative: DeepNegativeCache,
    search_cfg: SearchSettings,
    runtime: RuntimeSettings,
    search_tokens: Arc<Semaphore>,
    obs: Observation,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        let deep_negative = DeepNegativeCache::new(DeepNegativeConfig {
            ttl: deps.runtime.deep_negative_ttl,
            scope_cooldown: deps.runtime.deep_negative_scope_cooldown,
            deep_enabled: deps.runtime.allow_cpu_deep_query,
        });
        let max_concurrent = deps.runtime.overload_max_concurrent_search.max(1);
        Self {
            exec: deps.exec,
            registry: deps.registry,
            cache: deps.cache,
            guard: deps.guard,
            deep_negative,
            search_cfg: deps.search,
            runtime: deps.runtime,
            search_tokens: Arc::new(Semaphore::new(max_concurrent)),
            obs: Observation::default(),
        }
    }

    pub fn is_overloaded(&self) -> bool {
        self.guard.is_overloaded()
    }

    pub fn is_critical_overloaded(&self) -> bool {
        self.guard.is_critical_overloaded()
    }

    pub fn clear_cache(&self) {
        self.cache.clear();
    }

    /// Sweep the result cache; returns how many entries were removed.
    pub fn cleanup_cache(&self) -> usize {
        self.cache.cleanup()
    }

    /// Whether the result cache lock is still usable.
    pub fn cache_healthy(&self) -> bool {
        self.cache.healthy()
    }

    /// Sweep the deep-negative cache; returns how many records expired.
    pub fn cleanup_deep_negative(&self) -> usize {
        self.deep_negative.cleanup()
    }

    /// Whether a fingerprint-equal request is already cached. Used by the
    /// critical-overload shed pre-check.
    pub fn has_cached_result(&self, params: &SearchParams) -> bool {
        let mut params = params.clone();
        self.apply_defaults(&mut params);
        self.cache.get(&self.fingerprint(&params).key()).is_some()
    }

    /// Reconcile configured collections with the backend: register missing
    /// ones and sync context descriptions. Failures are logged per
    /// collection, never fatal.
    pub async fn ensure_collections(&self) {
        let existing = match self.exec.collection_list().await {
            Ok(cols) => cols,
            Err(err) => {
                warn!(%err, "failed to list collections, will try to add all");
                Vec::new()
            }
        };

        for col in self.registry.all() {
            if existing.iter().any(|c| c.name == col.name) {
                info!(name = %col.name, "collection already registered");
                continue;
            }

            info!(name = %col.name, path = %col.path, "registering collection");
            let mask = if col.mask.is_empty() { "**/*.md" } else { &col.mask };
            if let Err(err) = self.exec.collection_add(&col.path, &col.name, mask).await {
                warn!(name = %col.name, %err, "failed to add collection");
                continue;
            }

            if !col.context.is_empty() {
                if let Err(err) = self.exec.context_add(&col.path, &col.context).await {
                    warn!(name = %col.name, %err, "failed to add context");
                }
            }
        }

        self.sync_collection_contexts().await;
    }

    async fn sync_collection_contexts(&self) {
        let existing = match self.exec.context_list().await {
            Ok(list) => list,
            Err(err) => {
                warn!(%err, "failed to list contexts");
                return;
            }
        };

        for col in self.registry.all() {
            let wanted = col.context.trim();
            if wanted.is_empty() {
                continue;
            }
            let current = existing
                .iter()
                .find(|c| c.path == col.path)
                .map(|c| c.description.as_str());
            if current == Some(wanted) {
                continue;
            }

            if current.is_some() {
                info!(path = %col.path, "updating context");
                if let Err(err) = self.exec.context_remove(&col.path).await {
                    warn!(path = %col.path, %err, "failed to remove stale context");
                    continue;
                }
            }
            if let Err(err) = self.exec.context_add(&col.path, wanted).await {
                warn!(name = %col.name, %err, "failed to add context");
            }
        }
    }

    /// Run one search end to end.
    pub async fn search(&self, mut params: SearchParams) -> Result<SearchOutcome> {
        let start = Instant::now();
        self.apply_defaults(&mut params);

        let key = self.fingerprint(&params).key();
        if let Some(entry) = self.cache.get(&key) {
            return Ok(SearchOutcome {
                results: entry.results,
                meta: SearchMeta {
                    mode_used: entry.mode,
                    collections_searched: entry.collections,
                    fallback_triggered: entry.fallback_triggered,
                    cache_hit: true,
                    degraded: entry.degraded,
                    degrade_reason: entry.degrade_reason,
                    latency_ms: start.elapsed().as_millis() as i64,
                    ..SearchMeta::default()
                },
            });
        }

        let mode = self.resolve_mode(&params.mode, &params.query);

        if !params.collection.is_empty() {
            if mode == ExecMode::Query {
                return self.search_single_with_deep_race(params, key, start).await;
            }
            return self.search_single_collection(params, mode, key, start).await;
        }

        if mode == ExecMode::Query {
            return self.search_wildcard_with_deep_race(params, key, start).await;
        }
        self.search_with_fallback(params, mode, key, start).await
    }

    fn apply_defaults(&self, params: &mut SearchParams) {
        if params.top_k == 0 && !(params.files_only && params.files_all) {
            params.top_k = self.search_cfg.top_k;
        }
        if params.min_score <= 0.0 {
            params.min_score = self.search_cfg.min_score;
        }
    }

    fn fingerprint(&self, params: &SearchParams) -> SearchFingerprint {
        SearchFingerprint {
            query: params.query.clone(),
            mode: params.mode.clone(),
            collection: params.collection.clone(),
            min_score: params.min_score,
            top_k: params.top_k,
            fallback: params.fallback,
            files_only: params.files_only,
            files_all: params.files_all,
        }
    }

    fn resolve_mode(&self, requested: &str, query: &str) -> ExecMode {
        let is_auto = requested.is_empty() || requested == "auto";
        let mut mode = if is_auto {
            detect_mode(
                query,
                self.exec.has_capability(Capability::Vector),
                self.exec.has_capability(Capability::DeepQuery),
            )
        } else {
            ExecMode::from_tag(requested).unwrap_or(ExecMode::Search)
        };

        if self.is_overloaded() && mode != ExecMode::Search {
            warn!(requested_mode = mode.as_str(), "cpu overload protection forcing search mode");
            return ExecMode::Search;
        }

        match mode {
            ExecMode::Query => {
                if !self.exec.has_capability(Capability::DeepQuery) {
                    debug!("query mode unavailable, fallback to search");
                    mode = ExecMode::Search;
                } else if is_auto && !self.allow_auto_deep_query(query) {
                    debug!("auto query downgraded to search in smart_routing mode");
                    mode = ExecMode::Search;
                }
            }
            ExecMode::VSearch => {
                if !self.exec.has_capability(Capability::Vector) {
                    debug!("vsearch mode unavailable, fallback to search");
                    mode = ExecMode::Search;
                }
            }
            ExecMode::Search => {}
        }

        mode
    }

    /// Whether the runtime budget allows executing a deep query for this
    /// string. Outside the low-resource smart-routing profile, always yes.
    pub fn allow_deep_query(&self, query: &str) -> bool {
        self.allow_auto_deep_query(query)
    }

    fn allow_auto_deep_query(&self, query: &str) -> bool {
        let rt = &self.runtime;
        if !(rt.low_resource_mode && rt.allow_cpu_deep_query && rt.smart_routing) {
            return true;
        }

        let q = query.trim();
        if q.is_empty() {
            return false;
        }

        let chars = q.chars().count();
        let words = count_words_max_fields_or_cjk(q);
        let abstract_cues = count_abstract_cues(q);

        if chars < rt.cpu_deep_min_chars {
            return false;
        }
        if rt.cpu_deep_max_chars > 0 && chars > rt.cpu_deep_max_chars {
            return false;
        }
        if rt.cpu_deep_max_words > 0 && words > rt.cpu_deep_max_words {
            return false;
        }
        if rt.cpu_deep_max_abstract_cues > 0 && abstract_cues > rt.cpu_deep_max_abstract_cues {
            return false;
        }
        // Abstract long-form prompts are the OOM-prone shape on small hosts.
        if words >= 20 && abstract_cues > 0 {
            return false;
        }

        if words >= rt.cpu_deep_min_words {
            return true;
        }

        if has_question_cue(q) {
            return words >= 4 || count_cjk(q) >= 6;
        }

        false
    }

    // ------------------------------------------------------------------
    // Execution paths
    // ------------------------------------------------------------------

    async fn search_single_collection(
        &self,
        params: SearchParams,
        mode: ExecMode,
        key: String,
        start: Instant,
    ) -> Result<SearchOutcome> {
        self.check_collection_gate(&params)?;

        let results = self
            .exec_search(mode, &params.query, &params.collection, &params)
            .await?;
        let results = self.filter_exclude(results, &params.collection);
        let results = filter_min_score(results, params.min_score);
        let (results, capped) = self.finalize_results(results, &params);

        let reason = if capped { "FILES_ALL_CAPPED" } else { "" };
        Ok(self.cache_and_build(
            key,
            results,
            mode,
            vec![params.collection.clone()],
            false,
            capped,
            reason,
            start,
        ))
    }

    async fn search_single_with_deep_race(
        &self,
        params: SearchParams,
        key: String,
        start: Instant,
    ) -> Result<SearchOutcome> {
        self.check_collection_gate(&params)?;

        if let Some(reason) = self.deep_negative.should_skip(&params.query, &params.collection) {
            let (results, _) = self.broad_single(&params).await;
            return Ok(self.cache_and_build(
                key,
                results,
                ExecMode::Search,
                vec![params.collection.clone()],
                false,
                true,
                reason.as_str(),
                start,
            ));
        }

        let broad_fut = self.broad_single(&params);
        let deep_fut = self.deep_single(&params);
        let ((broad_hits, _), deep) = tokio::join!(broad_fut, deep_fut);

        let collections = vec![params.collection.clone()];
        match deep {
            Err(err) => {
                debug!(%err, collection = %params.collection, "deep path failed in race");
                self.deep_negative.mark_failure(&params.query, &params.collection);
                Ok(self.cache_and_build(
                    key,
                    broad_hits,
                    ExecMode::Search,
                    collections,
                    false,
                    true,
                    "deep_failed_fallback_broad",
                    start,
                ))
            }
            Ok((hits, _)) if hits.is_empty() => Ok(self.cache_and_build(
                key,
                broad_hits,
                ExecMode::Search,
                collections,
                false,
                true,
                "deep_empty_fallback_broad",
                start,
            )),
            Ok((hits, capped)) => {
                let reason = if capped { "FILES_ALL_CAPPED" } else { "" };
                Ok(self.cache_and_build(
                    key,
                    hits,
                    ExecMode::Query,
                    collections,
                    false,
                    capped,
                    reason,
                    start,
                ))
            }
        }
    }

    /// Broad branch of a single-collection race: errors are logged and
    /// recovered as an empty result.
    async fn broad_single(&self, params: &SearchParams) -> (Vec<Hit>, bool) {
        let results = match self
            .exec_search(ExecMode::Search, &params.query, &params.collection, params)
            .await
        {
            Ok(results) => results,
            Err(err) => {
                warn!(collection = %params.collection, %err, "broad fallback search failed before deep");
                Vec::new()
            }
        };
        let results = self.filter_exclude(results, &params.collection);
        let results = filter_min_score(results, params.min_score);
        self.finalize_results(results, params)
    }

    /// Deep branch of a single-collection race, bounded by its own deadline.
    async fn deep_single(&self, params: &SearchParams) -> Result<(Vec<Hit>, bool)> {
        let deadline = self.deep_fail_timeout();
        let results = timeout(
            deadline,
            self.exec_search(ExecMode::Query, &params.query, &params.collection, params),
        )
        .await
        .map_err(|_| Error::DeadlineExceeded(format!("deep query after {deadline:?}")))??;
        let results = self.filter_exclude(results, &params.collection);
        let results = filter_min_score(results, params.min_score);
        Ok(self.finalize_results(results, params))
    }

    async fn search_wildcard_with_deep_race(
        &self,
        params: SearchParams,
        key: String,
        start: Instant,
    ) -> Result<SearchOutcome> {
        if let Some(reason) = self.deep_negative.should_skip(&params.query, "all") {
            let (results, searched, fallback, _capped) = self.search_broad_all(&params).await;
            return Ok(self.cache_and_build(
                key,
                results,
                ExecMode::Search,
                searched,
                fallback,
                true,
                reason.as_str(),
                start,
            ));
        }

        let broad_fut = self.search_broad_all(&params);
        let deep_fut = async {
            let deadline = self.deep_fail_timeout();
            timeout(deadline, self.search_deep_tier1(&params))
                .await
                .map_err(|_| Error::DeadlineExceeded(format!("deep query after {deadline:?}")))?
        };
        let ((broad_hits, broad_searched, broad_fallback, _), deep) =
            tokio::join!(broad_fut, deep_fut);

        match deep {
            Err(err) => {
                debug!(%err, "deep path failed in race");
                self.deep_negative.mark_failure(&params.query, "all");
                Ok(self.cache_and_build(
                    key,
                    broad_hits,
                    ExecMode::Search,
                    broad_searched,
                    broad_fallback,
                    true,
                    "deep_failed_fallback_broad",
                    start,
                ))
            }
            Ok((deep_hits, deep_searched)) => {
                let deep_hits = filter_min_score(deep_hits, params.min_score);
                let (deep_hits, capped) = self.finalize_results(deep_hits, &params);
                if deep_hits.is_empty() {
                    return Ok(self.cache_and_build(
                        key,
                        broad_hits,
                        ExecMode::Search,
                        broad_searched,
                        broad_fallback,
                        true,
                        "deep_empty_fallback_broad",
                        start,
                    ));
                }
                let reason = if capped { "FILES_ALL_CAPPED" } else { "" };
                Ok(self.cache_and_build(
                    key,
                    deep_hits,
                    ExecMode::Query,
                    deep_searched,
                    false,
                    capped,
                    reason,
                    start,
                ))
            }
        }
    }

    async fn search_with_fallback(
        &self,
        params: SearchParams,
        mode: ExecMode,
        key: String,
        start: Instant,
    ) -> Result<SearchOutcome> {
        let (mut filtered, mut searched, fallback_triggered) =
            self.search_primary_with_tier_fallback(&params, mode).await;
        let mut mode = mode;
        let mut degraded = false;
        let mut degrade_reason = "";

        let escalate = !params.disable_deep_escalation
            && mode == ExecMode::Search
            && filtered.is_empty()
            && self.exec.has_capability(Capability::DeepQuery)
            && !self.is_overloaded()
            && self.allow_auto_deep_query(&params.query);
        if escalate {
            if let Some(reason) = self.deep_negative.should_skip(&params.query, "all") {
                degraded = true;
                degrade_reason = reason.as_str();
            } else {
                info!("lexical search returned no results, escalating to query mode");
                let deadline = self.deep_fail_timeout();
                let deep = timeout(deadline, self.search_deep_tier1(&params))
                    .await
                    .map_err(|_| Error::DeadlineExceeded(format!("deep query after {deadline:?}")))
                    .and_then(|r| r);
                match deep {
                    Err(_) => {
                        self.deep_negative.mark_failure(&params.query, "all");
                        degraded = true;
                        degrade_reason = "deep_failed_fallback_broad";
                    }
                    Ok((deep_hits, deep_searched)) => {
                        let deep_hits = filter_min_score(deep_hits, params.min_score);
                        if deep_hits.is_empty() {
                            degraded = true;
                            degrade_reason = "deep_empty_fallback_broad";
                        } else {
                            mode = ExecMode::Query;
                            filtered = deep_hits;
                            searched = deep_searched;
                        }
                    }
                }
            }
        }

        let (filtered, capped) = self.finalize_results(filtered, &params);
        if capped && !degraded {
            degraded = true;
            degrade_reason = "FILES_ALL_CAPPED";
        }

        Ok(self.cache_and_build(
            key,
            filtered,
            mode,
            searched,
            fallback_triggered,
            degraded,
            degrade_reason,
            start,
        ))
    }

    /// Tier-1 fan-out, then tier-2 when empty and fallback is allowed both
    /// by the request and globally.
    async fn search_primary_with_tier_fallback(
        &self,
        params: &SearchParams,
        mode: ExecMode,
    ) -> (Vec<Hit>, Vec<String>, bool) {
        let tier1 = self.registry.by_tier(1);
        let (results, mut searched, _) = self.search_tier_parallel(&tier1, mode, params).await;

        let mut filtered = filter_min_score(results, params.min_score);
        let mut fallback_triggered = false;

        if filtered.is_empty() && params.fallback && self.search_cfg.fallback_enabled {
            let tier2 = self.registry.by_tier(2);
            if !tier2.is_empty() {
                fallback_triggered = true;
                let (t2_results, t2_searched, _) =
                    self.search_tier_parallel(&tier2, mode, params).await;
                filtered = filter_min_score(t2_results, params.min_score);
                searched.extend(t2_searched);
            }
        }

        (filtered, searched, fallback_triggered)
    }

    /// Broad (lexical) wildcard branch used by the deep/broad race.
    async fn search_broad_all(
        &self,
        params: &SearchParams,
    ) -> (Vec<Hit>, Vec<String>, bool, bool) {
        let (filtered, searched, fallback) = self
            .search_primary_with_tier_fallback(params, ExecMode::Search)
            .await;
        let (finalized, capped) = self.finalize_results(filtered, params);
        (finalized, searched, fallback, capped)
    }

    /// Deep query across tier-1 collections. All collections failing is a
    /// deep failure; partial failures are tolerated.
    async fn search_deep_tier1(
        &self,
        params: &SearchParams,
    ) -> Result<(Vec<Hit>, Vec<String>)> {
        let tier1 = self.registry.by_tier(1);
        if tier1.is_empty() {
            return Err(Error::FailedPrecondition(
                "no tier-1 collection configured".to_string(),
            ));
        }
        let (results, searched, first_err) = self
            .search_tier_parallel(&tier1, ExecMode::Query, params)
            .await;
        if results.is_empty() {
            if let Some(err) = first_err {
                return Err(err);
            }
        }
        Ok((results, searched))
    }

    /// Run one mode across a set of collections concurrently. Per-collection
    /// errors are logged and tallied; the first error is reported alongside
    /// whatever results arrived.
    async fn search_tier_parallel(
        &self,
        cols: &[&crate::registry::CollectionSpec],
        mode: ExecMode,
        params: &SearchParams,
    ) -> (Vec<Hit>, Vec<String>, Option<Error>) {
        let futures = cols.iter().map(|col| {
            let name = col.name.clone();
            async move {
                let result = self.exec_search(mode, &params.query, &name, params).await;
                (name, result)
            }
        });

        let mut all_results = Vec::new();
        let mut searched = Vec::new();
        let mut first_err = None;

        for (name, result) in futures::future::join_all(futures).await {
            match result {
                Ok(results) => {
                    let results = self.filter_exclude(results, &name);
                    all_results.extend(results);
                    searched.push(name);
                }
                Err(err) => {
                    warn!(collection = %name, %err, mode = mode.as_str(), "collection search failed");
                    if first_err.is_none() {
                        first_err = Some(err);
                    }
                }
            }
        }

        (all_results, searched, first_err)
    }

    /// Dispatch one executor call, honoring the overload concurrency cap and
    /// the coarse-K contract.
    async fn exec_search(
        &self,
        mode: ExecMode,
        query: &str,
        collection: &str,
        params: &SearchParams,
    ) -> Result<Vec<Hit>> {
        let _token = self.acquire_overload_search_token().await?;

        let all = params.files_only && params.files_all;
        let coarse_k = if all {
            // Let the backend return every file hit; capped later by
            // files_all_max_hits.
            0
        } else if self.search_cfg.coarse_k == 0 {
            20
        } else {
            self.search_cfg.coarse_k
        };

        let opts = SearchOpts {
            collection: collection.to_string(),
            n: coarse_k,
            min_score: params.min_score,
            files_only: params.files_only,
            all,
        };

        match mode {
            ExecMode::VSearch => self.exec.vsearch(query, opts).await,
            ExecMode::Query => self.exec.query(query, opts).await,
            ExecMode::Search => self.exec.search(query, opts).await,
        }
    }

    /// Under overload, executor calls share a small semaphore. Waiting is
    /// cancelled by the request deadline; a dropped wait never leaks a
    /// permit.
    async fn acquire_overload_search_token(
        &self,
    ) -> Result<Option<tokio::sync::OwnedSemaphorePermit>> {
        if !self.is_overloaded() {
            return Ok(None);
        }
        let permit = Arc::clone(&self.search_tokens)
            .acquire_owned()
            .await
            .map_err(|e| Error::ResourceExhausted(format!("overload search queue closed: {e}")))?;
        Ok(Some(permit))
    }

    fn check_collection_gate(&self, params: &SearchParams) -> Result<()> {
        let col = self.registry.find(&params.collection).ok_or_else(|| {
            Error::NotFound(format!("collection {:?} not found", params.collection))
        })?;
        if col.require_explicit && col.safety_prompt && !params.confirm {
            return Err(Error::FailedPrecondition(format!(
                "collection {:?} requires confirm=true",
                params.collection
            )));
        }
        Ok(())
    }

    fn filter_exclude(&self, results: Vec<Hit>, collection: &str) -> Vec<Hit> {
        results
            .into_iter()
            .filter(|hit| !self.registry.is_excluded(collection, &hit.file))
            .collect()
    }

    /// Apply the finalization pipeline; the bool reports a files_all cap.
    fn finalize_results(&self, results: Vec<Hit>, params: &SearchParams) -> (Vec<Hit>, bool) {
        if params.files_only {
            let mut results = dedup_sort_limit(results, params.top_k, !params.files_all);
            if params.files_all {
                let limit = self.search_cfg.files_all_max_hits;
                if limit > 0 && results.len() > limit {
                    warn!(
                        total_hits = results.len(),
                        max_hits = limit,
                        "files_all result capped by files_all_max_hits"
                    );
                    results.truncate(limit);
                    return (results, true);
                }
            }
            return (results, false);
        }

        let results = dedup_sort_limit(results, 0, false);
        let results = clean_snippets(results);
        let results = dedup_sort_limit(results, params.top_k, true);
        (enforce_max_chars(results, self.search_cfg.max_chars), false)
    }

    fn deep_fail_timeout(&self) -> Duration {
        if !self.runtime.deep_fail_timeout.is_zero() {
            return self.runtime.deep_fail_timeout;
        }
        if !self.runtime.query_timeout.is_zero() {
            return self.runtime.query_timeout;
        }
        Duration::from_secs(12)
    }

    #[allow(clippy::too_many_arguments)]
    fn cache_and_build(
        &self,
        key: String,
        results: Vec<Hit>,
        mode: ExecMode,
        searched: Vec<String>,
        fallback_triggered: bool,
        degraded: bool,
        degrade_reason: &str,
        start: Instant,
    ) -> SearchOutcome {
        self.cache.put(
            key,
            CacheEntry {
                results: results.clone(),
                mode: mode.as_str().to_string(),
                collections: searched.clone(),
                fallback_triggered,
                degraded,
                degrade_reason: degrade_reason.to_string(),
                index_version: String::new(),
                created_at: Instant::now(),
            },
        );

        let latency_ms = start.elapsed().as_millis() as i64;
        self.observe_search_sample(latency_ms, results.len(), degraded);

        SearchOutcome {
            meta: SearchMeta {
                mode_used: mode.as_str().to_string(),
                collections_searched: searched,
                fallback_triggered,
                degraded,
                degrade_reason: degrade_reason.to_string(),
                latency_ms,
                ..SearchMeta::default()
            },
            results,
        }
    }

    fn observe_search_sample(&self, latency_ms: i64, hits: usize, degraded: bool) {
        let total = self.obs.count.fetch_add(1, Ordering::Relaxed) + 1;
        self.obs
            .latency_ms_sum
            .fetch_add(latency_ms.max(0) as u64, Ordering::Relaxed);
        self.obs.hits_sum.fetch_add(hits as u64, Ordering::Relaxed);
        match hits {
            0 => self.obs.hit_zero.fetch_add(1, Ordering::Relaxed),
            1..=3 => self.obs.hit_low.fetch_add(1, Ordering::Relaxed),
            4..=8 => self.obs.hit_mid.fetch_add(1, Ordering::Relaxed),
            _ => self.obs.hit_high.fetch_add(1, Ordering::Relaxed),
        };
        if degraded {
            self.obs.degraded.fetch_add(1, Ordering::Relaxed);
        }

        let mut should_log = total % OBSERVATION_LOG_EVERY == 0;
        {
            let mut last = self.obs.last_log_at.lock().unwrap();
            let now = Instant::now();
            if !should_log {
                if let Some(at) = *last {
                    if now.duration_since(at) >= OBSERVATION_LOG_INTERVAL {
                        should_log = true;
                    }
                } else {
                    *last = Some(now);
                }
            }
            if should_log {
                *last = Some(now);
            }
        }
        if !should_log {
            return;
        }

        let latency_sum = self.obs.latency_ms_sum.load(Ordering::Relaxed);
        let hits_sum = self.obs.hits_sum.load(Ordering::Relaxed);
        let (neg_marks, neg_exact_hits, neg_scope_hits) = self.deep_negative.counters();
        info!(
            samples = total,
            avg_latency_ms = format!("{:.2}", latency_sum as f64 / total as f64),
            avg_hits = format!("{:.2}", hits_sum as f64 / total as f64),
            hit_zero = self.obs.hit_zero.load(Ordering::Relaxed),
            hit_1_3 = self.obs.hit_low.load(Ordering::Relaxed),
            hit_4_8 = self.obs.hit_mid.load(Ordering::Relaxed),
            hit_9_plus = self.obs.hit_high.load(Ordering::Relaxed),
            degraded_count = self.obs.degraded.load(Ordering::Relaxed),
            deep_negative_mark_count = neg_marks,
            deep_negative_exact_hit_count = neg_exact_hits,
            deep_negative_scope_hit_count = neg_scope_hits,
            "search_observation"
        );
    }
}

fn has_question_cue(s: &str) -> bool {
    let lower = s.to_lowercase();
    const CUES: &[&str] = &[
        "如何", "怎么", "怎样", "什么", "为什么", "为何", "是否", "能不能", "可以", "应该",
        "?", "？", "how ", "what ", "why ", "when ", "where ", "which ", "should ",
    ];
    CUES.iter().any(|cue| lower.contains(cue))
}

fn count_abstract_cues(s: &str) -> usize {
    let lower = s.to_lowercase();
    const CUES: &[&str] = &[
        "方案", "架构", "规划", "体系", "框架", "设计", "tradeoff", "strategy",
        "architecture", "design", "plan", "migration", "roadmap",
    ];
    CUES.iter().filter(|cue| lower.contains(*cue)).count()
}
