//! End-to-end tests for the search pipeline: request normalization through
//! routing, fan-out, racing, finalization, and response metadata, over a
//! mock backend executor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use qmdgate::api::search::{
    execute_search_and_get_core, execute_search_core, SearchAndGetRequest, SearchRequest,
};
use qmdgate::api::AppState;
use qmdgate::config;
use qmdgate_cache::ResultCache;
use qmdgate_core::{
    Capabilities, Capability, CollectionInfo, Document, Error, Executor, GetOpts, Hit, IndexStatus,
    PathContext, Result, SearchOpts, ServedMode,
};
use qmdgate_guard::CpuGuard;
use qmdgate_route::{CollectionRegistry, Orchestrator, OrchestratorDeps};
use qmdgate_sched::guardian::GuardianConfig;
use qmdgate_sched::heartbeat::SystemHealthTracker;
use qmdgate_sched::{Guardian, Scheduler, SchedulerIntervals};

// ==================== Mock backend ====================

#[derive(Default)]
struct MockBackend {
    caps: Capabilities,
    search_hits: HashMap<String, Vec<Hit>>,
    query_hits: HashMap<String, Vec<Hit>>,
    query_fails: bool,
    search_delay: Option<Duration>,
    documents: HashMap<String, String>,
    search_calls: AtomicUsize,
    query_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

#[async_trait]
impl Executor for MockBackend {
    async fn search(&self, _query: &str, opts: SearchOpts) -> Result<Vec<Hit>> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.search_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self.search_hits.get(&opts.collection).cloned().unwrap_or_default())
    }

    async fn vsearch(&self, _query: &str, _opts: SearchOpts) -> Result<Vec<Hit>> {
        Ok(Vec::new())
    }

    async fn query(&self, _query: &str, opts: SearchOpts) -> Result<Vec<Hit>> {
        self.query_calls.fetch_add(1, Ordering::SeqCst);
        if self.query_fails {
            return Err(Error::Backend("deep backend crashed".to_string()));
        }
        Ok(self.query_hits.get(&opts.collection).cloned().unwrap_or_default())
    }

    async fn get(&self, doc_ref: &str, _opts: GetOpts) -> Result<String> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        self.documents
            .get(doc_ref)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("document not found: {doc_ref}")))
    }

    async fn multi_get(&self, _pattern: &str, _max_bytes: usize) -> Result<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn collection_add(&self, _path: &str, _name: &str, _mask: &str) -> Result<()> {
        Ok(())
    }

    async fn collection_list(&self) -> Result<Vec<CollectionInfo>> {
        Ok(Vec::new())
    }

    async fn update(&self) -> Result<()> {
        Ok(())
    }

    async fn embed(&self, _force: bool) -> Result<()> {
        Ok(())
    }

    async fn context_add(&self, _path: &str, _desc: &str) -> Result<()> {
        Ok(())
    }

    async fn context_list(&self) -> Result<Vec<PathContext>> {
        Ok(Vec::new())
    }

    async fn context_remove(&self, _path: &str) -> Result<()> {
        Ok(())
    }

    async fn status(&self) -> Result<IndexStatus> {
        Ok(IndexStatus::default())
    }

    async fn sidecar_start(&self) -> Result<()> {
        Ok(())
    }

    async fn sidecar_stop(&self) -> Result<()> {
        Ok(())
    }

    async fn sidecar_health(&self) -> Result<()> {
        Ok(())
    }

    async fn version(&self) -> Result<String> {
        Ok("mock 1.0".to_string())
    }

    fn has_capability(&self, cap: Capability) -> bool {
        self.caps.has(cap)
    }
}

// ==================== Harness ====================

struct Harness {
    state: AppState,
    backend: Arc<MockBackend>,
    guard: Arc<CpuGuard>,
}

const BASE_CONFIG: &str = "\
qmd:
  bin: /bin/sh
collections:
  - name: notes
    path: /data/notes
    tier: 1
  - name: archive
    path: /data/archive
    tier: 2
  - name: personal
    path: /data/personal
    tier: 1
    require_explicit: true
    safety_prompt: true
search:
  files_all_max_hits: 2
";

fn harness_with_config(backend: MockBackend, yaml: &str) -> Harness {
    let cfg = Arc::new(config::parse(yaml).expect("config"));
    let backend = Arc::new(backend);
    let exec: Arc<dyn Executor> = Arc::clone(&backend) as Arc<dyn Executor>;

    let registry = Arc::new(CollectionRegistry::new(cfg.collections.clone()).unwrap());
    let cache = Arc::new(ResultCache::new(&cfg.cache_settings()));
    let guard = Arc::new(CpuGuard::new(cfg.cpu_guard_config()));

    let orch = Arc::new(Orchestrator::new(OrchestratorDeps {
        exec: Arc::clone(&exec),
        registry,
        cache: Arc::clone(&cache),
        guard: Arc::clone(&guard),
        search: cfg.search_settings(),
        runtime: cfg.runtime_settings(),
    }));

    let sched = Arc::new(Scheduler::new(
        Arc::clone(&exec),
        cache,
        SchedulerIntervals::default(),
        cfg.embed_enabled(),
        {
            let orch = Arc::clone(&orch);
            Arc::new(move || orch.cleanup_deep_negative())
        },
    ));
    let guardian = Arc::new(Guardian::new(GuardianConfig::default(), Arc::clone(&exec)));

    Harness {
        state: AppState {
            cfg,
            orch,
            exec,
            sched,
            guardian,
            health: Arc::new(SystemHealthTracker::new()),
        },
        backend,
        guard,
    }
}

fn harness(backend: MockBackend) -> Harness {
    harness_with_config(backend, BASE_CONFIG)
}

fn hit(docid: &str, file: &str, collection: &str, score: f64) -> Hit {
    Hit {
        docid: docid.to_string(),
        file: file.to_string(),
        collection: collection.to_string(),
        score,
        snippet: format!("snippet for {docid}"),
        title: docid.to_string(),
    }
}

fn request(query: &str, mode: &str) -> SearchRequest {
    SearchRequest {
        query: query.to_string(),
        mode: mode.to_string(),
        ..SearchRequest::default()
    }
}

// ==================== Scenarios ====================

#[tokio::test]
async fn test_empty_query_is_rejected() {
    let h = harness(MockBackend::default());
    let err = execute_search_core(&h.state, request("   ", "auto"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArgument(_)));
}

#[tokio::test]
async fn test_identical_request_hits_cache_with_equal_hits() {
    let mut backend = MockBackend::default();
    backend.search_hits.insert(
        "notes".to_string(),
        vec![hit("d1", "qmd://notes/design.md", "notes", 0.92)],
    );
    let h = harness(backend);

    let mut req = request("design doc", "auto");
    req.top_k = 5;
    req.min_score = 0.3;

    let first = execute_search_core(&h.state, req.clone()).await.unwrap();
    assert!(!first.meta.cache_hit);
    assert_eq!(first.hits.len(), 1);

    let second = execute_search_core(&h.state, req).await.unwrap();
    assert!(second.meta.cache_hit);
    assert_eq!(second.hits, first.hits);
    // Only the first request reached the backend.
    assert_eq!(h.backend.search_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_tier2_fallback_collects_both_tiers() {
    let mut backend = MockBackend::default();
    backend.search_hits.insert(
        "archive".to_string(),
        vec![
            hit("a1", "qmd://archive/1.md", "archive", 0.8),
            hit("a2", "qmd://archive/2.md", "archive", 0.7),
            hit("a3", "qmd://archive/3.md", "archive", 0.6),
        ],
    );
    let h = harness(backend);

    let mut req = request("old decisions", "core");
    req.allow_fallback = Some(true);
    let out = execute_search_core(&h.state, req).await.unwrap();

    assert_eq!(out.hits.len(), 3);
    assert!(out.meta.fallback_triggered);
    assert_eq!(out.meta.served_mode, Some(ServedMode::Broad));
    assert!(out.meta.collections_searched.contains(&"notes".to_string()));
    assert!(out.meta.collections_searched.contains(&"archive".to_string()));
}

#[tokio::test]
async fn test_deep_race_deep_wins() {
    let mut backend = MockBackend {
        caps: Capabilities {
            deep_query: true,
            ..Capabilities::default()
        },
        ..MockBackend::default()
    };
    backend.search_hits.insert(
        "notes".to_string(),
        (0..5)
            .map(|i| hit(&format!("b{i}"), &format!("qmd://notes/b{i}.md"), "notes", 0.5))
            .collect(),
    );
    backend.query_hits.insert(
        "notes".to_string(),
        vec![
            hit("deep1", "qmd://notes/deep1.md", "notes", 0.97),
            hit("deep2", "qmd://notes/deep2.md", "notes", 0.91),
        ],
    );
    let h = harness(backend);

    let out = execute_search_core(&h.state, request("explain the rollout", "deep"))
        .await
        .unwrap();

    assert_eq!(out.hits.len(), 2);
    assert_eq!(out.meta.mode_used, "query");
    assert_eq!(out.meta.served_mode, Some(ServedMode::Deep));
    assert!(!out.meta.degraded);
}

#[tokio::test]
async fn test_deep_failure_falls_back_then_negative_cache_short_circuits() {
    let mut backend = MockBackend {
        caps: Capabilities {
            deep_query: true,
            ..Capabilities::default()
        },
        query_fails: true,
        ..MockBackend::default()
    };
    backend.search_hits.insert(
        "notes".to_string(),
        vec![
            hit("b1", "qmd://notes/b1.md", "notes", 0.6),
            hit("b2", "qmd://notes/b2.md", "notes", 0.5),
            hit("b3", "qmd://notes/b3.md", "notes", 0.4),
            hit("b4", "qmd://notes/b4.md", "notes", 0.35),
        ],
    );
    let h = harness(backend);

    let out = execute_search_core(&h.state, request("how to fix the race", "deep"))
        .await
        .unwrap();
    assert_eq!(out.hits.len(), 4);
    assert!(out.meta.degraded);
    assert_eq!(out.meta.degrade_reason, "deep_failed_fallback_broad");
    assert_eq!(out.meta.served_mode, Some(ServedMode::Broad));

    // Identical follow-up: the result cache answers it, so clear first to
    // prove the deep-negative record alone deflects the deep path.
    h.state.orch.clear_cache();
    let deep_calls = h.backend.query_calls.load(Ordering::SeqCst);
    let again = execute_search_core(&h.state, request("how to fix the race", "deep"))
        .await
        .unwrap();
    assert_eq!(h.backend.query_calls.load(Ordering::SeqCst), deep_calls);
    assert!(again.meta.degraded);
    assert_eq!(again.meta.degrade_reason, "deep_negative_cached_fallback_broad");
    assert_eq!(again.hits, out.hits);
}

#[tokio::test]
async fn test_critical_overload_sheds_uncached_and_serves_cached() {
    let mut backend = MockBackend::default();
    backend.search_hits.insert(
        "notes".to_string(),
        vec![hit("d1", "qmd://notes/a.md", "notes", 0.9)],
    );
    let h = harness(backend);

    // Warm the cache while the guard is quiet.
    let warm = execute_search_core(&h.state, request("design doc", "core"))
        .await
        .unwrap();
    assert!(!warm.meta.cache_hit);

    // Latch both overload and critical.
    for _ in 0..20 {
        h.guard.step(99.0);
    }
    assert!(h.state.orch.is_critical_overloaded());

    // Uncached fingerprint: shed before any executor call.
    let calls_before = h.backend.search_calls.load(Ordering::SeqCst);
    let err = execute_search_core(&h.state, request("completely new query", "core"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted(_)));
    assert!(err.to_string().contains("cpu critical overload shed"));
    assert_eq!(h.backend.search_calls.load(Ordering::SeqCst), calls_before);

    // Cached fingerprint: served from cache.
    let cached = execute_search_core(&h.state, request("design doc", "core"))
        .await
        .unwrap();
    assert!(cached.meta.cache_hit);
    assert_eq!(cached.hits, warm.hits);
}

#[tokio::test]
async fn test_confirm_required_collection() {
    let mut backend = MockBackend::default();
    backend.search_hits.insert(
        "personal".to_string(),
        vec![hit("p1", "qmd://personal/diary.md", "personal", 0.9)],
    );
    let h = harness(backend);

    let mut req = request("my private notes", "core");
    req.collections = vec!["personal".to_string()];
    let err = execute_search_core(&h.state, req.clone()).await.unwrap_err();
    assert!(matches!(err, Error::FailedPrecondition(_)));

    req.confirm = true;
    let out = execute_search_core(&h.state, req).await.unwrap();
    assert_eq!(out.hits.len(), 1);
    assert_eq!(out.hits[0].docid, "p1");
}

#[tokio::test]
async fn test_files_all_cap_limits_and_degrades() {
    let mut backend = MockBackend::default();
    backend.search_hits.insert(
        "notes".to_string(),
        (0..5)
            .map(|i| hit(&format!("f{i}"), &format!("qmd://notes/f{i}.md"), "notes", 0.9 - i as f64 * 0.01))
            .collect(),
    );
    let h = harness(backend);

    let mut req = request("every file", "core");
    req.collections = vec!["notes".to_string()];
    req.files_only = true;
    req.files_all = true;
    let out = execute_search_core(&h.state, req).await.unwrap();

    assert_eq!(out.hits.len(), 2);
    assert!(out.meta.degraded);
    assert_eq!(out.meta.degrade_reason, "FILES_ALL_CAPPED");
}

#[tokio::test]
async fn test_deep_gate_rejects_explicit_deep_in_low_resource_mode() {
    let yaml = format!("{BASE_CONFIG}runtime:\n  low_resource_mode: true\n  allow_cpu_deep_query: true\n");
    let mut backend = MockBackend {
        caps: Capabilities {
            deep_query: true,
            ..Capabilities::default()
        },
        ..MockBackend::default()
    };
    backend.search_hits.insert(
        "notes".to_string(),
        vec![hit("b1", "qmd://notes/b1.md", "notes", 0.6)],
    );
    let h = harness_with_config(backend, &yaml);

    // Too short for the deep budget: downgraded with DEEP_GATE_REJECTED.
    let out = execute_search_core(&h.state, request("short one", "deep"))
        .await
        .unwrap();
    assert!(out.meta.degraded);
    assert_eq!(out.meta.degrade_reason, "DEEP_GATE_REJECTED");
    assert_eq!(out.meta.served_mode, Some(ServedMode::Broad));
    assert_eq!(h.backend.query_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_request_timeout_maps_to_deadline_exceeded() {
    let backend = MockBackend {
        search_delay: Some(Duration::from_millis(200)),
        ..MockBackend::default()
    };
    let h = harness(backend);

    let mut req = request("slow query", "core");
    req.timeout_ms = 20;
    let err = execute_search_core(&h.state, req).await.unwrap_err();
    assert!(matches!(err, Error::DeadlineExceeded(_)));
    assert!(err.to_string().starts_with("QMD_TIMEOUT"));
}

#[tokio::test]
async fn test_route_log_present_only_when_explain() {
    let mut backend = MockBackend::default();
    backend.search_hits.insert(
        "notes".to_string(),
        vec![hit("d1", "qmd://notes/a.md", "notes", 0.9)],
    );
    let h = harness(backend);

    let mut req = request("design doc", "core");
    req.explain = true;
    let out = execute_search_core(&h.state, req).await.unwrap();
    let log = out.route_log.expect("route log");
    assert!(log.iter().any(|l| l == "requested_mode=core"));
    assert!(log.iter().any(|l| l == "hits=1"));

    let out = execute_search_core(&h.state, request("design doc", "core"))
        .await
        .unwrap();
    assert!(out.route_log.is_none());
}

#[tokio::test]
async fn test_search_and_get_fetches_within_byte_budget() {
    let mut backend = MockBackend::default();
    backend.search_hits.insert(
        "notes".to_string(),
        vec![
            hit("f1", "qmd://notes/small.md", "notes", 0.9),
            hit("f2", "qmd://notes/large.md", "notes", 0.8),
            hit("f3", "qmd://notes/other.md", "notes", 0.7),
        ],
    );
    backend
        .documents
        .insert("qmd://notes/small.md".to_string(), "short body".to_string());
    backend
        .documents
        .insert("qmd://notes/large.md".to_string(), "x".repeat(50_000));
    backend
        .documents
        .insert("qmd://notes/other.md".to_string(), "another body".to_string());
    let h = harness(backend);

    let req = SearchAndGetRequest {
        search: request("bodies please", "core"),
        max_get_docs: 3,
        max_get_bytes: 1000,
    };
    let out = execute_search_and_get_core(&h.state, req).await.unwrap();

    assert_eq!(out.file_hits.len(), 3);
    // The oversized document is skipped, the other two fit.
    assert_eq!(out.documents.len(), 2);
    assert!(out.meta.degraded);
    assert_eq!(out.meta.degrade_reason, "MAX_GET_BYTES_TRUNCATED");
    assert!(out.formatted_text.contains("qmd://notes/large.md (TRUNCATED)"));
    assert_eq!(h.backend.get_calls.load(Ordering::SeqCst), 3);
}
