//! Search, search-and-get, document fetch, and quick endpoints.
//!
//! `execute_search_core` is the transport-neutral request pipeline: mode
//! normalization, overload pre-checks, the per-collection orchestrator
//! loop, cross-collection merge, served-mode derivation, and formatted-text
//! rendering. The axum handlers are thin wrappers over it.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use qmdgate_core::{Document, Error, GetOpts, Hit, Result, SearchMeta, ServedMode};
use qmdgate_route::finalize::dedup_sort_limit;
use qmdgate_route::SearchParams;

use crate::api::convert::{
    build_route_log, default_allow_fallback, derive_served_mode, normalize_collections,
    normalize_requested_mode, requested_mode_to_exec_tag,
};
use crate::api::format::{render_formatted_text, render_search_and_get_text};
use crate::api::server::{gen_trace_id, trace_id_from_headers, ApiError, AppState};

const DEFAULT_MAX_GET_DOCS: usize = 3;
const DEFAULT_MAX_GET_BYTES: usize = 12000;

// ============ Wire shapes ============

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    #[serde(default)]
    pub query: String,
    /// `auto`, `core`, `broad`, or `deep` (backend primitive names accepted)
    #[serde(default)]
    pub mode: String,
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub allow_fallback: Option<bool>,
    #[serde(default)]
    pub timeout_ms: u64,
    #[serde(default)]
    pub top_k: usize,
    #[serde(default)]
    pub min_score: f64,
    #[serde(default)]
    pub explain: bool,
    #[serde(default)]
    pub files_only: bool,
    #[serde(default)]
    pub files_all: bool,
    #[serde(default)]
    pub confirm: bool,
    #[serde(default)]
    pub trace_id: String,
}

#[derive(Debug, Serialize)]
pub struct SearchResponseBody {
    pub hits: Vec<Hit>,
    pub meta: SearchMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_log: Option<Vec<String>>,
    pub formatted_text: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchAndGetRequest {
    #[serde(flatten)]
    pub search: SearchRequest,
    #[serde(default)]
    pub max_get_docs: usize,
    #[serde(default)]
    pub max_get_bytes: usize,
}

#[derive(Debug, Serialize)]
pub struct SearchAndGetResponseBody {
    pub file_hits: Vec<Hit>,
    pub documents: Vec<Document>,
    pub meta: SearchMeta,
    pub formatted_text: String,
}

#[derive(Debug, Deserialize)]
pub struct GetRequest {
    #[serde(default)]
    pub r#ref: String,
    #[serde(default)]
    pub full: bool,
    #[serde(default)]
    pub line_numbers: bool,
}

#[derive(Debug, Deserialize)]
pub struct MultiGetRequest {
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub max_bytes: usize,
}

#[derive(Debug, Deserialize)]
pub struct QuickQuery {
    #[serde(default)]
    pub q: String,
}

// ============ Core pipeline ============

/// Run one search request end to end: pre-checks, per-collection loop,
/// merge, served-mode derivation, rendering. Transport handlers and the
/// search-and-get pipeline both call this.
pub async fn execute_search_core(
    state: &AppState,
    req: SearchRequest,
) -> Result<SearchResponseBody> {
    let query = req.query.trim().to_string();
    if query.is_empty() {
        return Err(Error::InvalidArgument("query is required".to_string()));
    }

    let requested_mode = normalize_requested_mode(&req.mode);
    let trace_id = if req.trace_id.trim().is_empty() {
        gen_trace_id()
    } else {
        req.trace_id.trim().to_string()
    };
    let allow_fallback = default_allow_fallback(
        requested_mode,
        req.allow_fallback,
        state.cfg.search.fallback_enabled,
    );

    let run = run_search_core(state, &req, query, requested_mode, allow_fallback, trace_id);
    if req.timeout_ms > 0 {
        tokio::time::timeout(Duration::from_millis(req.timeout_ms), run)
            .await
            .map_err(|_| Error::DeadlineExceeded(format!("search after {}ms", req.timeout_ms)))?
    } else {
        run.await
    }
}

async fn run_search_core(
    state: &AppState,
    req: &SearchRequest,
    query: String,
    requested_mode: &'static str,
    allow_fallback: bool,
    trace_id: String,
) -> Result<SearchResponseBody> {
    let start = Instant::now();

    let top_k = if req.top_k > 0 {
        req.top_k
    } else if req.files_only && req.files_all {
        0
    } else {
        state.cfg.search.top_k
    };
    let min_score = if req.min_score > 0.0 {
        req.min_score
    } else {
        state.cfg.search.min_score
    };

    let mut collections = normalize_collections(&req.collections);
    if collections.is_empty() {
        collections.push(String::new());
    }

    let mut exec_mode_tag = requested_mode_to_exec_tag(requested_mode);
    let mut disable_deep_escalation = matches!(requested_mode, "core" | "broad");
    let mut pre_degraded = false;
    let mut pre_degrade_reason = "";

    if state.orch.is_overloaded() {
        exec_mode_tag = "search";
        disable_deep_escalation = true;
        pre_degraded = true;
        pre_degrade_reason = "CPU_OVERLOAD_PROTECT";
    }

    if state.orch.is_critical_overloaded() {
        let all_cached = collections.iter().all(|collection| {
            state.orch.has_cached_result(&SearchParams {
                query: query.clone(),
                mode: exec_mode_tag.to_string(),
                collection: collection.clone(),
                top_k,
                min_score,
                fallback: allow_fallback,
                files_only: req.files_only,
                files_all: req.files_all,
                ..SearchParams::default()
            })
        });
        if !all_cached {
            error!(
                trace_id,
                requested_mode,
                query_len = query.chars().count(),
                "cpu critical overload shed request"
            );
            return Err(Error::ResourceExhausted(
                "cpu critical overload shed".to_string(),
            ));
        }
    }

    // Explicit deep requests are still budget-gated in low-resource mode
    // when fallback is allowed.
    if requested_mode == "deep" && allow_fallback && !state.orch.allow_deep_query(&query) {
        exec_mode_tag = "search";
        disable_deep_escalation = true;
        pre_degraded = true;
        pre_degrade_reason = "DEEP_GATE_REJECTED";
    }

    let mut combined: Vec<Hit> = Vec::new();
    let mut searched_set: BTreeSet<String> = BTreeSet::new();
    let mut mode_used = String::new();
    let mut fallback_triggered = false;
    let mut cache_hit = false;
    let mut degraded = false;
    let mut degrade_reason = String::new();
    let mut first_err: Option<Error> = None;
    let mut success_count = 0usize;

    for collection in &collections {
        let outcome = state
            .orch
            .search(SearchParams {
                query: query.clone(),
                mode: exec_mode_tag.to_string(),
                collection: collection.clone(),
                top_k,
                min_score,
                fallback: allow_fallback,
                files_only: req.files_only,
                files_all: req.files_all,
                disable_deep_escalation,
                confirm: req.confirm,
            })
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(err) => {
                if first_err.is_none() {
                    first_err = Some(err);
                }
                continue;
            }
        };

        success_count += 1;
        combined.extend(outcome.results);

        if outcome.meta.mode_used == "query" || mode_used.is_empty() {
            mode_used = outcome.meta.mode_used.clone();
        }
        fallback_triggered |= outcome.meta.fallback_triggered;
        cache_hit |= outcome.meta.cache_hit;
        degraded |= outcome.meta.degraded;
        if degrade_reason.is_empty() && !outcome.meta.degrade_reason.is_empty() {
            degrade_reason = outcome.meta.degrade_reason.clone();
        }

        if outcome.meta.collections_searched.is_empty() {
            if !collection.is_empty() {
                searched_set.insert(collection.clone());
            }
        } else {
            for c in outcome.meta.collections_searched {
                if !c.is_empty() {
                    searched_set.insert(c);
                }
            }
        }
    }

    if success_count == 0 {
        return Err(first_err.unwrap_or_else(|| Error::Backend("search failed".to_string())));
    }
    if mode_used.is_empty() {
        mode_used = "search".to_string();
    }

    let mut combined = dedup_sort_limit(combined, top_k, !(req.files_only && req.files_all));
    let mut files_all_capped = false;
    if req.files_only && req.files_all {
        let limit = state.cfg.search.files_all_max_hits;
        if limit > 0 && combined.len() > limit {
            combined.truncate(limit);
            files_all_capped = true;
        }
    }

    let served_mode = derive_served_mode(requested_mode, &mode_used, fallback_triggered, degraded);
    if requested_mode == "deep" && served_mode != ServedMode::Deep {
        degraded = true;
        if degrade_reason.is_empty() {
            degrade_reason = "DEEP_GATE_REJECTED".to_string();
        }
    }
    if pre_degraded {
        degraded = true;
        if degrade_reason.is_empty() {
            degrade_reason = pre_degrade_reason.to_string();
        }
    }
    if files_all_capped {
        degraded = true;
        if degrade_reason.is_empty() {
            degrade_reason = "FILES_ALL_CAPPED".to_string();
        }
    }

    let meta = SearchMeta {
        mode_used,
        served_mode: Some(served_mode),
        collections_searched: searched_set.into_iter().collect(),
        fallback_triggered,
        cache_hit,
        degraded,
        degrade_reason,
        trace_id: trace_id.clone(),
        latency_ms: start.elapsed().as_millis() as i64,
    };

    info!(
        trace_id,
        requested_mode,
        served_mode = meta.served_mode.map(|m| m.as_str()).unwrap_or(""),
        degraded = meta.degraded,
        degrade_reason = meta.degrade_reason,
        hits = combined.len(),
        latency_ms = meta.latency_ms,
        "search served"
    );

    let formatted_text = render_formatted_text(&combined, &meta, req.files_only);
    let route_log = req.explain.then(|| {
        build_route_log(
            requested_mode,
            allow_fallback,
            exec_mode_tag,
            &meta,
            collections.len(),
            combined.len(),
        )
    });

    Ok(SearchResponseBody {
        hits: combined,
        meta,
        route_log,
        formatted_text,
    })
}

/// Files-only search followed by bounded parallel document fetches.
pub async fn execute_search_and_get_core(
    state: &AppState,
    req: SearchAndGetRequest,
) -> Result<SearchAndGetResponseBody> {
    let max_get_docs = if req.max_get_docs > 0 {
        req.max_get_docs
    } else {
        DEFAULT_MAX_GET_DOCS
    };
    let max_get_bytes = if req.max_get_bytes > 0 {
        req.max_get_bytes
    } else {
        DEFAULT_MAX_GET_BYTES
    };

    let mut search_req = req.search;
    search_req.files_only = true;
    search_req.explain = false;
    let search_res = execute_search_core(state, search_req).await?;

    let file_hits = search_res.hits;
    let mut meta = search_res.meta;

    if file_hits.is_empty() {
        let formatted_text = render_search_and_get_text(&file_hits, &[], &[], &meta);
        return Ok(SearchAndGetResponseBody {
            file_hits,
            documents: Vec::new(),
            meta,
            formatted_text,
        });
    }

    let targets: Vec<String> = file_hits
        .iter()
        .take(max_get_docs)
        .map(|h| h.preferred_uri().trim().to_string())
        .filter(|uri| !uri.is_empty())
        .collect();

    let fetches = targets.iter().map(|uri| {
        let exec = &state.exec;
        async move {
            let content = exec.get(uri, GetOpts { full: true, line_numbers: false }).await;
            (uri.clone(), content)
        }
    });
    let outcomes = futures::future::join_all(fetches).await;

    let mut documents: Vec<Document> = Vec::with_capacity(targets.len());
    let mut truncated: Vec<String> = Vec::new();
    let mut remaining_bytes = max_get_bytes as i64;

    for (uri, content) in outcomes {
        let content = match content {
            Ok(content) => content,
            Err(err) => {
                warn!(uri, %err, trace_id = meta.trace_id, "search_and_get fetch failed");
                continue;
            }
        };

        let content_bytes = content.len() as i64;
        if content_bytes > remaining_bytes {
            truncated.push(uri);
            continue;
        }

        remaining_bytes -= content_bytes;
        documents.push(Document { file: uri, content });
    }

    if !truncated.is_empty() {
        meta.degraded = true;
        if meta.degrade_reason.is_empty() {
            meta.degrade_reason = "MAX_GET_BYTES_TRUNCATED".to_string();
        }
    }

    let formatted_text = render_search_and_get_text(&file_hits, &documents, &truncated, &meta);
    Ok(SearchAndGetResponseBody {
        file_hits,
        documents,
        meta,
        formatted_text,
    })
}

// ============ Handlers ============

pub async fn handle_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut req): Json<SearchRequest>,
) -> std::result::Result<Json<SearchResponseBody>, ApiError> {
    if req.trace_id.trim().is_empty() {
        req.trace_id = trace_id_from_headers(&headers);
    }
    let trace_id = req.trace_id.clone();
    execute_search_core(&state, req)
        .await
        .map(Json)
        .map_err(|err| ApiError::new(&err, &trace_id))
}

pub async fn handle_search_and_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut req): Json<SearchAndGetRequest>,
) -> std::result::Result<Json<SearchAndGetResponseBody>, ApiError> {
    if req.search.trace_id.trim().is_empty() {
        req.search.trace_id = trace_id_from_headers(&headers);
    }
    let trace_id = req.search.trace_id.clone();
    execute_search_and_get_core(&state, req)
        .await
        .map(Json)
        .map_err(|err| ApiError::new(&err, &trace_id))
}

pub async fn handle_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GetRequest>,
) -> std::result::Result<Response, ApiError> {
    let trace_id = trace_id_from_headers(&headers);
    if req.r#ref.trim().is_empty() {
        return Err(ApiError::new(
            &Error::InvalidArgument("ref is required".to_string()),
            &trace_id,
        ));
    }

    let content = state
        .exec
        .get(
            &req.r#ref,
            GetOpts {
                full: req.full,
                line_numbers: req.line_numbers,
            },
        )
        .await
        .map_err(|err| ApiError::new(&err, &trace_id))?;

    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        content,
    )
        .into_response())
}

pub async fn handle_multi_get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<MultiGetRequest>,
) -> std::result::Result<Json<Vec<Document>>, ApiError> {
    let trace_id = trace_id_from_headers(&headers);
    if req.pattern.trim().is_empty() {
        return Err(ApiError::new(
            &Error::InvalidArgument("pattern is required".to_string()),
            &trace_id,
        ));
    }

    state
        .exec
        .multi_get(&req.pattern, req.max_bytes)
        .await
        .map(Json)
        .map_err(|err| ApiError::new(&err, &trace_id))
}

async fn quick(
    state: AppState,
    headers: HeaderMap,
    q: String,
    mode: &str,
    allow_fallback: bool,
) -> std::result::Result<Response, ApiError> {
    let trace_id = trace_id_from_headers(&headers);
    if q.trim().is_empty() {
        return Err(ApiError::new(
            &Error::InvalidArgument("q parameter is required".to_string()),
            &trace_id,
        ));
    }

    let req = SearchRequest {
        query: q,
        mode: mode.to_string(),
        allow_fallback: Some(allow_fallback),
        trace_id,
        ..SearchRequest::default()
    };
    let trace_id = req.trace_id.clone();
    let body = execute_search_core(&state, req)
        .await
        .map_err(|err| ApiError::new(&err, &trace_id))?;

    Ok((
        [(header::CONTENT_TYPE, "text/markdown; charset=utf-8")],
        body.formatted_text,
    )
        .into_response())
}

pub async fn handle_quick_core(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<QuickQuery>,
) -> std::result::Result<Response, ApiError> {
    quick(state, headers, query.q, "auto", false).await
}

pub async fn handle_quick_broad(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<QuickQuery>,
) -> std::result::Result<Response, ApiError> {
    quick(state, headers, query.q, "auto", true).await
}

pub async fn handle_quick_deep(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<QuickQuery>,
) -> std::result::Result<Response, ApiError> {
    quick(state, headers, query.q, "deep", true).await
}
