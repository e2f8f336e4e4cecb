//! Admin, status, and health endpoints.

use std::time::Instant;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use qmdgate_core::{Capability, CollectionInfo, Error, HealthLevel};

use crate::api::server::{trace_id_from_headers, ApiError, AppState};

// ============ Wire shapes ============

#[derive(Debug, Serialize)]
pub struct OpResponse {
    pub ok: bool,
    pub message: String,
    pub trace_id: String,
    pub latency_ms: i64,
}

#[derive(Debug, Serialize)]
pub struct CollectionsResponse {
    pub collections: Vec<CollectionInfo>,
    pub trace_id: String,
    pub latency_ms: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct EmbedRequest {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub name: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub mode: String,
    pub components: Vec<ComponentStatus>,
    pub uptime_sec: i64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub commit: String,
    pub low_resource_mode: bool,
    pub allow_cpu_deep_query: bool,
    pub deep_query_enabled: bool,
    pub vector_enabled: bool,
    pub query_max_concurrency: usize,
    pub query_timeout_ms: u64,
    pub deep_fail_timeout_ms: u64,
    pub deep_negative_ttl_sec: u64,
    pub cpu_overloaded: bool,
    pub cpu_critical_overloaded: bool,
    pub overload_max_concurrent_search: usize,
    pub trace_id: String,
}

// ============ Handlers ============

pub async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let health = state.health.health();

    let mut components: Vec<ComponentStatus> = {
        let mut names: Vec<&String> = health.components.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|name| {
                let comp = &health.components[name];
                ComponentStatus {
                    name: name.clone(),
                    status: comp.level.as_str().to_string(),
                    message: comp.message.clone(),
                }
            })
            .collect()
    };

    let mut status = health.overall.as_str().to_string();
    let mut mode = health.mode.clone();
    if mode.is_empty() {
        mode = "normal".to_string();
    }

    if state.orch.is_critical_overloaded() {
        mode = "cpu_critical_overloaded".to_string();
        status = "unhealthy".to_string();
        components.push(ComponentStatus {
            name: "cpu_guard".to_string(),
            status: HealthLevel::Critical.as_str().to_string(),
            message: "critical overload shedding new uncached requests".to_string(),
        });
    } else if state.orch.is_overloaded() {
        mode = "cpu_overloaded".to_string();
        if status.eq_ignore_ascii_case("healthy") {
            status = "degraded".to_string();
        }
        components.push(ComponentStatus {
            name: "cpu_guard".to_string(),
            status: HealthLevel::Degraded.as_str().to_string(),
            message: "overload protection active, forcing search mode and limiting concurrency"
                .to_string(),
        });
    }

    Json(HealthResponse {
        status,
        mode,
        components,
        uptime_sec: health.uptime_sec,
    })
}

pub async fn handle_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<StatusResponse> {
    let rt = &state.cfg.runtime;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        commit: option_env!("QMDGATE_COMMIT").unwrap_or("unknown").to_string(),
        low_resource_mode: rt.low_resource_mode,
        allow_cpu_deep_query: rt.allow_cpu_deep_query,
        deep_query_enabled: state.exec.has_capability(Capability::DeepQuery),
        vector_enabled: state.exec.has_capability(Capability::Vector),
        query_max_concurrency: rt.query_max_concurrency,
        query_timeout_ms: rt.query_timeout.as_millis() as u64,
        deep_fail_timeout_ms: rt.deep_fail_timeout.as_millis() as u64,
        deep_negative_ttl_sec: rt.deep_negative_ttl.as_secs(),
        cpu_overloaded: state.orch.is_overloaded(),
        cpu_critical_overloaded: state.orch.is_critical_overloaded(),
        overload_max_concurrent_search: rt.overload_max_concurrent_search,
        trace_id: trace_id_from_headers(&headers),
    })
}

pub async fn handle_reindex(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<OpResponse>, ApiError> {
    let trace_id = trace_id_from_headers(&headers);
    let start = Instant::now();

    match state.sched.trigger_reindex().await {
        Ok(()) => Ok(op_ok("reindex triggered", &trace_id, start, "Reindex")),
        Err(err) => Err(op_fail(err, &trace_id, start, "Reindex")),
    }
}

pub async fn handle_embed(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Option<Json<EmbedRequest>>,
) -> std::result::Result<Json<OpResponse>, ApiError> {
    let trace_id = trace_id_from_headers(&headers);
    let start = Instant::now();
    let force = req.map(|Json(r)| r.force).unwrap_or(false);

    if !state.cfg.embed_enabled() {
        return Ok(op_ok("embed disabled in low_resource_mode", &trace_id, start, "Embed"));
    }

    let message = if force { "full embed triggered" } else { "embed triggered" };
    match state.sched.trigger_embed(force).await {
        Ok(()) => Ok(op_ok(message, &trace_id, start, "Embed")),
        Err(err) => Err(op_fail(err, &trace_id, start, "Embed")),
    }
}

pub async fn handle_cache_clear(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Json<OpResponse> {
    let trace_id = trace_id_from_headers(&headers);
    let start = Instant::now();

    state.orch.clear_cache();
    op_ok("cache cleared", &trace_id, start, "CacheClear")
}

pub async fn handle_collections(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<CollectionsResponse>, ApiError> {
    let trace_id = trace_id_from_headers(&headers);
    let start = Instant::now();

    match state.exec.collection_list().await {
        Ok(collections) => {
            log_admin("Collections", &trace_id, start, true);
            Ok(Json(CollectionsResponse {
                collections,
                trace_id,
                latency_ms: start.elapsed().as_millis() as i64,
            }))
        }
        Err(err) => Err(op_fail(err, &trace_id, start, "Collections")),
    }
}

pub async fn handle_mcp_restart(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> std::result::Result<Json<OpResponse>, ApiError> {
    let trace_id = trace_id_from_headers(&headers);
    let start = Instant::now();

    if !state.exec.has_capability(Capability::Sidecar) {
        let err = Error::Unavailable("guardian not available".to_string());
        return Err(op_fail(err, &trace_id, start, "MCPRestart"));
    }

    match state.guardian.restart_sidecar().await {
        Ok(()) => Ok(op_ok("mcp restart triggered", &trace_id, start, "MCPRestart")),
        Err(err) => Err(op_fail(err, &trace_id, start, "MCPRestart")),
    }
}

// ============ Helpers ============

fn op_ok(message: &str, trace_id: &str, start: Instant, method: &str) -> Json<OpResponse> {
    log_admin(method, trace_id, start, true);
    Json(OpResponse {
        ok: true,
        message: message.to_string(),
        trace_id: trace_id.to_string(),
        latency_ms: start.elapsed().as_millis() as i64,
    })
}

fn op_fail(err: Error, trace_id: &str, start: Instant, method: &str) -> ApiError {
    error!(
        method,
        trace_id,
        latency_ms = start.elapsed().as_millis() as u64,
        %err,
        "admin rpc failed"
    );
    ApiError::new(&err, trace_id)
}

fn log_admin(method: &str, trace_id: &str, start: Instant, ok: bool) {
    info!(
        method,
        trace_id,
        latency_ms = start.elapsed().as_millis() as u64,
        ok,
        "admin rpc served"
    );
}
