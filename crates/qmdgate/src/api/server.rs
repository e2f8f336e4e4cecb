//! Router assembly, shared state, and the wire error contract.

use std::sync::Arc;

use axum::extract::Request;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use qmdgate_core::{Error, Executor};
use qmdgate_route::Orchestrator;
use qmdgate_sched::heartbeat::SystemHealthTracker;
use qmdgate_sched::{Guardian, Scheduler};

use crate::api::{admin, search};
use crate::config::Config;

/// Shared state handed to every route handler.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub orch: Arc<Orchestrator>,
    pub exec: Arc<dyn Executor>,
    pub sched: Arc<Scheduler>,
    pub guardian: Arc<Guardian>,
    pub health: Arc<SystemHealthTracker>,
}

/// Build the full route table.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/search", post(search::handle_search))
        .route("/api/search_and_get", post(search::handle_search_and_get))
        .route("/api/get", post(search::handle_get))
        .route("/api/multi-get", post(search::handle_multi_get))
        .route("/api/quick/core", get(search::handle_quick_core))
        .route("/api/quick/broad", get(search::handle_quick_broad))
        .route("/api/quick/deep", get(search::handle_quick_deep))
        .route("/api/status", get(admin::handle_status))
        .route("/api/admin/reindex", post(admin::handle_reindex))
        .route("/api/admin/embed", post(admin::handle_embed))
        .route("/api/admin/cache/clear", post(admin::handle_cache_clear))
        .route("/api/admin/collections", get(admin::handle_collections))
        .route("/api/admin/mcp/restart", post(admin::handle_mcp_restart))
        .route("/health", get(admin::handle_health))
        .layer(middleware::from_fn(log_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn log_requests(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = std::time::Instant::now();
    let resp = next.run(req).await;
    info!(
        %method,
        path,
        status = resp.status().as_u16(),
        latency_ms = start.elapsed().as_millis() as u64,
        "http request"
    );
    resp
}

// ============ Errors ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
    trace_id: String,
}

/// A wire-coded error response.
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub trace_id: String,
}

impl ApiError {
    pub fn new(err: &Error, trace_id: &str) -> Self {
        let code = err.code();
        let status = match code {
            "INVALID_ARGUMENT" => StatusCode::BAD_REQUEST,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "FAILED_PRECONDITION" => StatusCode::PRECONDITION_FAILED,
            "RESOURCE_EXHAUSTED" => StatusCode::TOO_MANY_REQUESTS,
            "UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            "DEADLINE_EXCEEDED" => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            code,
            message: err.to_string(),
            trace_id: trace_id.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
                trace_id: self.trace_id,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============ Trace ids ============

/// 6-byte random hex id.
pub fn gen_trace_id() -> String {
    let bytes: [u8; 6] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Incoming `x-trace-id`, or a fresh one when absent or blank.
pub fn trace_id_from_headers(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(gen_trace_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gen_trace_id_is_twelve_hex_chars() {
        let id = gen_trace_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_trace_id_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", "abc123".parse().unwrap());
        assert_eq!(trace_id_from_headers(&headers), "abc123");

        headers.insert("x-trace-id", "   ".parse().unwrap());
        assert_eq!(trace_id_from_headers(&headers).len(), 12);

        let empty = HeaderMap::new();
        assert_eq!(trace_id_from_headers(&empty).len(), 12);
    }

    #[test]
    fn test_api_error_status_mapping() {
        let cases = [
            (Error::InvalidArgument("x".into()), StatusCode::BAD_REQUEST),
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                Error::FailedPrecondition("x".into()),
                StatusCode::PRECONDITION_FAILED,
            ),
            (
                Error::ResourceExhausted("x".into()),
                StatusCode::TOO_MANY_REQUESTS,
            ),
            (Error::Unavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (
                Error::DeadlineExceeded("x".into()),
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (Error::Backend("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, want) in cases {
            assert_eq!(ApiError::new(&err, "t").status, want, "{err}");
        }
    }
}
