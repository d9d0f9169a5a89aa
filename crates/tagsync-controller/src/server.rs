//! HTTP observability endpoints.
//!
//! - `GET /api/health` returns `{"ok":true}`.
//! - `GET /api/v1/mirrors?action=show|summarize&limit=N` previews or
//!   summarizes the mirror task store (defaults: `summarize`, `1`).
//! - `GET /metrics` renders Prometheus text when a recorder handle is
//!   configured.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};

use crate::mirror::{MirrorStore, MirrorTask};

const ACTION_SHOW: &str = "show";
const ACTION_SUMMARIZE: &str = "summarize";

#[derive(Clone)]
struct AppState {
    store: MirrorStore,
    prometheus: Option<PrometheusHandle>,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always true while the process serves requests.
    pub ok: bool,
}

/// Response of the `show` action.
#[derive(Debug, Serialize, Deserialize)]
pub struct MirrorsResponse {
    /// The oldest pending tasks, up to `limit`.
    pub mirrors: Vec<MirrorTask>,
    /// Total number of pending tasks.
    pub total: usize,
}

#[derive(Debug, Default, Deserialize)]
struct MirrorsQuery {
    action: Option<String>,
    limit: Option<String>,
}

/// Failures are reported as plain text with status 500.
struct ApiError(String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (StatusCode::INTERNAL_SERVER_ERROR, self.0).into_response()
    }
}

/// Builds the observability router.
pub fn router(store: MirrorStore, prometheus: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/v1/mirrors", get(mirrors))
        .route("/metrics", get(serve_metrics))
        .with_state(AppState { store, prometheus })
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { ok: true })
}

async fn mirrors(
    State(state): State<AppState>,
    Query(query): Query<MirrorsQuery>,
) -> Result<Response, ApiError> {
    let action = query.action.as_deref().unwrap_or(ACTION_SUMMARIZE);
    let limit = match query.limit.as_deref() {
        None | Some("") => 1,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|e| ApiError(format!("invalid limit {raw}: {e}")))?,
    };

    match action {
        ACTION_SHOW => {
            let (mirrors, total) = state
                .store
                .show(limit)
                .map_err(|e| ApiError(e.to_string()))?;
            Ok(Json(MirrorsResponse { mirrors, total }).into_response())
        }
        ACTION_SUMMARIZE => {
            let summary = state
                .store
                .summarize()
                .map_err(|e| ApiError(e.to_string()))?;
            Ok(Json(summary).into_response())
        }
        other => {
            tracing::debug!(action = other, "rejected mirrors request");
            Err(ApiError(format!("invalid action: {other}")))
        }
    }
}

async fn serve_metrics(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; charset=utf-8")],
            handle.render(),
        )
            .into_response(),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [("content-type", "text/plain; charset=utf-8")],
            "Metrics not initialized".to_string(),
        )
            .into_response(),
    }
}
