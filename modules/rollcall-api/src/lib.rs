//! Read-only dashboard over a live run, plus a stop command.

pub mod cli;

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use rollcall_scout::log_buffer::LogBuffer;
use rollcall_scout::recent::{RecentMembers, RECENT_CAPACITY};
use rollcall_scout::stats::StatsAggregator;
use rollcall_scout::stop::StopSignal;

const DEFAULT_UIDS_LIMIT: usize = 10;
const DEFAULT_LOGS_LIMIT: usize = 100;

pub struct AppState {
    pub stats: Arc<StatsAggregator>,
    pub recent: Arc<RecentMembers>,
    pub logs: LogBuffer,
    pub stop: StopSignal,
}

#[derive(Deserialize)]
pub struct UidsQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub limit: Option<usize>,
    pub level: Option<String>,
}

async fn api_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats.snapshot().as_ref().clone())
}

async fn api_uids(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UidsQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_UIDS_LIMIT).min(RECENT_CAPACITY);
    Json(state.recent.latest(limit))
}

async fn api_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<LogsQuery>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(DEFAULT_LOGS_LIMIT);
    Json(state.logs.recent(limit, params.level.as_deref()))
}

async fn api_stop(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Stop requested from dashboard");
    state.stop.trigger();
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "stopping": true })))
}

/// 200 while the run is live, 503 once it has reached a terminal status.
async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.stats.snapshot().status.is_terminal() {
        (StatusCode::SERVICE_UNAVAILABLE, "finished")
    } else {
        (StatusCode::OK, "ok")
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(|| async { "ok" }))
        .route("/health", get(health))
        .route("/api/stats", get(api_stats))
        .route("/api/uids", get(api_uids))
        .route("/api/logs", get(api_logs))
        .route("/api/stop", post(api_stop))
        .with_state(state)
        .layer(
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods(tower_http::cors::Any)
                .allow_headers(tower_http::cors::Any),
        )
        .layer(SetResponseHeaderLayer::overriding(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(|request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                }),
        )
}
