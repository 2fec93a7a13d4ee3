//! Router assembly: HTTP endpoints, WebSocket upgrades, static files, CORS, and HTTP tracing.

use std::sync::Arc;

use axum::{
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    services::{ServeDir, ServeFile},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::Level;

use crate::state::AppState;

pub mod http;
pub mod ws;

/// Build the application router with:
/// - WebSockets at `/ws/host/:code` and `/ws/player/:code/:player_id`
/// - REST-ish API under `/api/v1/...`
/// - Static SPA from `./static` with index fallback
/// - CORS (allow any origin/method/headers) - adjust for production if needed
/// - HTTP trace layer (per-request spans w/ method, path, status, latency)
pub fn build_router(state: Arc<AppState>) -> Router {
    // Static files with SPA fallback
    let static_service = ServeDir::new("./static")
        .append_index_html_on_directories(true)
        .not_found_service(ServeFile::new("./static/index.html"));

    Router::new()
        // WebSocket
        .route("/ws/host/:code", get(ws::host_ws_upgrade))
        .route("/ws/player/:code/:player_id", get(ws::player_ws_upgrade))
        // HTTP API: host
        .route("/api/v1/health", get(http::http_health))
        .route("/api/v1/rooms", post(http::http_create_room))
        .route("/api/v1/rooms/:code/start", post(http::http_start_room))
        .route("/api/v1/rooms/:code/end", post(http::http_end_room))
        .route("/api/v1/rooms/:code/leaderboard", get(http::http_leaderboard))
        .route("/api/v1/rooms/:code/analytics", put(http::http_put_analytics))
        // HTTP API: player
        .route("/api/v1/rooms/:code/join", post(http::http_join))
        .route("/api/v1/rooms/:code/players/:player_id/current", get(http::http_current))
        .route("/api/v1/rooms/:code/players/:player_id/answers", post(http::http_submit_answer))
        .route("/api/v1/rooms/:code/players/:player_id/skip", post(http::http_skip))
        .route("/api/v1/rooms/:code/players/:player_id/draft", put(http::http_save_draft))
        // State + CORS + HTTP tracing
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_request(DefaultOnRequest::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        // Frontend fallback
        .fallback_service(static_service)
}
