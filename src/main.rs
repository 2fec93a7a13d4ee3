//! Survey Live · multi-player survey session backend
//!
//! - Axum HTTP + WebSocket API for hosts and players
//! - Per-player question queues with follow-up splicing
//! - Idempotent answer evaluation (OpenAI when configured, local rubric otherwise)
//! - Static SPA fallback (./static/index.html)
//!
//! Important env variables:
//!   PORT                : u16 (default 3000)
//!   OPENAI_API_KEY      : enables the OpenAI evaluator if present
//!   OPENAI_BASE_URL     : default "https://api.openai.com/v1"
//!   OPENAI_FAST_MODEL   : default "gpt-4o-mini"
//!   OPENAI_STRONG_MODEL : default "gpt-4o"
//!   SESSION_CONFIG_PATH : path to TOML config (settings, prompts, surveys)
//!   LOG_LEVEL           : tracing filter, e.g. "debug" or full directives
//!   LOG_FORMAT          : "pretty" (default) or "json"
//!   LOG_SPANS           : "1" to log span timings

mod telemetry;
mod util;
mod domain;
mod error;
mod config;
mod seeds;
mod cache;
mod rooms;
mod queue;
mod attempts;
mod answers;
mod scores;
mod openai;
mod evaluator;
mod followup;
mod hub;
mod state;
mod protocol;
mod logic;
mod routes;

use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument};

use crate::routes::build_router;
use crate::state::AppState;

#[instrument(level = "info", skip_all)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  telemetry::init_tracing();

  // Shared state: cache-backed stores, answer log, evaluators, broadcast hub.
  let state = Arc::new(AppState::new());

  // Expired rooms, queues and claims are dropped lazily on read; sweep the rest.
  let cache = state.cache.clone();
  let sweep = Duration::from_secs(state.settings.cache_sweep_secs.max(1));
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(sweep);
    loop {
      ticker.tick().await;
      let purged = cache.purge_expired().await;
      if purged > 0 {
        debug!(target: "survey_live", purged, "Cache sweep");
      }
    }
  });

  let app = build_router(state.clone());

  let addr: SocketAddr = std::env::var("PORT")
    .ok()
    .and_then(|p| p.parse::<u16>().ok())
    .map(|port| SocketAddr::from(([0, 0, 0, 0], port)))
    .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 3000)));

  let listener = TcpListener::bind(addr).await?;
  info!(target: "survey_live", %addr, evaluator = state.evaluators.primary_name(), "HTTP server listening");
  axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
  info!(target: "survey_live", "HTTP server stopped");
  Ok(())
}

async fn shutdown_signal() {
  if let Err(e) = tokio::signal::ctrl_c().await {
    tracing::error!(target: "survey_live", error = %e, "Could not listen for shutdown signal");
    std::future::pending::<()>().await;
  }
}
