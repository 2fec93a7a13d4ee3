//! Telemetry initialization (tracing/tracing-subscriber).
//!
//! Behavior:
//! - LOG_LEVEL controls the filter (e.g. "debug" or detailed directives like
//!   "info,session=debug,survey_live=debug,tower_http=info,axum=info").
//! - LOG_FORMAT selects "pretty" (default) or "json" structured logs.
//! - LOG_SPANS=1 adds span close events (request and submission timings).
//!
//! Targets:
//! - `survey_live`: infrastructure (hub, cache, evaluator plumbing, sockets).
//! - `session`: per-player flow (joins, submissions, follow-ups, skips).

use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

/// Install the global subscriber. Safe to call twice; the second call is a no-op.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| {
        EnvFilter::new("info,session=debug,survey_live=debug,tower_http=info,axum=info")
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events());

    let installed = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => builder.json().try_init(),
        _ => builder.try_init(),
    };
    if installed.is_err() {
        tracing::debug!(target: "survey_live", "Tracing subscriber already installed");
    }
}

/// `LOG_SPANS=1` also logs span close events with their timings.
fn span_events() -> FmtSpan {
    match std::env::var("LOG_SPANS").as_deref() {
        Ok("1") | Ok("true") => FmtSpan::CLOSE,
        _ => FmtSpan::NONE,
    }
}
