//! Unauthenticated health-check endpoint.

use std::sync::atomic::Ordering;

use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::AppState;

/// `GET /api/health` — liveness probe.
///
/// Returns status, uptime, version, live session count, and tunnel counters.
/// No authentication required, suitable for load-balancer health checks.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let sessions = state.registry.len().await;
    let stats = &state.stats;

    Json(json!({
        "status": "ok",
        "uptime_secs": uptime,
        "version": env!("CARGO_PKG_VERSION"),
        "sessions": sessions,
        "http_transports": state.http_transports.len().await,
        "tunnels": {
            "opened": stats.tunnels_opened.load(Ordering::Relaxed),
            "resumed": stats.tunnels_resumed.load(Ordering::Relaxed),
            "closed": stats.tunnels_closed.load(Ordering::Relaxed),
        },
    }))
}
