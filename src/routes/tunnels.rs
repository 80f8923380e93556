//! REST endpoints for tunnel administration.
//!
//! - `GET    /api/tunnels`      — enumerate active tunnels
//! - `DELETE /api/tunnels/{id}` — administratively terminate a tunnel

use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::AppState;

/// `GET /api/tunnels` — list active tunnels with counters and recent
/// lifecycle events.
pub async fn list_tunnels(State(state): State<AppState>) -> Json<Value> {
    let tunnels = state.auth.all_tunnels().await;
    let tunnels_json: Vec<Value> = tunnels
        .iter()
        .map(|t| {
            json!({
                "tunnel_id": t.tunnel_id(),
                "session_id": t.session_id(),
                "state": t.tunnel().state().as_str(),
                "uptime_secs": t.uptime().as_secs(),
            })
        })
        .collect();

    let stats = &state.stats;
    let now = Instant::now();
    let recent_events: Vec<Value> = stats
        .recent_events(10)
        .await
        .iter()
        .map(|e| {
            let ago = now.duration_since(e.timestamp).as_secs();
            json!({
                "ago_secs": ago,
                "event": e.kind.as_str(),
                "detail": e.detail,
            })
        })
        .collect();

    Json(json!({
        "tunnels": tunnels_json,
        "counters": {
            "sessions_started": stats.sessions_started.load(Ordering::Relaxed),
            "sessions_ended": stats.sessions_ended.load(Ordering::Relaxed),
            "tunnels_opened": stats.tunnels_opened.load(Ordering::Relaxed),
            "tunnels_resumed": stats.tunnels_resumed.load(Ordering::Relaxed),
            "tunnels_closed": stats.tunnels_closed.load(Ordering::Relaxed),
        },
        "recent_events": recent_events,
    }))
}

/// `DELETE /api/tunnels/{id}` — close a tunnel by id.
///
/// The owning session's message loop observes the close and runs its normal
/// teardown; a paused session keeps waiting for a resume.
pub async fn kill_tunnel(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let Some(tunnel) = state.auth.find_tunnel(id).await else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("Tunnel {id} not found"), "code": "NOT_FOUND"})),
        ));
    };

    tunnel.close(None).await;
    Ok(Json(json!({
        "ok": true,
        "tunnel_id": id,
        "session_id": tunnel.session_id(),
    })))
}
