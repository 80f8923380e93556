//! Pre-shared token authentication and auth-session tracking.
//!
//! Admin endpoints require an `Authorization: Bearer <key>` header. The
//! tunnel transports use a `?token=` query parameter instead (browsers can't
//! set headers on WebSocket upgrades).
//!
//! Beyond validation, [`AuthSessions`] tracks which active tunnels each token
//! owns. When a tunnel closes with an authorization failure, the whole token
//! is invalidated: its remaining tunnels are closed and further validation
//! fails until restart.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::service::ActiveTunnel;

/// Axum middleware that rejects requests without a valid `Authorization:
/// Bearer` header. The expected key is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized` — header missing or malformed
/// - `403 Forbidden` — key present but invalid
/// - `500 Internal Server Error` — [`ApiKey`] extension not found (misconfiguration)
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let api_key = match request.extensions().get::<ApiKey>() {
        Some(key) => key.0.clone(),
        None => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "Server configuration error"})),
            )
                .into_response();
        }
    };

    let auth_header = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let provided = match auth_header {
        Some(h) if h.starts_with("Bearer ") => &h[7..],
        _ => {
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Missing or invalid Authorization header"})),
            )
                .into_response();
        }
    };

    if !constant_time_eq(api_key.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison to prevent timing side-channel attacks.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so an attacker cannot determine the key length from response times.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    // Always iterate over the expected key length to avoid timing leak
    for i in 0..expected.len() {
        let p = if i < provided.len() {
            provided[i]
        } else {
            0xff
        };
        diff |= expected[i] ^ p;
    }
    diff == 0
}

/// Extension type carrying the expected API key, injected into the router
/// layer so [`require_api_key`] can access it without touching `AppState`.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Per-token auth state.
struct AuthEntry {
    tunnels: HashMap<Uuid, Arc<ActiveTunnel>>,
    established: Instant,
}

struct AuthInner {
    sessions: HashMap<String, AuthEntry>,
    revoked: HashSet<String>,
}

/// Token validation plus per-token active-tunnel tracking.
///
/// Cloneable — all clones share the same inner state.
#[derive(Clone)]
pub struct AuthSessions {
    api_key: String,
    inner: Arc<RwLock<AuthInner>>,
}

impl AuthSessions {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            inner: Arc::new(RwLock::new(AuthInner {
                sessions: HashMap::new(),
                revoked: HashSet::new(),
            })),
        }
    }

    /// Validate a tunnel-request token: constant-time key comparison plus a
    /// revocation check. Establishes the auth session on first use.
    pub async fn validate(&self, token: &str) -> Result<()> {
        if !constant_time_eq(self.api_key.as_bytes(), token.as_bytes()) {
            return Err(GatewayError::Unauthorized("invalid token".into()));
        }
        let mut inner = self.inner.write().await;
        if inner.revoked.contains(token) {
            return Err(GatewayError::Unauthorized("token invalidated".into()));
        }
        inner
            .sessions
            .entry(token.to_string())
            .or_insert_with(|| AuthEntry {
                tunnels: HashMap::new(),
                established: Instant::now(),
            });
        Ok(())
    }

    /// Record an active tunnel under its owning token.
    pub async fn track(&self, token: &str, tunnel: Arc<ActiveTunnel>) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.get_mut(token) {
            entry.tunnels.insert(tunnel.tunnel_id(), tunnel);
        }
    }

    /// Drop a tunnel from its owning token's set (no-op if already gone).
    pub async fn remove_tunnel(&self, token: &str, tunnel_id: Uuid) {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.sessions.get_mut(token) {
            entry.tunnels.remove(&tunnel_id);
        }
    }

    /// Invalidate a token: reject it from now on and close every tunnel it
    /// still owns.
    pub async fn invalidate(&self, token: &str) {
        let drained: Vec<Arc<ActiveTunnel>> = {
            let mut inner = self.inner.write().await;
            inner.revoked.insert(token.to_string());
            inner
                .sessions
                .remove(token)
                .map(|entry| entry.tunnels.into_values().collect())
                .unwrap_or_default()
        };
        if !drained.is_empty() {
            warn!(count = drained.len(), "closing tunnels of invalidated token");
        }
        for tunnel in drained {
            tunnel.tunnel().close();
        }
    }

    /// All active tunnels across every token, for the admin surface.
    pub async fn all_tunnels(&self) -> Vec<Arc<ActiveTunnel>> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .flat_map(|entry| entry.tunnels.values().cloned())
            .collect()
    }

    /// Find one active tunnel by id.
    pub async fn find_tunnel(&self, tunnel_id: Uuid) -> Option<Arc<ActiveTunnel>> {
        let inner = self.inner.read().await;
        inner
            .sessions
            .values()
            .find_map(|entry| entry.tunnels.get(&tunnel_id).cloned())
    }

    /// Age of a token's auth session, if established.
    pub async fn session_age(&self, token: &str) -> Option<std::time::Duration> {
        let inner = self.inner.read().await;
        inner.sessions.get(token).map(|e| e.established.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secreT"));
        assert!(!constant_time_eq(b"secret", b"secre"));
        assert!(!constant_time_eq(b"secret", b""));
    }

    #[tokio::test]
    async fn test_validate_rejects_wrong_token() {
        let auth = AuthSessions::new("k".into());
        assert!(auth.validate("k").await.is_ok());
        assert!(matches!(
            auth.validate("wrong").await,
            Err(GatewayError::Unauthorized(_))
        ));
    }

    #[tokio::test]
    async fn test_invalidate_blocks_future_validation() {
        let auth = AuthSessions::new("k".into());
        auth.validate("k").await.unwrap();
        auth.invalidate("k").await;
        assert!(matches!(
            auth.validate("k").await,
            Err(GatewayError::Unauthorized(_))
        ));
    }
}
