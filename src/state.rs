//! Shared application state passed to every handler via Axum's `State`
//! extractor, plus gateway-wide counters.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::auth::AuthSessions;
use crate::config::Config;
use crate::service::TunnelRequestService;
use crate::sessions::SessionRegistry;
use crate::transport::http::HttpTransports;

/// Shared application state for the gateway.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Live sessions, keyed by session UUID.
    pub registry: SessionRegistry,
    /// Token validation and per-token active-tunnel tracking.
    pub auth: AuthSessions,
    /// Resolves connection requests into connected, monitored tunnels.
    pub service: Arc<TunnelRequestService>,
    /// Open HTTP long-poll transports, keyed by tunnel UUID.
    pub http_transports: HttpTransports,
    /// Counters and the recent-event ring.
    pub stats: Arc<GatewayStats>,
}

/// Gateway lifecycle event types.
#[derive(Clone, Debug)]
pub enum GatewayEventKind {
    SessionStarted,
    SessionEnded,
    TunnelOpened,
    TunnelResumed,
    TunnelClosed,
    AuthInvalidated,
}

impl GatewayEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionEnded => "session_ended",
            Self::TunnelOpened => "tunnel_opened",
            Self::TunnelResumed => "tunnel_resumed",
            Self::TunnelClosed => "tunnel_closed",
            Self::AuthInvalidated => "auth_invalidated",
        }
    }
}

/// One lifecycle event for observability.
#[derive(Clone, Debug)]
pub struct GatewayEvent {
    pub timestamp: Instant,
    pub kind: GatewayEventKind,
    pub detail: String,
}

/// Maximum number of recent events to retain.
const MAX_EVENTS: usize = 50;

/// Gateway counters — atomics for lock-free hot-path updates, a Mutex only
/// for the event ring (cold path).
pub struct GatewayStats {
    pub sessions_started: AtomicU64,
    pub sessions_ended: AtomicU64,
    pub tunnels_opened: AtomicU64,
    pub tunnels_resumed: AtomicU64,
    pub tunnels_closed: AtomicU64,
    events: Mutex<VecDeque<GatewayEvent>>,
}

impl GatewayStats {
    pub fn new() -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            sessions_ended: AtomicU64::new(0),
            tunnels_opened: AtomicU64::new(0),
            tunnels_resumed: AtomicU64::new(0),
            tunnels_closed: AtomicU64::new(0),
            events: Mutex::new(VecDeque::with_capacity(MAX_EVENTS)),
        }
    }

    pub fn session_started(&self) {
        self.sessions_started
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn session_ended(&self) {
        self.sessions_ended
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn tunnel_opened(&self) {
        self.tunnels_opened
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn tunnel_resumed(&self) {
        self.tunnels_resumed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn tunnel_closed(&self) {
        self.tunnels_closed
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    /// Push a lifecycle event, evicting the oldest if at capacity.
    pub async fn push_event(&self, kind: GatewayEventKind, detail: String) {
        let mut events = self.events.lock().await;
        if events.len() >= MAX_EVENTS {
            events.pop_front();
        }
        events.push_back(GatewayEvent {
            timestamp: Instant::now(),
            kind,
            detail,
        });
    }

    /// Most recent events, newest first.
    pub async fn recent_events(&self, limit: usize) -> Vec<GatewayEvent> {
        let events = self.events.lock().await;
        events.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_ring_evicts_oldest() {
        let stats = GatewayStats::new();
        for i in 0..(MAX_EVENTS + 10) {
            stats
                .push_event(GatewayEventKind::TunnelOpened, format!("t{i}"))
                .await;
        }
        let recent = stats.recent_events(MAX_EVENTS * 2).await;
        assert_eq!(recent.len(), MAX_EVENTS);
        // Newest first.
        assert_eq!(recent[0].detail, format!("t{}", MAX_EVENTS + 9));
    }
}
