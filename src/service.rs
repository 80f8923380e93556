//! Tunnel request resolution.
//!
//! [`TunnelRequestService`] turns the first instruction of a fresh transport
//! connection into a live, monitored tunnel: it validates the caller's token,
//! resolves the requested target, connects the backend, registers the session
//! and spawns its message loop. What the transport gets back is an
//! [`ActiveTunnel`] — a monitoring wrapper whose close records the session
//! duration, drops the tunnel from the owning token's active set, and
//! invalidates the whole token when the close stems from an authorization
//! failure.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::AuthSessions;
use crate::config::Config;
use crate::error::{GatewayError, Result};
use crate::sessions::{message_loop, BackendHandlers, Session, SessionRegistry};
use crate::state::{GatewayEventKind, GatewayStats};
use crate::tunnel::backend::{ClientInfo, GuacdBackend};
use crate::tunnel::Tunnel;

/// Display geometry a client may request in its `connect` instruction.
/// Missing values fall back to the configured defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisplayRequest {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub dpi: Option<u32>,
}

/// Resolves connection requests into connected, session-tracked tunnels.
pub struct TunnelRequestService {
    config: Arc<Config>,
    backend: GuacdBackend,
    registry: SessionRegistry,
    auth: AuthSessions,
    stats: Arc<GatewayStats>,
}

impl TunnelRequestService {
    pub fn new(
        config: Arc<Config>,
        registry: SessionRegistry,
        auth: AuthSessions,
        stats: Arc<GatewayStats>,
    ) -> Self {
        let backend = GuacdBackend::new(
            config.backend.addr.clone(),
            std::time::Duration::from_millis(config.backend.connect_timeout_ms),
        );
        Self {
            config,
            backend,
            registry,
            auth,
            stats,
        }
    }

    /// Resolve a `connect,<target>,...;` request: new session, new backend
    /// connection, message loop spawned. Returns the transport end of the
    /// session's tunnel pair, wrapped for monitoring.
    pub async fn connect(
        &self,
        token: &str,
        target_id: &str,
        display: DisplayRequest,
    ) -> Result<Arc<ActiveTunnel>> {
        self.auth.validate(token).await?;

        if self.registry.len().await >= self.config.server.max_sessions {
            return Err(GatewayError::Unavailable(format!(
                "session limit reached ({})",
                self.config.server.max_sessions
            )));
        }

        let target = self
            .config
            .target(target_id)
            .ok_or_else(|| GatewayError::NotFound(format!("target {target_id}")))?;

        let mut params: Vec<(String, String)> = target
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        params.sort();
        let info = ClientInfo {
            protocol: target.protocol.clone(),
            host: target.host.clone(),
            port: target.port,
            params,
            width: display.width.unwrap_or(self.config.display.default_width),
            height: display.height.unwrap_or(self.config.display.default_height),
            dpi: display.dpi.unwrap_or(self.config.display.default_dpi),
        };

        let backend_tunnel = self.backend.connect(&info).await?;
        let handlers = BackendHandlers::spawn(
            backend_tunnel,
            self.config.backend.input_queue_depth,
            self.config.backend.output_buffer_size,
        );

        let (transport_end, session_end) = Tunnel::pair(self.config.server.tunnel_queue_depth);
        let session_id = Uuid::new_v4();
        let session = Session::new(session_id, session_end);
        self.registry.put(Arc::clone(&session)).await?;
        message_loop::spawn(
            session,
            Box::new(handlers),
            self.registry.clone(),
            Arc::clone(&self.stats),
        );

        self.stats.session_started();
        self.stats.tunnel_opened();
        self.stats
            .push_event(
                GatewayEventKind::SessionStarted,
                format!("session {session_id} target {target_id}"),
            )
            .await;
        info!(session = %session_id, target = %target_id, "session established");

        transport_end.mark_open();
        let active = ActiveTunnel::wrap(
            session_id,
            token,
            transport_end,
            self.auth.clone(),
            Arc::clone(&self.stats),
        );
        self.auth.track(token, Arc::clone(&active)).await;
        Ok(active)
    }

    /// Resolve a `resume,<uuid>;` request: look the session up, attach a
    /// fresh tunnel pair through the ownership gate. The stale transport (if
    /// any) is closed by the session's message loop when it adopts the swap.
    pub async fn resume(&self, token: &str, session_id: Uuid) -> Result<Arc<ActiveTunnel>> {
        self.auth.validate(token).await?;

        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or_else(|| GatewayError::NotFound(format!("session {session_id}")))?;

        let (transport_end, session_end) = Tunnel::pair(self.config.server.tunnel_queue_depth);
        let previous = session.resume(session_end);

        self.stats.tunnel_resumed();
        self.stats
            .push_event(
                GatewayEventKind::TunnelResumed,
                format!("session {session_id}"),
            )
            .await;
        info!(
            session = %session_id,
            displaced = previous.is_some(),
            "session resumed on fresh transport"
        );

        transport_end.mark_open();
        let active = ActiveTunnel::wrap(
            session_id,
            token,
            transport_end,
            self.auth.clone(),
            Arc::clone(&self.stats),
        );
        self.auth.track(token, Arc::clone(&active)).await;
        Ok(active)
    }
}

/// Monitoring wrapper around the transport end of a session's tunnel.
///
/// Holds shared, non-owning visibility into the session for logging and
/// invalidation; the tunnel itself stays exclusively driven by the transport
/// bridge that received it.
pub struct ActiveTunnel {
    session_id: Uuid,
    token: String,
    tunnel: Arc<Tunnel>,
    opened: Instant,
    auth: AuthSessions,
    stats: Arc<GatewayStats>,
    closed: AtomicBool,
    outcome_tx: watch::Sender<Option<&'static str>>,
}

impl ActiveTunnel {
    fn wrap(
        session_id: Uuid,
        token: &str,
        tunnel: Arc<Tunnel>,
        auth: AuthSessions,
        stats: Arc<GatewayStats>,
    ) -> Arc<Self> {
        let (outcome_tx, _) = watch::channel(None);
        Arc::new(Self {
            session_id,
            token: token.to_string(),
            tunnel,
            opened: Instant::now(),
            auth,
            stats,
            closed: AtomicBool::new(false),
            outcome_tx,
        })
    }

    /// Id of the underlying transport-side tunnel (the admin surface key).
    pub fn tunnel_id(&self) -> Uuid {
        self.tunnel.id()
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn tunnel(&self) -> &Arc<Tunnel> {
        &self.tunnel
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.opened.elapsed()
    }

    /// Final status code recorded at close, if the tunnel has closed.
    pub fn outcome(&self) -> Option<&'static str> {
        *self.outcome_tx.borrow()
    }

    /// Close the tunnel and record the outcome. Runs its bookkeeping at most
    /// once no matter how many paths race into it: duration log, removal from
    /// the owning token's active set, and — when the close stems from an
    /// authorization failure — invalidation of the whole token.
    pub async fn close(&self, error: Option<&GatewayError>) {
        self.tunnel.close();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let code = error.map_or("CLOSED", GatewayError::code);
        let _ = self.outcome_tx.send(Some(code));
        let secs = self.opened.elapsed().as_secs();
        match error {
            None | Some(GatewayError::Closed) => {
                info!(session = %self.session_id, tunnel = %self.tunnel.id(), duration_secs = secs, "tunnel closed");
            }
            Some(e) => {
                warn!(session = %self.session_id, tunnel = %self.tunnel.id(), duration_secs = secs, "tunnel closed: {e}");
            }
        }

        self.stats.tunnel_closed();
        self.stats
            .push_event(
                GatewayEventKind::TunnelClosed,
                format!("session {} after {secs}s ({code})", self.session_id),
            )
            .await;

        self.auth.remove_tunnel(&self.token, self.tunnel.id()).await;
        if let Some(GatewayError::Unauthorized(detail)) = error {
            warn!(session = %self.session_id, "authorization failure on close, invalidating token: {detail}");
            self.stats
                .push_event(
                    GatewayEventKind::AuthInvalidated,
                    format!("session {}", self.session_id),
                )
                .await;
            self.auth.invalidate(&self.token).await;
        }
    }
}

impl std::fmt::Debug for ActiveTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActiveTunnel")
            .field("session_id", &self.session_id)
            .field("tunnel_id", &self.tunnel.id())
            .finish_non_exhaustive()
    }
}
