#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # guacgate
//!
//! Clientless remote-desktop gateway. Browsers connect over WebSocket or
//! paired HTTP long-poll endpoints; the gateway frames Guacamole-protocol
//! instructions and drives a guacd backend connection per session. Sessions
//! survive transport loss: a client may `pause;` on one connection and
//! `resume,<id>;` on a fresh one without losing backend state.
//!
//! ## API surface
//!
//! | Method | Path                          | Auth       | Description                    |
//! |--------|-------------------------------|------------|--------------------------------|
//! | GET    | `/api/health`                 | No         | Liveness probe                 |
//! | GET    | `/api/tunnels`                | Yes        | List active tunnels            |
//! | DELETE | `/api/tunnels/{id}`           | Yes        | Terminate a tunnel             |
//! | GET    | `/tunnel/ws`                  | `?token=`* | WebSocket tunnel               |
//! | POST   | `/tunnel/http`                | `?token=`  | Open a long-poll tunnel        |
//! | POST   | `/tunnel/http/{id}/write`     | `?token=`  | Long-poll inbound payload      |
//! | GET    | `/tunnel/http/{id}/read`      | `?token=`  | Long-poll batched output       |
//!
//! *Tunnel auth is via `?token=<key>` query param (no `Authorization` header
//! available during a browser WebSocket upgrade).
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, router setup, graceful shutdown
//! auth.rs          — Bearer token middleware, token sessions, invalidation
//! config.rs        — TOML + env-var configuration
//! error.rs         — GatewayError taxonomy, WS close-code / HTTP status mapping
//! protocol/
//!   instruction.rs — Instruction model, element escaping, control opcodes
//!   decoder.rs     — streaming decoder over partial reads
//! tunnel/
//!   mod.rs         — Tunnel pairs and socket tunnels, RAII reader/writer guards
//!   backend.rs     — guacd connector and connect handshake
//! sessions/
//!   mod.rs         — SessionRegistry (put/get/remove/shutdown)
//!   session.rs     — Session identity + transport ownership gate
//!   handlers.rs    — handler table trait + backend-driven implementation
//!   message_loop.rs — per-session dispatch/pump/teardown loop
//! transport/
//!   mod.rs         — establish, inbound filter, batching output pump
//!   ws.rs          — WebSocket binding
//!   http.rs        — HTTP long-poll binding + idle sweep
//! service.rs       — TunnelRequestService + ActiveTunnel monitoring wrapper
//! routes/
//!   health.rs      — GET /api/health
//!   tunnels.rs     — GET/DELETE /api/tunnels
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::{
    middleware,
    routing::{get, post},
    Extension, Router,
};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use guacgate::auth::{self, AuthSessions};
use guacgate::service::TunnelRequestService;
use guacgate::state::GatewayStats;
use guacgate::transport::http::HttpTransports;
use guacgate::{routes, transport, ApiKey, AppState, Config, SessionRegistry};

/// Clientless remote-desktop gateway.
#[derive(Parser)]
#[command(name = "guacgate", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway server (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve { config }) => run_server(config.as_deref()).await,
        None => run_server(None).await,
    }
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("guacgate v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);
    info!("Backend daemon at {}", config.backend.addr);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set GUACGATE_API_KEY or update config");
    }
    if config.targets.is_empty() {
        warn!("No [[target]] entries configured; every connect will fail");
    }

    let config = Arc::new(config);
    let registry = SessionRegistry::new();
    let auth_sessions = AuthSessions::new(config.auth.api_key.clone());
    let stats = Arc::new(GatewayStats::new());
    let service = Arc::new(TunnelRequestService::new(
        Arc::clone(&config),
        registry.clone(),
        auth_sessions.clone(),
        Arc::clone(&stats),
    ));

    let state = AppState {
        config: Arc::clone(&config),
        start_time: Instant::now(),
        registry: registry.clone(),
        auth: auth_sessions,
        service,
        http_transports: HttpTransports::new(),
        stats,
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route("/api/tunnels", get(routes::tunnels::list_tunnels))
        .route(
            "/api/tunnels/{id}",
            axum::routing::delete(routes::tunnels::kill_tunnel),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let tunnel_routes = Router::new()
        .route("/tunnel/ws", get(transport::ws::ws_upgrade))
        .route("/tunnel/http", post(transport::http::open))
        .route("/tunnel/http/{id}/write", post(transport::http::write))
        .route("/tunnel/http/{id}/read", get(transport::http::read));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(tunnel_routes)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Server ready");

    // Periodic sweep: evict long-poll transports nobody is polling.
    let transports = state.http_transports.clone();
    let ttl = std::time::Duration::from_secs(config.server.http_transport_ttl_secs);
    let sweep_every = std::time::Duration::from_secs(config.server.sweep_interval_secs);
    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_every);
        loop {
            interval.tick().await;
            transports.sweep(ttl).await;
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup
    info!("Shutting down...");
    sweep_task.abort();
    registry.shutdown().await;
    info!("Goodbye");
}
