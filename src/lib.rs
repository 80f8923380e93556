#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! guacgate library — the tunnel/protocol core behind the binary.
//!
//! Building blocks:
//! - `protocol` — Guacamole wire instructions: escaping, streaming decode
//! - `tunnel` — transport-agnostic instruction channels + the guacd connector
//! - `sessions` — session registry, ownership gate, per-session message loop
//! - `transport` — WebSocket and HTTP long-poll bridges
//! - `service` — request → connected, monitored tunnel
//! - `auth` — API key middleware, token sessions, invalidation
//! - `config` — TOML + env-var configuration
//! - `routes` — admin REST handlers

pub mod auth;
pub mod config;
pub mod error;
pub mod protocol;
pub mod routes;
pub mod service;
pub mod sessions;
pub mod state;
pub mod transport;
pub mod tunnel;

// Re-export key types at crate root for convenience.
pub use auth::ApiKey;
pub use config::Config;
pub use error::{GatewayError, Result};
pub use protocol::Instruction;
pub use sessions::SessionRegistry;
pub use state::AppState;
