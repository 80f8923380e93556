//! Error taxonomy shared across the tunnel subsystem.
//!
//! Every failure that can cross a component boundary is a [`GatewayError`].
//! The variants map onto the four outcomes a transport can observe:
//!
//! - **Client fault** ([`GatewayError::Protocol`]) — malformed or invalid
//!   inbound data. The session is terminated, never retried.
//! - **Clean close** ([`GatewayError::Closed`]) — EOF from either side.
//!   Logged at debug, not surfaced as an error.
//! - **Server fault** ([`GatewayError::Internal`], [`GatewayError::Unavailable`])
//!   — logged at error level, a generic failure code goes to the transport.
//! - **Authorization** ([`GatewayError::Unauthorized`]) — the tunnel is closed
//!   *and* the owning auth session is invalidated.
//!
//! Each variant carries its own WebSocket close code and HTTP status so
//! transports never invent their own mapping.

use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, GatewayError>;

#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    /// Clean end-of-stream from the backend or the transport.
    #[error("connection closed")]
    Closed,
    /// Malformed or protocol-violating data from the client.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Token missing, revoked, or wrong.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// Unknown target, or resume against an unknown session id.
    #[error("not found: {0}")]
    NotFound(String),
    /// Backend daemon refused or timed out on connect.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// A session with this id is already registered.
    #[error("session {0} already registered")]
    SessionConflict(Uuid),
    /// The registry has been shut down and rejects all operations.
    #[error("gateway is shutting down")]
    Shutdown,
    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// WebSocket close code reported to the browser.
    pub fn ws_close_code(&self) -> u16 {
        match self {
            Self::Closed => 1000,
            Self::Protocol(_) => 1002,
            Self::Unauthorized(_) | Self::NotFound(_) | Self::SessionConflict(_) => 1008,
            Self::Unavailable(_) => 1013,
            Self::Shutdown => 1001,
            Self::Internal(_) => 1011,
        }
    }

    /// HTTP status for the long-poll binding and the admin API.
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Closed => StatusCode::NO_CONTENT,
            Self::Protocol(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::BAD_GATEWAY,
            Self::SessionConflict(_) => StatusCode::CONFLICT,
            Self::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the transport should treat this as a successful teardown.
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Closed)
    }

    /// Short machine-readable code for admin JSON responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::Protocol(_) => "PROTOCOL_ERROR",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::Unavailable(_) => "BACKEND_UNAVAILABLE",
            Self::SessionConflict(_) => "SESSION_CONFLICT",
            Self::Shutdown => "SHUTTING_DOWN",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}
