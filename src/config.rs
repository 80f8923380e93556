//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `GUACGATE_API_KEY`, `GUACGATE_LISTEN`,
//!    `GUACGATE_GUACD`
//! 2. **Config file** — path via `--config <path>`, or `guacgate.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "0.0.0.0:8080"
//! max_sessions = 50
//! output_batch_bytes = 8192
//! tunnel_queue_depth = 256
//! http_poll_timeout_ms = 15000
//! http_transport_ttl_secs = 60
//! sweep_interval_secs = 30
//!
//! [auth]
//! api_key = "your-secret-key"
//!
//! [backend]
//! addr = "127.0.0.1:4822"
//! connect_timeout_ms = 5000
//! input_queue_depth = 256
//! output_buffer_size = 4096
//!
//! [display]
//! default_width = 1024
//! default_height = 768
//! default_dpi = 96
//!
//! [logging]
//! level = "info"
//!
//! [[target]]
//! id = "dev-vm"
//! protocol = "vnc"
//! host = "10.0.0.9"
//! port = 5901
//! params = { password = "secret" }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub display: DisplayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Connection targets clients may request by id.
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetConfig>,
}

/// HTTP server and resource-limit settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `0.0.0.0:8080`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Maximum concurrent sessions (default 50).
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    /// Flush the output batch once it reaches this many bytes (default 8192).
    #[serde(default = "default_output_batch_bytes")]
    pub output_batch_bytes: usize,
    /// Depth of the per-tunnel instruction queues (default 256).
    #[serde(default = "default_tunnel_queue_depth")]
    pub tunnel_queue_depth: usize,
    /// How long an HTTP long-poll read blocks before flushing a keepalive
    /// (default 15 000 ms).
    #[serde(default = "default_http_poll_timeout_ms")]
    pub http_poll_timeout_ms: u64,
    /// Evict HTTP transports idle longer than this (default 60 s).
    #[serde(default = "default_http_transport_ttl_secs")]
    pub http_transport_ttl_secs: u64,
    /// Interval of the idle-transport sweep (default 30 s).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Pre-shared token. Override with `GUACGATE_API_KEY` env var.
    /// Defaults to `"change-me"` which triggers a startup warning.
    #[serde(default = "default_api_key")]
    pub api_key: String,
}

/// Backend daemon settings.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    /// Address of the guacd daemon (default `127.0.0.1:4822`). Override with
    /// `GUACGATE_GUACD`.
    #[serde(default = "default_backend_addr")]
    pub addr: String,
    /// TCP connect timeout in milliseconds (default 5000).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Depth of the session → backend input queue (default 256).
    #[serde(default = "default_input_queue_depth")]
    pub input_queue_depth: usize,
    /// Maximum backend output instructions buffered while a session has no
    /// attached transport (default 4096, oldest evicted first).
    #[serde(default = "default_output_buffer_size")]
    pub output_buffer_size: usize,
}

/// Display geometry used when the client doesn't request its own.
#[derive(Debug, Clone, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_width")]
    pub default_width: u32,
    #[serde(default = "default_height")]
    pub default_height: u32,
    #[serde(default = "default_dpi")]
    pub default_dpi: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// A connection target clients may request by id in a `connect` instruction.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    /// Identifier clients use in `connect,<id>,...;`.
    pub id: String,
    /// Native protocol the backend should drive (`vnc`, `rdp`, ...).
    pub protocol: String,
    /// Remote host the backend connects to.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Extra protocol parameters passed through to the backend.
    #[serde(default)]
    pub params: HashMap<String, String>,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_max_sessions() -> usize {
    50
}
fn default_output_batch_bytes() -> usize {
    8192
}
fn default_tunnel_queue_depth() -> usize {
    256
}
fn default_http_poll_timeout_ms() -> u64 {
    15000
}
fn default_http_transport_ttl_secs() -> u64 {
    60
}
fn default_sweep_interval_secs() -> u64 {
    30
}
fn default_api_key() -> String {
    "change-me".to_string()
}
fn default_backend_addr() -> String {
    "127.0.0.1:4822".to_string()
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_input_queue_depth() -> usize {
    256
}
fn default_output_buffer_size() -> usize {
    4096
}
fn default_width() -> u32 {
    1024
}
fn default_height() -> u32 {
    768
}
fn default_dpi() -> u32 {
    96
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_sessions: default_max_sessions(),
            output_batch_bytes: default_output_batch_bytes(),
            tunnel_queue_depth: default_tunnel_queue_depth(),
            http_poll_timeout_ms: default_http_poll_timeout_ms(),
            http_transport_ttl_secs: default_http_transport_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            api_key: default_api_key(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            addr: default_backend_addr(),
            connect_timeout_ms: default_connect_timeout_ms(),
            input_queue_depth: default_input_queue_depth(),
            output_buffer_size: default_output_buffer_size(),
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            default_width: default_width(),
            default_height: default_height(),
            default_dpi: default_dpi(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            backend: BackendConfig::default(),
            display: DisplayConfig::default(),
            logging: LoggingConfig::default(),
            targets: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file (panics on failure). Otherwise
    /// looks for `guacgate.toml` in the current directory, falling back to
    /// compiled defaults.
    pub fn load(path: Option<&str>) -> Self {
        let mut config: Config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .unwrap_or_else(|e| panic!("Failed to read config file {p}: {e}"));
            toml::from_str(&content)
                .unwrap_or_else(|e| panic!("Failed to parse config file {p}: {e}"))
        } else if Path::new("guacgate.toml").exists() {
            let content =
                std::fs::read_to_string("guacgate.toml").expect("Failed to read guacgate.toml");
            toml::from_str(&content).expect("Failed to parse guacgate.toml")
        } else {
            Config::default()
        };

        // Env var overrides
        if let Ok(key) = std::env::var("GUACGATE_API_KEY") {
            config.auth.api_key = key;
        }
        if let Ok(listen) = std::env::var("GUACGATE_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(addr) = std::env::var("GUACGATE_GUACD") {
            config.backend.addr = addr;
        }

        config
    }

    /// Look up a configured target by id.
    pub fn target(&self, id: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            api_key = "k"

            [[target]]
            id = "dev"
            protocol = "vnc"
            host = "10.0.0.9"
            port = 5901
            params = { password = "s" }
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.api_key, "k");
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        let t = config.target("dev").unwrap();
        assert_eq!(t.protocol, "vnc");
        assert_eq!(t.params.get("password").map(String::as_str), Some("s"));
        assert!(config.target("nope").is_none());
    }
}
