//! Backend daemon connector.
//!
//! The gateway does not speak VNC/RDP itself — it hands the native protocol
//! work to a guacd-style daemon over TCP and exchanges instructions with it.
//! [`GuacdBackend::connect`] yields a socket-backed [`Tunnel`] after a short
//! handshake announcing the requested protocol and display geometry.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::protocol::Instruction;

use super::Tunnel;
use std::sync::Arc;

/// What the connecting client asked for, resolved from the configured target.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// Native protocol the daemon should drive (`vnc`, `rdp`, ...).
    pub protocol: String,
    /// Remote host the daemon should connect to.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Extra protocol parameters, sorted for a deterministic wire order.
    pub params: Vec<(String, String)>,
    /// Requested display width in pixels.
    pub width: u32,
    /// Requested display height in pixels.
    pub height: u32,
    /// Requested display resolution in DPI.
    pub dpi: u32,
}

/// Connector for the backend daemon listening on a fixed address.
#[derive(Debug, Clone)]
pub struct GuacdBackend {
    addr: String,
    connect_timeout: Duration,
}

impl GuacdBackend {
    pub fn new(addr: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            connect_timeout,
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Open a connection to the daemon and perform the connect handshake.
    ///
    /// Failures surface as [`GatewayError::Unavailable`] — the daemon being
    /// down is an operational condition, not an internal bug.
    pub async fn connect(&self, info: &ClientInfo) -> Result<Arc<Tunnel>> {
        let stream = timeout(self.connect_timeout, TcpStream::connect(&self.addr))
            .await
            .map_err(|_| {
                GatewayError::Unavailable(format!(
                    "backend {} did not answer within {:?}",
                    self.addr, self.connect_timeout
                ))
            })?
            .map_err(|e| GatewayError::Unavailable(format!("backend {}: {e}", self.addr)))?;

        // Instruction traffic is small and latency-sensitive.
        stream
            .set_nodelay(true)
            .map_err(|e| GatewayError::Internal(format!("set_nodelay: {e}")))?;

        let tunnel = Tunnel::from_stream(stream);
        debug!(tunnel = %tunnel.id(), backend = %self.addr, "backend socket established");

        {
            let mut writer = tunnel.acquire_writer().await;
            writer
                .send(&Instruction::new("select", vec![info.protocol.clone()]))
                .await?;
            writer
                .send(&Instruction::new(
                    "size",
                    vec![
                        info.width.to_string(),
                        info.height.to_string(),
                        info.dpi.to_string(),
                    ],
                ))
                .await?;
            let mut args = vec![info.host.clone(), info.port.to_string()];
            args.extend(info.params.iter().map(|(k, v)| format!("{k}={v}")));
            writer.send(&Instruction::new("connect", args)).await?;
        }

        tunnel.mark_open();
        info!(
            tunnel = %tunnel.id(),
            protocol = %info.protocol,
            "backend connection ready"
        );
        Ok(tunnel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::InstructionDecoder;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_connect_performs_handshake() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut decoder = InstructionDecoder::new();
            let mut seen = Vec::new();
            let mut chunk = [0u8; 1024];
            while seen.len() < 3 {
                let n = sock.read(&mut chunk).await.unwrap();
                decoder.push(&chunk[..n]);
                while let Some(ins) = decoder.poll().unwrap() {
                    seen.push(ins);
                }
            }
            seen
        });

        let backend = GuacdBackend::new(addr.to_string(), Duration::from_secs(2));
        let info = ClientInfo {
            protocol: "vnc".into(),
            host: "10.0.0.9".into(),
            port: 5901,
            params: vec![("password".into(), "secret".into())],
            width: 1024,
            height: 768,
            dpi: 96,
        };
        let tunnel = backend.connect(&info).await.unwrap();
        assert_eq!(tunnel.state(), super::super::TunnelState::Open);

        let seen = accept.await.unwrap();
        assert_eq!(seen[0].opcode(), "select");
        assert_eq!(seen[0].args(), &["vnc"]);
        assert_eq!(seen[1].opcode(), "size");
        assert_eq!(seen[2].opcode(), "connect");
        assert_eq!(seen[2].args()[0], "10.0.0.9");
        assert_eq!(seen[2].args()[2], "password=secret");
    }

    #[tokio::test]
    async fn test_connect_refused_is_unavailable() {
        // Port 1 on localhost is essentially never listening.
        let backend = GuacdBackend::new("127.0.0.1:1", Duration::from_secs(1));
        let info = ClientInfo {
            protocol: "vnc".into(),
            host: "h".into(),
            port: 1,
            params: Vec::new(),
            width: 800,
            height: 600,
            dpi: 96,
        };
        let err = backend.connect(&info).await.unwrap_err();
        assert!(matches!(err, GatewayError::Unavailable(_)));
    }
}
