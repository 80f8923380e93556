//! Transport bridge: adapts physical connections to the tunnel abstraction.
//!
//! The two bindings — WebSocket ([`ws`]) and HTTP long-poll ([`http`]) —
//! share this core:
//!
//! - [`establish`] resolves the first inbound instruction (`connect,...;` or
//!   `resume,<uuid>;`) into an [`ActiveTunnel`] through the request service.
//! - [`InboundFilter`] frames inbound payload bytes and intercepts reserved
//!   internal opcodes: `.ping` is answered directly on the transport, `.nop`
//!   is dropped, everything else is forwarded to the tunnel writer.
//! - [`output_pump`] reads backend-driven instructions from the tunnel and
//!   batches them into transport frames: flushed when no more data is
//!   immediately available or the batch reaches the configured byte
//!   threshold.
//!
//! All sends to one physical connection funnel through a single mpsc channel
//! drained by one sink task (or, for long-poll, the read endpoint), so the
//! pump and the keepalive responder can never interleave a frame.

pub mod http;
pub mod ws;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{GatewayError, Result};
use crate::protocol::{ControlOp, Instruction, InstructionDecoder, OP_NOP, OP_PING, OP_SESSION};
use crate::service::{ActiveTunnel, DisplayRequest};
use crate::state::AppState;
use crate::tunnel::Tunnel;

/// One frame queued for delivery to a physical transport connection.
#[derive(Debug)]
pub enum OutboundFrame {
    /// Batched instruction text.
    Text(String),
    /// Terminal frame: close the transport with this outcome (`None` for a
    /// clean end-of-stream).
    Close(Option<GatewayError>),
}

/// The announce instruction telling the frontend which session it holds.
pub fn announce(session_id: uuid::Uuid) -> Instruction {
    Instruction::new(OP_SESSION, vec![session_id.to_string()])
}

/// Resolve the first inbound instruction of a fresh transport.
///
/// `connect,<target>[,<width>,<height>,<dpi>];` opens a new session;
/// `resume,<uuid>;` re-attaches an existing one. Anything else is a protocol
/// error: a transport carries no session until one of these succeeds.
pub async fn establish(
    state: &AppState,
    token: &str,
    first: &Instruction,
) -> Result<Arc<ActiveTunnel>> {
    match ControlOp::parse(first)? {
        ControlOp::Connect => {
            let target = first
                .arg(0)
                .ok_or_else(|| GatewayError::Protocol("connect: missing target id".into()))?;
            let display = DisplayRequest {
                width: numeric_arg(first, 1)?,
                height: numeric_arg(first, 2)?,
                dpi: numeric_arg(first, 3)?,
            };
            state.service.connect(token, target, display).await
        }
        ControlOp::Resume { id } => state.service.resume(token, id).await,
        _ => Err(GatewayError::Protocol(format!(
            "expected connect or resume, got {}",
            first.opcode()
        ))),
    }
}

/// Optional numeric argument: absent is fine, non-numeric is a client fault.
fn numeric_arg(ins: &Instruction, index: usize) -> Result<Option<u32>> {
    match ins.arg(index) {
        None => Ok(None),
        Some(raw) => raw.parse::<u32>().map(Some).map_err(|_| {
            GatewayError::Protocol(format!("{}: non-numeric arg {raw:?}", ins.opcode()))
        }),
    }
}

/// What the inbound filter produced for one framed instruction.
#[derive(Debug, PartialEq, Eq)]
pub enum InboundEvent {
    /// Protocol data for the tunnel writer.
    Forward(Instruction),
    /// Internal instruction to answer directly on the transport.
    Reply(Instruction),
}

/// Per-connection framing plus the reserved-opcode intercept.
///
/// Internal opcodes never reach the backend: `.ping` is echoed back verbatim
/// as a [`InboundEvent::Reply`], `.nop` and unknown `.`-opcodes are dropped.
#[derive(Default)]
pub struct InboundFilter {
    decoder: InstructionDecoder,
}

impl InboundFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, payload: &[u8]) {
        self.decoder.push(payload);
    }

    /// Next filtered event, `Ok(None)` when the buffered payload holds no
    /// further complete instruction.
    pub fn poll(&mut self) -> Result<Option<InboundEvent>> {
        loop {
            let Some(ins) = self.decoder.poll()? else {
                return Ok(None);
            };
            match ins.opcode() {
                OP_PING => return Ok(Some(InboundEvent::Reply(ins))),
                OP_NOP => continue,
                op if ins.is_internal() => {
                    debug!(opcode = %op, "unknown internal opcode dropped");
                    continue;
                }
                _ => return Ok(Some(InboundEvent::Forward(ins))),
            }
        }
    }
}

/// Drive one transport's outbound direction: tunnel reader → batched frames.
///
/// Runs until the tunnel ends, then records the outcome on the [`ActiveTunnel`]
/// and emits the terminal [`OutboundFrame::Close`]. Backend EOF maps to a
/// success close; everything else carries its own status.
pub async fn output_pump(
    active: Arc<ActiveTunnel>,
    batch_bytes: usize,
    out_tx: mpsc::Sender<OutboundFrame>,
) {
    let result = pump_batches(active.tunnel(), batch_bytes, &out_tx).await;
    let error = match result {
        Ok(()) => None,
        Err(e) => Some(e),
    };
    active.close(error.as_ref()).await;
    let _ = out_tx.send(OutboundFrame::Close(error)).await;
}

async fn pump_batches(
    tunnel: &Arc<Tunnel>,
    batch_bytes: usize,
    out_tx: &mpsc::Sender<OutboundFrame>,
) -> Result<()> {
    let mut reader = tunnel.acquire_reader().await;
    let mut batch = String::new();
    loop {
        // Block for the next instruction; the batch is always empty here —
        // buffered output is flushed before the pump blocks again.
        let Some(ins) = reader.next().await? else {
            return Ok(());
        };
        ins.encode_into(&mut batch);

        // Batch whatever else is immediately available, flushing at the
        // size threshold so one frame stays bounded.
        loop {
            if batch.len() >= batch_bytes {
                flush(&mut batch, out_tx).await?;
            }
            match reader.try_next()? {
                Some(more) => more.encode_into(&mut batch),
                None => break,
            }
        }
        flush(&mut batch, out_tx).await?;
    }
}

async fn flush(batch: &mut String, out_tx: &mpsc::Sender<OutboundFrame>) -> Result<()> {
    if batch.is_empty() {
        return Ok(());
    }
    out_tx
        .send(OutboundFrame::Text(std::mem::take(batch)))
        .await
        .map_err(|_| GatewayError::Closed)
}


#[cfg(test)]
mod tests {
    use super::testing::{state_with_fake_guacd, TOKEN};
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_filter_answers_ping_directly() {
        let mut filter = InboundFilter::new();
        filter.push(b".ping,12345;");
        let event = filter.poll().unwrap().unwrap();
        let InboundEvent::Reply(ins) = event else {
            panic!("ping must be a reply, not a forward");
        };
        assert_eq!(ins.opcode(), OP_PING);
        assert_eq!(ins.args(), &["12345"]);
    }

    #[test]
    fn test_filter_drops_nop_and_unknown_internal() {
        let mut filter = InboundFilter::new();
        filter.push(b".nop;.future,1;mouse,1,2,0;");
        let event = filter.poll().unwrap().unwrap();
        assert!(matches!(
            event,
            InboundEvent::Forward(ref ins) if ins.opcode() == "mouse"
        ));
        assert!(filter.poll().unwrap().is_none());
    }

    #[test]
    fn test_filter_frames_across_partial_pushes() {
        let mut filter = InboundFilter::new();
        filter.push(b"key,65");
        assert!(filter.poll().unwrap().is_none());
        filter.push(b"307,1;");
        let event = filter.poll().unwrap().unwrap();
        assert!(matches!(
            event,
            InboundEvent::Forward(ref ins) if ins.opcode() == "key"
        ));
    }

    #[tokio::test]
    async fn test_establish_rejects_non_session_opcode() {
        let state = state_with_fake_guacd().await;
        let err = establish(&state, TOKEN, &Instruction::bare("mouse"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_establish_connect_and_resume() {
        let state = state_with_fake_guacd().await;
        let connect = Instruction::new("connect", vec!["dev".into()]);
        let first = establish(&state, TOKEN, &connect).await.unwrap();
        let id = first.session_id();

        let resume = Instruction::new("resume", vec![id.to_string()]);
        let second = establish(&state, TOKEN, &resume).await.unwrap();
        assert_eq!(second.session_id(), id);
    }

    #[tokio::test]
    async fn test_establish_resume_unknown_id_is_not_found() {
        let state = state_with_fake_guacd().await;
        let resume = Instruction::new("resume", vec![Uuid::new_v4().to_string()]);
        let err = establish(&state, TOKEN, &resume).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_pump_flushes_before_blocking() {
        // Drive the batcher over a bare pair: what the session end writes
        // must come out as frames without anything else prompting a flush.
        let (transport_end, session_end) = crate::tunnel::Tunnel::pair(16);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let pump =
            tokio::spawn(async move { pump_batches(&transport_end, 8192, &out_tx).await });

        {
            let mut writer = session_end.acquire_writer().await;
            writer.send(&Instruction::bare("sync")).await.unwrap();
            writer
                .send(&Instruction::new("png", vec!["0".into()]))
                .await
                .unwrap();
        }
        let mut delivered = String::new();
        while !delivered.contains("png,0;") {
            match tokio::time::timeout(Duration::from_secs(1), out_rx.recv()).await {
                Ok(Some(OutboundFrame::Text(text))) => delivered.push_str(&text),
                other => panic!("pump stalled: {other:?}"),
            }
        }
        assert!(delivered.starts_with("sync;"));
        session_end.close();
        let _ = pump.await;
    }

    #[tokio::test]
    async fn test_pump_reports_clean_close() {
        let state = state_with_fake_guacd().await;
        let connect = Instruction::new("connect", vec!["dev".into()]);
        let active = establish(&state, TOKEN, &connect).await.unwrap();

        let (out_tx, mut out_rx) = mpsc::channel(16);
        let pump = tokio::spawn(output_pump(Arc::clone(&active), 8192, out_tx));

        active.tunnel().close();
        let frame = tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                match out_rx.recv().await {
                    Some(OutboundFrame::Close(outcome)) => return outcome,
                    Some(OutboundFrame::Text(_)) => {}
                    None => panic!("pump dropped without a close frame"),
                }
            }
        })
        .await
        .unwrap();
        assert!(frame.is_none(), "tunnel close is a success, got {frame:?}");
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_respects_batch_threshold() {
        // A bare pair again: many small instructions against a tiny
        // threshold produce multiple frames rather than one giant one.
        let (transport_end, session_end) = crate::tunnel::Tunnel::pair(64);
        {
            let mut writer = session_end.acquire_writer().await;
            for i in 0..32 {
                writer
                    .send(&Instruction::new("arc", vec![i.to_string()]))
                    .await
                    .unwrap();
            }
        }
        // Give the channel a moment to make everything immediately available.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (out_tx, mut out_rx) = mpsc::channel(64);
        let pump =
            tokio::spawn(async move { pump_batches(&transport_end, 16, &out_tx).await });

        let mut frames = Vec::new();
        let mut total = String::new();
        while !total.contains("arc,31;") {
            match tokio::time::timeout(Duration::from_secs(1), out_rx.recv()).await {
                Ok(Some(OutboundFrame::Text(text))) => {
                    total.push_str(&text);
                    frames.push(text);
                }
                other => panic!("pump stalled: {other:?}"),
            }
        }
        assert!(frames.len() > 1, "threshold never forced a flush");
        session_end.close();
        let _ = pump.await;
    }
}
