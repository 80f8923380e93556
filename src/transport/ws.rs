//! WebSocket transport binding.
//!
//! One bidirectional connection per tunnel. The token is validated before
//! the upgrade completes; the first text frame must carry the `connect` or
//! `resume` instruction. Outgoing traffic is funneled through an mpsc channel
//! consumed by a single sink task, so the output pump and the keepalive
//! responder never interleave a frame; the terminal [`OutboundFrame::Close`]
//! becomes a WebSocket close frame with the mapped status code.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::service::ActiveTunnel;
use crate::state::AppState;
use crate::tunnel::TunnelWriter;

use super::{announce, establish, output_pump, InboundEvent, InboundFilter, OutboundFrame};

/// Query parameters for the WebSocket upgrade request.
#[derive(Deserialize)]
pub struct WsQuery {
    /// API key passed as a query parameter (browsers cannot set headers on a
    /// WebSocket upgrade).
    pub token: String,
}

/// `GET /tunnel/ws?token=<key>` — WebSocket upgrade handler.
///
/// Validates the token before upgrading. Returns `403 Forbidden` on auth
/// failure.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if state.auth.validate(&query.token).await.is_err() {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    ws.on_upgrade(move |socket| handle_ws(socket, state, query.token))
}

/// Per-connection state once `connect`/`resume` has succeeded.
struct Bound {
    active: Arc<ActiveTunnel>,
    /// Writer guard held for the connection's lifetime — this transport is
    /// the sole inbound producer for its tunnel end.
    writer: TunnelWriter,
}

async fn handle_ws(socket: WebSocket, state: AppState, token: String) {
    let (mut ws_sink, mut ws_stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<OutboundFrame>(64);

    // Sink task: the only writer to the socket. Dies on the terminal close
    // frame or when the client goes away.
    let send_task = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            match frame {
                OutboundFrame::Text(text) => {
                    if ws_sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                OutboundFrame::Close(outcome) => {
                    let error = outcome.unwrap_or(GatewayError::Closed);
                    let _ = ws_sink
                        .send(Message::Close(Some(CloseFrame {
                            code: error.ws_close_code(),
                            reason: error.code().into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut filter = InboundFilter::new();
    let mut bound: Option<Bound> = None;

    let outcome: Result<()> = loop {
        let Some(Ok(msg)) = ws_stream.next().await else {
            break Ok(());
        };
        let payload = match msg {
            Message::Text(text) => text,
            Message::Close(_) => break Ok(()),
            // Control frames are handled by the WS layer itself.
            _ => continue,
        };
        filter.push(payload.as_bytes());

        let drained = drain_inbound(&state, &token, &mut filter, &mut bound, &out_tx).await;
        if let Err(e) = drained {
            break Err(e);
        }
    };

    match outcome {
        Ok(()) => {
            // Client went away (or the pump already closed the socket).
            if let Some(b) = &bound {
                b.active.close(None).await;
            }
            debug!("websocket transport ended");
        }
        Err(e) => {
            if let Some(b) = &bound {
                b.active.close(Some(&e)).await;
            } else {
                warn!("websocket rejected before session bind: {e}");
            }
            let _ = out_tx.send(OutboundFrame::Close(Some(e))).await;
        }
    }

    // The sink task drains the close frame on its own; anything beyond that
    // has nowhere to go.
    drop(out_tx);
    let _ = send_task.await;
}

/// Process every instruction currently framed by the filter. The first
/// forwarded instruction binds the connection to a session; later ones go to
/// the tunnel writer.
async fn drain_inbound(
    state: &AppState,
    token: &str,
    filter: &mut InboundFilter,
    bound: &mut Option<Bound>,
    out_tx: &mpsc::Sender<OutboundFrame>,
) -> Result<()> {
    while let Some(event) = filter.poll()? {
        match event {
            InboundEvent::Reply(ins) => {
                out_tx
                    .send(OutboundFrame::Text(ins.encode()))
                    .await
                    .map_err(|_| GatewayError::Closed)?;
            }
            InboundEvent::Forward(ins) => match bound {
                Some(b) => b.writer.send(&ins).await?,
                None => {
                    let active = establish(state, token, &ins).await?;
                    // Announce before the pump starts so the session id is
                    // the first thing on the stream. A dead sink at this
                    // point means the client is gone: release the session.
                    let announced = out_tx
                        .send(OutboundFrame::Text(announce(active.session_id()).encode()))
                        .await;
                    if announced.is_err() {
                        active.close(None).await;
                        return Err(GatewayError::Closed);
                    }
                    let writer = active.tunnel().acquire_writer().await;
                    tokio::spawn(output_pump(
                        Arc::clone(&active),
                        state.config.server.output_batch_bytes,
                        out_tx.clone(),
                    ));
                    *bound = Some(Bound { active, writer });
                }
            },
        }
    }
    Ok(())
}
