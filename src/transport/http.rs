//! HTTP long-poll transport binding.
//!
//! For clients that cannot hold a WebSocket open. One logical tunnel maps to
//! a registered transport entry keyed by tunnel id, driven through paired
//! endpoints:
//!
//! - `POST /tunnel/http?token=…` — body carries the `connect`/`resume`
//!   instruction; responds with the new tunnel id. The `.session,<uuid>;`
//!   announce arrives as the first read payload, so the instruction stream
//!   looks identical to the WebSocket binding.
//! - `POST /tunnel/http/{id}/write?token=…` — appends inbound payload.
//! - `GET /tunnel/http/{id}/read?token=…` — long-polls the batched output;
//!   flushes `.nop;` on keepalive timeout so intermediaries don't cut the
//!   connection; reports the mapped terminal status once the tunnel ends.
//!
//! Entries that nobody polls within the configured TTL are swept and their
//! tunnels closed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{GatewayError, Result};
use crate::protocol::{Instruction, OP_NOP};
use crate::service::ActiveTunnel;
use crate::state::AppState;
use crate::tunnel::TunnelWriter;

use super::{announce, establish, output_pump, InboundEvent, InboundFilter, OutboundFrame};

/// Query parameters shared by the long-poll endpoints.
#[derive(Deserialize)]
pub struct HttpQuery {
    pub token: String,
}

/// Inbound half of one long-poll transport: framing state plus the held
/// tunnel writer, locked together so concurrent writes stay ordered.
struct Inbound {
    filter: InboundFilter,
    writer: TunnelWriter,
}

/// One registered long-poll transport.
struct HttpTransport {
    active: Arc<ActiveTunnel>,
    inbound: Mutex<Inbound>,
    /// Drained by the read endpoint; the lock keeps polls sequential.
    out_rx: Mutex<mpsc::Receiver<OutboundFrame>>,
    /// Sender for ping replies from the write endpoint.
    out_tx: mpsc::Sender<OutboundFrame>,
    /// Terminal outcome seen while draining, delivered on the next poll.
    pending_close: std::sync::Mutex<Option<Option<GatewayError>>>,
    last_activity: std::sync::Mutex<Instant>,
}

impl HttpTransport {
    fn touch(&self) {
        *self.last_activity.lock().expect("last_activity poisoned") = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("last_activity poisoned")
            .elapsed()
    }
}

/// What one long-poll read produced.
#[derive(Debug)]
pub enum ReadReply {
    /// Batched instruction text (possibly the `.nop;` keepalive).
    Data(String),
    /// The tunnel ended; the entry has been removed.
    Closed(Option<GatewayError>),
}

/// Registry of open long-poll transports, keyed by tunnel id.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone, Default)]
pub struct HttpTransports {
    inner: Arc<RwLock<HashMap<Uuid, Arc<HttpTransport>>>>,
}

impl HttpTransports {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Resolve an open request: establish the session, spawn the output
    /// pump, register the transport entry. Returns the tunnel id the client
    /// uses on the paired endpoints.
    pub async fn open(&self, state: &AppState, token: &str, payload: &str) -> Result<Uuid> {
        let mut filter = InboundFilter::new();
        filter.push(payload.as_bytes());
        let first = loop {
            match filter.poll()? {
                Some(InboundEvent::Forward(ins)) => break ins,
                Some(InboundEvent::Reply(_)) => continue, // nothing to answer yet
                None => {
                    return Err(GatewayError::Protocol(
                        "open request carries no complete instruction".into(),
                    ))
                }
            }
        };

        let active = establish(state, token, &first).await?;
        let tunnel_id = active.tunnel_id();
        let (out_tx, out_rx) = mpsc::channel::<OutboundFrame>(64);

        // The announce is the first thing any read returns.
        let _ = out_tx
            .send(OutboundFrame::Text(announce(active.session_id()).encode()))
            .await;

        let mut inbound = Inbound {
            filter,
            writer: active.tunnel().acquire_writer().await,
        };
        // Trailing instructions in the open body follow the usual path.
        if let Err(e) = Self::forward_events(&mut inbound, &out_tx).await {
            active.close(Some(&e)).await;
            return Err(e);
        }

        tokio::spawn(output_pump(
            Arc::clone(&active),
            state.config.server.output_batch_bytes,
            out_tx.clone(),
        ));

        let entry = Arc::new(HttpTransport {
            active,
            inbound: Mutex::new(inbound),
            out_rx: Mutex::new(out_rx),
            out_tx,
            pending_close: std::sync::Mutex::new(None),
            last_activity: std::sync::Mutex::new(Instant::now()),
        });
        self.inner.write().await.insert(tunnel_id, entry);
        debug!(tunnel = %tunnel_id, "long-poll transport opened");
        Ok(tunnel_id)
    }

    /// Append inbound payload to a transport.
    pub async fn write(&self, id: Uuid, payload: &str) -> Result<()> {
        let entry = self.get(id).await?;
        entry.touch();
        let mut inbound = entry.inbound.lock().await;
        inbound.filter.push(payload.as_bytes());
        let res = Self::forward_events(&mut inbound, &entry.out_tx).await;
        drop(inbound);
        if let Err(e) = &res {
            // Client faults kill the transport; a closed tunnel just means
            // the read side will report the terminal status shortly.
            if !matches!(e, GatewayError::Closed) {
                entry.active.close(Some(e)).await;
                self.inner.write().await.remove(&id);
            }
        }
        res
    }

    /// Long-poll the transport's batched output.
    pub async fn read(&self, id: Uuid, poll_timeout: Duration) -> Result<ReadReply> {
        let entry = self.get(id).await?;
        entry.touch();

        if let Some(outcome) = entry.pending_close.lock().expect("pending_close poisoned").take()
        {
            self.inner.write().await.remove(&id);
            return Ok(ReadReply::Closed(outcome));
        }

        let mut out_rx = entry.out_rx.lock().await;
        let first = match tokio::time::timeout(poll_timeout, out_rx.recv()).await {
            // Keepalive flush: give intermediaries a byte to keep the
            // connection warm.
            Err(_) => return Ok(ReadReply::Data(Instruction::bare(OP_NOP).encode())),
            Ok(None) => {
                drop(out_rx);
                self.inner.write().await.remove(&id);
                return Ok(ReadReply::Closed(None));
            }
            Ok(Some(frame)) => frame,
        };

        match first {
            OutboundFrame::Close(outcome) => {
                drop(out_rx);
                self.inner.write().await.remove(&id);
                Ok(ReadReply::Closed(outcome))
            }
            OutboundFrame::Text(mut body) => {
                // Drain whatever else is already queued into this response.
                loop {
                    match out_rx.try_recv() {
                        Ok(OutboundFrame::Text(more)) => body.push_str(&more),
                        Ok(OutboundFrame::Close(outcome)) => {
                            *entry.pending_close.lock().expect("pending_close poisoned") =
                                Some(outcome);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                Ok(ReadReply::Data(body))
            }
        }
    }

    /// Close and remove every transport idle past `ttl`. Returns the number
    /// evicted.
    pub async fn sweep(&self, ttl: Duration) -> usize {
        let expired: Vec<(Uuid, Arc<HttpTransport>)> = {
            let inner = self.inner.read().await;
            inner
                .iter()
                .filter(|(_, t)| t.idle_for() > ttl)
                .map(|(id, t)| (*id, Arc::clone(t)))
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }
        let mut inner = self.inner.write().await;
        let mut evicted = 0;
        for (id, entry) in expired {
            entry.active.close(None).await;
            if inner.remove(&id).is_some() {
                evicted += 1;
            }
        }
        info!(count = evicted, "swept idle long-poll transports");
        evicted
    }

    async fn get(&self, id: Uuid) -> Result<Arc<HttpTransport>> {
        self.inner
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| GatewayError::NotFound(format!("transport {id}")))
    }

    async fn forward_events(
        inbound: &mut Inbound,
        out_tx: &mpsc::Sender<OutboundFrame>,
    ) -> Result<()> {
        while let Some(event) = inbound.filter.poll()? {
            match event {
                InboundEvent::Reply(ins) => {
                    let _ = out_tx.send(OutboundFrame::Text(ins.encode())).await;
                }
                InboundEvent::Forward(ins) => inbound.writer.send(&ins).await?,
            }
        }
        Ok(())
    }
}

// ─── Axum handlers ───────────────────────────────────────────────────────────

/// `POST /tunnel/http?token=<key>` — open a long-poll transport.
pub async fn open(
    State(state): State<AppState>,
    Query(query): Query<HttpQuery>,
    body: String,
) -> Response {
    match state
        .http_transports
        .open(&state, &query.token, &body)
        .await
    {
        Ok(tunnel_id) => (StatusCode::OK, tunnel_id.to_string()).into_response(),
        Err(e) => error_response(&e),
    }
}

/// `POST /tunnel/http/{id}/write?token=<key>` — append inbound payload.
pub async fn write(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HttpQuery>,
    body: String,
) -> Response {
    if let Err(e) = state.auth.validate(&query.token).await {
        return error_response(&e);
    }
    match state.http_transports.write(id, &body).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// `GET /tunnel/http/{id}/read?token=<key>` — long-poll batched output.
pub async fn read(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<HttpQuery>,
) -> Response {
    if let Err(e) = state.auth.validate(&query.token).await {
        return error_response(&e);
    }
    let poll_timeout = Duration::from_millis(state.config.server.http_poll_timeout_ms);
    match state.http_transports.read(id, poll_timeout).await {
        Ok(ReadReply::Data(body)) => (StatusCode::OK, body).into_response(),
        Ok(ReadReply::Closed(None)) => StatusCode::NO_CONTENT.into_response(),
        Ok(ReadReply::Closed(Some(e))) => error_response(&e),
        Err(e) => error_response(&e),
    }
}

fn error_response(e: &GatewayError) -> Response {
    (e.http_status(), e.code().to_string()).into_response()
}
