//! Session handler table and the default backend-driven implementation.
//!
//! The message loop never touches the backend directly — it dispatches typed
//! events into a [`SessionHandlers`] table and drains backend output through
//! [`SessionHandlers::pump`]. [`BackendHandlers`] is the production table: it
//! owns the backend tunnel, feeding it through a writer task and collecting
//! its output through a reader task into a bounded ring, with a `Notify` so
//! the loop wakes the moment backend output is ready.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{GatewayError, Result};
use crate::protocol::Instruction;
use crate::tunnel::Tunnel;

/// Per-session handler table. Methods are synchronous; implementations that
/// talk to slow backends do so through their own queues and tasks.
///
/// Any `Err` returned here is fatal for the session: the loop logs it,
/// invokes [`free`](Self::free), and tears the session down.
pub trait SessionHandlers: Send {
    /// Pointer motion/button event.
    fn mouse(&mut self, x: i32, y: i32, mask: u32) -> Result<()>;
    /// Key press or release.
    fn key(&mut self, keysym: u32, pressed: bool) -> Result<()>;
    /// Clipboard contents from the client.
    fn clipboard(&mut self, data: &str) -> Result<()>;
    /// Opaque protocol-data instruction forwarded without interpretation.
    fn raw(&mut self, ins: &Instruction) -> Result<()>;
    /// Drain backend-driven output accumulated since the last call. An empty
    /// vec means nothing to flush this cycle.
    fn pump(&mut self) -> Result<Vec<Instruction>>;
    /// Wake signal fired whenever new backend output becomes available.
    fn output_ready(&self) -> Arc<Notify>;
    /// Release backend resources. Idempotent; called exactly once by the
    /// message loop's teardown.
    fn free(&mut self);
}

/// Bounded queue of backend output. When full, the oldest instructions are
/// evicted — the backend resynchronizes the display on its own.
struct OutputRing {
    entries: VecDeque<Instruction>,
    max_entries: usize,
    dropped: u64,
    /// Set once the backend stream ends; returned by `pump` after the ring
    /// drains so close-ordering is preserved.
    terminal: Option<GatewayError>,
}

impl OutputRing {
    fn push(&mut self, ins: Instruction) {
        if self.entries.len() >= self.max_entries {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(ins);
    }
}

/// Production handler table driving a guacd-style backend tunnel.
pub struct BackendHandlers {
    input_tx: Option<mpsc::Sender<Instruction>>,
    ring: Arc<Mutex<OutputRing>>,
    ready: Arc<Notify>,
    backend: Arc<Tunnel>,
    tasks: Vec<JoinHandle<()>>,
}

impl BackendHandlers {
    /// Wire up a backend tunnel: spawns the input writer task and the output
    /// reader task.
    pub fn spawn(backend: Arc<Tunnel>, input_depth: usize, output_max: usize) -> Self {
        let (input_tx, mut input_rx) = mpsc::channel::<Instruction>(input_depth);
        let ring = Arc::new(Mutex::new(OutputRing {
            entries: VecDeque::with_capacity(output_max.min(256)),
            max_entries: output_max,
            dropped: 0,
            terminal: None,
        }));
        let ready = Arc::new(Notify::new());

        // Input writer: session events → backend socket. Holds the writer
        // acquisition for its lifetime, serializing all backend writes.
        let writer_tunnel = Arc::clone(&backend);
        let writer_task = tokio::spawn(async move {
            let mut writer = writer_tunnel.acquire_writer().await;
            while let Some(ins) = input_rx.recv().await {
                if let Err(e) = writer.send(&ins).await {
                    debug!(tunnel = %writer_tunnel.id(), "backend input stopped: {e}");
                    break;
                }
            }
        });

        // Output reader: backend socket → ring + notify.
        let reader_tunnel = Arc::clone(&backend);
        let reader_ring = Arc::clone(&ring);
        let reader_ready = Arc::clone(&ready);
        let reader_task = tokio::spawn(async move {
            let mut reader = reader_tunnel.acquire_reader().await;
            let terminal = loop {
                match reader.next().await {
                    Ok(Some(ins)) => {
                        reader_ring.lock().expect("output ring poisoned").push(ins);
                        reader_ready.notify_one();
                    }
                    Ok(None) => break GatewayError::Closed,
                    Err(e) => break e,
                }
            };
            debug!(tunnel = %reader_tunnel.id(), "backend output ended: {terminal}");
            reader_ring.lock().expect("output ring poisoned").terminal = Some(terminal);
            reader_ready.notify_one();
        });

        Self {
            input_tx: Some(input_tx),
            ring,
            ready,
            backend,
            tasks: vec![writer_task, reader_task],
        }
    }

    fn send(&self, ins: Instruction) -> Result<()> {
        let tx = self.input_tx.as_ref().ok_or(GatewayError::Closed)?;
        tx.try_send(ins).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                GatewayError::Internal("backend input queue full".into())
            }
            mpsc::error::TrySendError::Closed(_) => GatewayError::Closed,
        })
    }
}

impl SessionHandlers for BackendHandlers {
    fn mouse(&mut self, x: i32, y: i32, mask: u32) -> Result<()> {
        self.send(Instruction::new(
            "mouse",
            vec![x.to_string(), y.to_string(), mask.to_string()],
        ))
    }

    fn key(&mut self, keysym: u32, pressed: bool) -> Result<()> {
        self.send(Instruction::new(
            "key",
            vec![keysym.to_string(), u32::from(pressed).to_string()],
        ))
    }

    fn clipboard(&mut self, data: &str) -> Result<()> {
        self.send(Instruction::new("clipboard", vec![data.to_string()]))
    }

    fn raw(&mut self, ins: &Instruction) -> Result<()> {
        self.send(ins.clone())
    }

    fn pump(&mut self) -> Result<Vec<Instruction>> {
        let mut ring = self.ring.lock().expect("output ring poisoned");
        if ring.dropped > 0 {
            warn!(
                tunnel = %self.backend.id(),
                dropped = ring.dropped,
                "backend output overflowed while detached"
            );
            ring.dropped = 0;
        }
        let drained: Vec<Instruction> = ring.entries.drain(..).collect();
        if drained.is_empty() {
            if let Some(terminal) = ring.terminal.take() {
                return Err(terminal);
            }
        }
        Ok(drained)
    }

    fn output_ready(&self) -> Arc<Notify> {
        Arc::clone(&self.ready)
    }

    fn free(&mut self) {
        if self.input_tx.take().is_none() {
            return; // already freed
        }
        self.backend.close();
        for task in &self.tasks {
            task.abort();
        }
        debug!(tunnel = %self.backend.id(), "backend released");
    }
}

impl Drop for BackendHandlers {
    fn drop(&mut self) {
        self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Drive a `BackendHandlers` against the far end of an in-process pair
    /// standing in for the backend socket.
    async fn rig() -> (BackendHandlers, Arc<Tunnel>) {
        let (far_end, backend_end) = Tunnel::pair(32);
        let handlers = BackendHandlers::spawn(backend_end, 32, 64);
        (handlers, far_end)
    }

    #[tokio::test]
    async fn test_mouse_event_reaches_backend() {
        let (mut handlers, far) = rig().await;
        handlers.mouse(10, 20, 1).unwrap();
        let got = far.acquire_reader().await.next().await.unwrap().unwrap();
        assert_eq!(got.opcode(), "mouse");
        assert_eq!(got.args(), &["10", "20", "1"]);
    }

    #[tokio::test]
    async fn test_key_encodes_pressed_flag() {
        let (mut handlers, far) = rig().await;
        handlers.key(65307, true).unwrap();
        handlers.key(65307, false).unwrap();
        let mut reader = far.acquire_reader().await;
        assert_eq!(reader.next().await.unwrap().unwrap().args(), &["65307", "1"]);
        assert_eq!(reader.next().await.unwrap().unwrap().args(), &["65307", "0"]);
    }

    #[tokio::test]
    async fn test_pump_drains_backend_output() {
        let (mut handlers, far) = rig().await;
        let ready = handlers.output_ready();
        {
            let mut w = far.acquire_writer().await;
            w.send(&Instruction::bare("sync")).await.unwrap();
            w.send(&Instruction::new("png", vec!["0".into()])).await.unwrap();
        }
        ready.notified().await;
        // Both instructions may not have landed yet; poll briefly.
        let mut drained = Vec::new();
        for _ in 0..50 {
            drained.extend(handlers.pump().unwrap());
            if drained.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].opcode(), "sync");
    }

    #[tokio::test]
    async fn test_pump_reports_backend_eof_after_drain() {
        let (mut handlers, far) = rig().await;
        {
            let mut w = far.acquire_writer().await;
            w.send(&Instruction::bare("sync")).await.unwrap();
        }
        far.close();
        // Wait for the reader task to record the close.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        loop {
            match handlers.pump() {
                Ok(batch) if !batch.is_empty() => {} // drained the sync first
                Ok(_) => {
                    if tokio::time::Instant::now() >= deadline {
                        panic!("backend EOF never surfaced");
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Err(GatewayError::Closed) => break,
                Err(e) => panic!("unexpected terminal: {e}"),
            }
        }
    }

    #[tokio::test]
    async fn test_free_closes_backend_and_is_idempotent() {
        let (mut handlers, far) = rig().await;
        handlers.free();
        handlers.free();
        assert!(far.is_closed());
        assert!(matches!(handlers.mouse(0, 0, 0), Err(GatewayError::Closed)));
    }
}
