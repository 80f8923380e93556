//! Per-session message loop.
//!
//! One tokio task per live session. Each cycle:
//!
//! 1. Adopt attachment changes — if a resume swapped transports, close the
//!    stale one and take the new tunnel; if the session is paused, suspend
//!    on the attachment watch.
//! 2. Flush backend-driven output (the pump) to the current tunnel's writer.
//! 3. Wait — `tokio::select!` over teardown, attachment change, backend
//!    output ready, and the next inbound instruction — and dispatch inbound
//!    control instructions to the handler table.
//!
//! Termination is exactly-once on every path: free the handlers, close the
//! cached transport, remove the session from the registry.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};
use crate::protocol::{ControlOp, Instruction};
use crate::state::{GatewayEventKind, GatewayStats};
use crate::tunnel::Tunnel;

use super::handlers::SessionHandlers;
use super::session::Session;
use super::SessionRegistry;

/// What an inbound instruction asks the loop to do next.
enum LoopAction {
    Continue,
    Pause,
    Disconnect,
}

/// Spawn the message loop for a freshly registered session.
pub fn spawn(
    session: Arc<Session>,
    handlers: Box<dyn SessionHandlers>,
    registry: SessionRegistry,
    stats: Arc<GatewayStats>,
) -> JoinHandle<()> {
    tokio::spawn(run(session, handlers, registry, stats))
}

async fn run(
    session: Arc<Session>,
    mut handlers: Box<dyn SessionHandlers>,
    registry: SessionRegistry,
    stats: Arc<GatewayStats>,
) {
    let id = session.id();
    info!(session = %id, "session loop started");

    let (outcome, cached) = drive(&session, handlers.as_mut()).await;

    match &outcome {
        Ok(()) => debug!(session = %id, "session disconnected"),
        Err(e) if e.is_clean() => debug!(session = %id, "session closed: {e}"),
        Err(GatewayError::Protocol(detail)) => {
            warn!(session = %id, "session terminated by client fault: {detail}");
        }
        Err(e) => warn!(session = %id, "session terminated: {e}"),
    }

    // Teardown — this is the loop's only exit path, so each step runs once.
    handlers.free();
    if let Some(tunnel) = cached {
        tunnel.close();
    }
    let _ = registry.remove(id).await;

    stats.session_ended();
    stats
        .push_event(
            GatewayEventKind::SessionEnded,
            format!("session {id} after {}s", session.uptime().as_secs()),
        )
        .await;
}

/// Run the session until something terminal happens. Returns the outcome and
/// the transport the loop last held, for the caller to close.
async fn drive(
    session: &Session,
    handlers: &mut dyn SessionHandlers,
) -> (Result<()>, Option<Arc<Tunnel>>) {
    let mut attach_rx = session.watch_attachment();
    let mut teardown_rx = session.watch_teardown();
    let ready = handlers.output_ready();

    let (mut generation, mut cached) = {
        let att = attach_rx.borrow_and_update();
        (att.generation, att.tunnel.clone())
    };
    let mut attached = cached.is_some();

    loop {
        // 1) Adopt attachment changes.
        {
            let att = attach_rx.borrow_and_update();
            if att.generation != generation {
                generation = att.generation;
                match &att.tunnel {
                    Some(fresh) => {
                        if cached.as_ref().map(|c| c.id()) != Some(fresh.id()) {
                            if let Some(stale) = cached.take() {
                                debug!(
                                    session = %session.id(),
                                    stale = %stale.id(),
                                    fresh = %fresh.id(),
                                    "transport handoff"
                                );
                                stale.close();
                            }
                            cached = Some(Arc::clone(fresh));
                        }
                        attached = true;
                    }
                    None => attached = false,
                }
            }
        }

        if !attached {
            // Paused: keep all session state, wait for resume or teardown.
            tokio::select! {
                changed = attach_rx.changed() => {
                    if changed.is_err() {
                        return (Err(GatewayError::Internal("attachment gate dropped".into())), cached);
                    }
                    continue;
                }
                _ = teardown_rx.changed() => return (Ok(()), cached),
            }
        }
        let Some(tunnel) = cached.clone() else {
            attached = false;
            continue;
        };

        // 2) Flush backend output to the current transport.
        match handlers.pump() {
            Ok(batch) => {
                if !batch.is_empty() {
                    let mut writer = tunnel.acquire_writer().await;
                    for ins in &batch {
                        if let Err(e) = writer.send(ins).await {
                            return (Err(e), cached);
                        }
                    }
                }
            }
            Err(e) => return (Err(e), cached),
        }

        // 3) Wait for work and dispatch inbound instructions.
        let mut reader = tunnel.acquire_reader().await;
        loop {
            tokio::select! {
                biased;
                _ = teardown_rx.changed() => return (Ok(()), cached),
                changed = attach_rx.changed() => {
                    if changed.is_err() {
                        return (Err(GatewayError::Internal("attachment gate dropped".into())), cached);
                    }
                    break; // re-adopt at the top of the cycle
                }
                _ = ready.notified() => break, // pump at the top of the cycle
                next = reader.next() => match next {
                    Ok(Some(ins)) => match dispatch(session, handlers, &ins) {
                        Ok(LoopAction::Continue) => {}
                        Ok(LoopAction::Pause) => {
                            session.pause();
                            break; // stop reading this transport immediately
                        }
                        Ok(LoopAction::Disconnect) => return (Ok(()), cached),
                        Err(e) => return (Err(e), cached),
                    },
                    Ok(None) => return (Err(GatewayError::Closed), cached),
                    Err(e) => return (Err(e), cached),
                },
            }
        }
        // Reader guard drops here so the next cycle can re-acquire.
    }
}

fn dispatch(
    session: &Session,
    handlers: &mut dyn SessionHandlers,
    ins: &Instruction,
) -> Result<LoopAction> {
    match ControlOp::parse(ins)? {
        ControlOp::Mouse { x, y, mask } => {
            handlers.mouse(x, y, mask)?;
            Ok(LoopAction::Continue)
        }
        ControlOp::Key { keysym, pressed } => {
            handlers.key(keysym, pressed)?;
            Ok(LoopAction::Continue)
        }
        ControlOp::Clipboard => {
            handlers.clipboard(ins.arg(0).unwrap_or_default())?;
            Ok(LoopAction::Continue)
        }
        ControlOp::Pause => Ok(LoopAction::Pause),
        ControlOp::Disconnect => Ok(LoopAction::Disconnect),
        ControlOp::Connect => Err(GatewayError::Protocol(
            "connect on an established session".into(),
        )),
        ControlOp::Resume { .. } => Err(GatewayError::Protocol(
            "resume must arrive on a fresh transport".into(),
        )),
        // Internal opcodes are answered by the transport filter; anything
        // that slips through is dropped.
        ControlOp::Ping | ControlOp::Nop | ControlOp::Internal => {
            debug!(session = %session.id(), opcode = %ins.opcode(), "unfiltered internal opcode dropped");
            Ok(LoopAction::Continue)
        }
        ControlOp::Passthrough => {
            handlers.raw(ins)?;
            Ok(LoopAction::Continue)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Instruction;
    use crate::tunnel::Tunnel;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use uuid::Uuid;

    #[derive(Debug, PartialEq, Eq)]
    enum Event {
        Mouse(i32, i32, u32),
        Key(u32, bool),
        Clipboard(String),
        Raw(String),
    }

    /// Scripted handler table recording every dispatch.
    struct MockHandlers {
        events: Arc<StdMutex<Vec<Event>>>,
        output: Arc<StdMutex<Vec<Instruction>>>,
        ready: Arc<Notify>,
        free_calls: Arc<AtomicUsize>,
        fail_on_mouse: bool,
    }

    struct MockRemote {
        events: Arc<StdMutex<Vec<Event>>>,
        output: Arc<StdMutex<Vec<Instruction>>>,
        ready: Arc<Notify>,
        free_calls: Arc<AtomicUsize>,
    }

    impl MockRemote {
        fn feed_output(&self, ins: Instruction) {
            self.output.lock().unwrap().push(ins);
            self.ready.notify_one();
        }
        fn events(&self) -> Vec<String> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| format!("{e:?}"))
                .collect()
        }
    }

    fn mock(fail_on_mouse: bool) -> (MockHandlers, MockRemote) {
        let events = Arc::new(StdMutex::new(Vec::new()));
        let output = Arc::new(StdMutex::new(Vec::new()));
        let ready = Arc::new(Notify::new());
        let free_calls = Arc::new(AtomicUsize::new(0));
        (
            MockHandlers {
                events: Arc::clone(&events),
                output: Arc::clone(&output),
                ready: Arc::clone(&ready),
                free_calls: Arc::clone(&free_calls),
                fail_on_mouse,
            },
            MockRemote {
                events,
                output,
                ready,
                free_calls,
            },
        )
    }

    impl SessionHandlers for MockHandlers {
        fn mouse(&mut self, x: i32, y: i32, mask: u32) -> Result<()> {
            if self.fail_on_mouse {
                return Err(GatewayError::Internal("scripted failure".into()));
            }
            self.events.lock().unwrap().push(Event::Mouse(x, y, mask));
            Ok(())
        }
        fn key(&mut self, keysym: u32, pressed: bool) -> Result<()> {
            self.events.lock().unwrap().push(Event::Key(keysym, pressed));
            Ok(())
        }
        fn clipboard(&mut self, data: &str) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Clipboard(data.to_string()));
            Ok(())
        }
        fn raw(&mut self, ins: &Instruction) -> Result<()> {
            self.events
                .lock()
                .unwrap()
                .push(Event::Raw(ins.opcode().to_string()));
            Ok(())
        }
        fn pump(&mut self) -> Result<Vec<Instruction>> {
            Ok(self.output.lock().unwrap().drain(..).collect())
        }
        fn output_ready(&self) -> Arc<Notify> {
            Arc::clone(&self.ready)
        }
        fn free(&mut self) {
            self.free_calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        session: Arc<Session>,
        registry: SessionRegistry,
        transport: Arc<Tunnel>,
        remote: MockRemote,
        handle: JoinHandle<()>,
    }

    async fn start(fail_on_mouse: bool) -> Rig {
        let (transport, session_end) = Tunnel::pair(32);
        let session = Session::new(Uuid::new_v4(), session_end);
        let registry = SessionRegistry::new();
        registry.put(Arc::clone(&session)).await.unwrap();
        let (handlers, remote) = mock(fail_on_mouse);
        let stats = Arc::new(GatewayStats::new());
        let handle = spawn(
            Arc::clone(&session),
            Box::new(handlers),
            registry.clone(),
            stats,
        );
        Rig {
            session,
            registry,
            transport,
            remote,
            handle,
        }
    }

    async fn send(transport: &Arc<Tunnel>, ins: Instruction) {
        transport.acquire_writer().await.send(&ins).await.unwrap();
    }

    #[tokio::test]
    async fn test_mouse_dispatch_converts_args() {
        let rig = start(false).await;
        send(
            &rig.transport,
            Instruction::new("mouse", vec!["10".into(), "20".into(), "1".into()]),
        )
        .await;
        send(&rig.transport, Instruction::bare("disconnect")).await;
        tokio::time::timeout(Duration::from_secs(1), rig.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rig.remote.events(), vec!["Mouse(10, 20, 1)"]);
    }

    #[tokio::test]
    async fn test_disconnect_removes_session_once() {
        let rig = start(false).await;
        let id = rig.session.id();
        send(&rig.transport, Instruction::bare("disconnect")).await;
        tokio::time::timeout(Duration::from_secs(1), rig.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rig.registry.get(id).await.is_none());
        assert_eq!(rig.remote.free_calls.load(Ordering::SeqCst), 1);
        assert!(rig.transport.is_closed());
    }

    #[tokio::test]
    async fn test_fatal_handler_error_frees_exactly_once() {
        let rig = start(true).await;
        let id = rig.session.id();
        send(
            &rig.transport,
            Instruction::new("mouse", vec!["1".into(), "2".into(), "0".into()]),
        )
        .await;
        tokio::time::timeout(Duration::from_secs(1), rig.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rig.remote.free_calls.load(Ordering::SeqCst), 1);
        assert!(rig.registry.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_instruction_is_fatal() {
        let rig = start(false).await;
        send(
            &rig.transport,
            Instruction::new("mouse", vec!["ten".into(), "20".into(), "1".into()]),
        )
        .await;
        tokio::time::timeout(Duration::from_secs(1), rig.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rig.remote.free_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_backend_output_flushes_to_transport() {
        let rig = start(false).await;
        rig.remote.feed_output(Instruction::bare("sync"));
        let got = tokio::time::timeout(Duration::from_secs(1), async {
            rig.transport.acquire_reader().await.next().await
        })
        .await
        .unwrap()
        .unwrap()
        .unwrap();
        assert_eq!(got.opcode(), "sync");
        rig.session.shutdown();
        let _ = rig.handle.await;
    }

    #[tokio::test]
    async fn test_pause_resume_keeps_identity_and_closes_old_transport() {
        let rig = start(false).await;
        let id = rig.session.id();

        send(
            &rig.transport,
            Instruction::new("key", vec!["97".into(), "1".into()]),
        )
        .await;
        send(&rig.transport, Instruction::bare("pause")).await;

        // Wait until the gate is released.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while rig.session.is_attached() {
            assert!(tokio::time::Instant::now() < deadline, "pause never landed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Resume on a fresh transport, as a new physical connection would.
        let resumed = rig.registry.get(id).await.expect("session still registered");
        assert_eq!(resumed.id(), id, "resume must not allocate a new session");
        let (new_transport, new_session_end) = Tunnel::pair(32);
        resumed.resume(new_session_end);

        // Old transport is closed once the loop adopts the replacement.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while !rig.transport.is_closed() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "stale transport never closed"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Handler state carried across the handoff: dispatch on the new
        // transport lands in the same table.
        send(
            &new_transport,
            Instruction::new("key", vec!["97".into(), "0".into()]),
        )
        .await;
        send(&new_transport, Instruction::bare("disconnect")).await;
        tokio::time::timeout(Duration::from_secs(1), rig.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            rig.remote.events(),
            vec!["Key(97, true)", "Key(97, false)"]
        );
        assert_eq!(rig.remote.free_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_eof_terminates_session() {
        let rig = start(false).await;
        let id = rig.session.id();
        rig.transport.close();
        tokio::time::timeout(Duration::from_secs(1), rig.handle)
            .await
            .unwrap()
            .unwrap();
        assert!(rig.registry.get(id).await.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_while_paused_tears_down() {
        let rig = start(false).await;
        send(&rig.transport, Instruction::bare("pause")).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
        while rig.session.is_attached() {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        rig.session.shutdown();
        tokio::time::timeout(Duration::from_secs(1), rig.handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rig.remote.free_calls.load(Ordering::SeqCst), 1);
        assert!(rig.transport.is_closed());
    }
}
