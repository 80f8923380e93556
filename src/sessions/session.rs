//! Session state and the transport ownership gate.
//!
//! A [`Session`] is the gateway-side logical connection, identified by a
//! UUID that stays stable across transport handoffs. Which physical
//! transport currently carries the session is tracked by the attachment
//! gate: a `watch` channel holding the attached tunnel (or none, while
//! paused). `send_modify` makes every pause/resume swap atomic with respect
//! to concurrent attempts on the same session, and the watch doubles as the
//! wake signal for the idle message loop — no polling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use uuid::Uuid;

use crate::tunnel::Tunnel;

/// Current owner of the session's I/O, plus a generation counter so the
/// message loop can tell "swapped to a new transport" apart from "same
/// transport, spurious wake".
#[derive(Debug, Clone)]
pub struct Attachment {
    pub generation: u64,
    /// `None` while the session is paused (gate released).
    pub tunnel: Option<Arc<Tunnel>>,
}

/// One logical gateway session. Handler state lives in the message loop;
/// this struct carries identity and the coordination primitives shared with
/// the transports.
pub struct Session {
    id: Uuid,
    attachment: watch::Sender<Attachment>,
    teardown: watch::Sender<bool>,
    created: Instant,
}

impl Session {
    /// Create a session attached to its initial transport.
    pub fn new(id: Uuid, initial: Arc<Tunnel>) -> Arc<Self> {
        let (attachment, _) = watch::channel(Attachment {
            generation: 0,
            tunnel: Some(initial),
        });
        let (teardown, _) = watch::channel(false);
        Arc::new(Self {
            id,
            attachment,
            teardown,
            created: Instant::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn uptime(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn watch_attachment(&self) -> watch::Receiver<Attachment> {
        self.attachment.subscribe()
    }

    pub fn watch_teardown(&self) -> watch::Receiver<bool> {
        self.teardown.subscribe()
    }

    pub fn is_attached(&self) -> bool {
        self.attachment.borrow().tunnel.is_some()
    }

    /// Release the gate: detach the current transport without destroying any
    /// session state. The message loop stops servicing the old transport and
    /// suspends until [`resume`](Self::resume) or [`shutdown`](Self::shutdown).
    pub fn pause(&self) {
        self.attachment.send_modify(|a| {
            a.generation += 1;
            a.tunnel = None;
        });
    }

    /// Attach a fresh transport, returning the previously attached tunnel
    /// (if the session was not paused first) so callers can log the swap.
    /// The stale transport itself is closed by the message loop when it
    /// adopts the new attachment.
    pub fn resume(&self, tunnel: Arc<Tunnel>) -> Option<Arc<Tunnel>> {
        let mut previous = None;
        self.attachment.send_modify(|a| {
            a.generation += 1;
            previous = a.tunnel.replace(tunnel);
        });
        previous
    }

    /// Ask the message loop to terminate. Safe to call repeatedly and from
    /// any task; the loop runs its teardown exactly once.
    pub fn shutdown(&self) {
        let _ = self.teardown.send(true);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("attached", &self.is_attached())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pause_then_resume_bumps_generation() {
        let (t1, _s1) = Tunnel::pair(4);
        let session = Session::new(Uuid::new_v4(), t1);
        let rx = session.watch_attachment();
        assert_eq!(rx.borrow().generation, 0);
        assert!(session.is_attached());

        session.pause();
        assert!(!session.is_attached());
        assert_eq!(rx.borrow().generation, 1);

        let (t2, _s2) = Tunnel::pair(4);
        let prev = session.resume(t2);
        assert!(prev.is_none(), "paused session has no previous transport");
        assert!(session.is_attached());
        assert_eq!(rx.borrow().generation, 2);
    }

    #[tokio::test]
    async fn test_resume_while_attached_returns_previous() {
        let (t1, _s1) = Tunnel::pair(4);
        let session = Session::new(Uuid::new_v4(), Arc::clone(&t1));
        let (t2, _s2) = Tunnel::pair(4);
        let prev = session.resume(t2).expect("previous transport returned");
        assert_eq!(prev.id(), t1.id());
    }

    #[tokio::test]
    async fn test_concurrent_pause_resume_leaves_one_transport() {
        // Race pause against resume many times; whatever the interleaving,
        // the gate must end up with zero or one attachment and a consistent
        // generation — never a torn state.
        for _ in 0..100 {
            let (t1, _s1) = Tunnel::pair(4);
            let session = Session::new(Uuid::new_v4(), t1);
            let (t2, _s2) = Tunnel::pair(4);

            let s1 = Arc::clone(&session);
            let pause = tokio::spawn(async move { s1.pause() });
            let s2 = Arc::clone(&session);
            let resume = tokio::spawn(async move { s2.resume(t2) });
            pause.await.unwrap();
            resume.await.unwrap();

            let att = session.watch_attachment().borrow().clone();
            assert_eq!(att.generation, 2);
            // Either order is legal; both leave at most one attachment.
            if let Some(t) = att.tunnel {
                assert!(!t.is_closed());
            }
        }
    }

    #[tokio::test]
    async fn test_attachment_watch_wakes_on_resume() {
        let (t1, _s1) = Tunnel::pair(4);
        let session = Session::new(Uuid::new_v4(), t1);
        session.pause();

        let mut rx = session.watch_attachment();
        rx.borrow_and_update();

        let waiter = tokio::spawn(async move {
            rx.changed().await.unwrap();
            rx.borrow().tunnel.is_some()
        });
        let (t2, _s2) = Tunnel::pair(4);
        session.resume(t2);
        assert!(waiter.await.unwrap());
    }
}
