//! Session registry and lifecycle.
//!
//! [`SessionRegistry`] is the single authority mapping session UUIDs to live
//! [`Session`]s — the lookup path a `resume,<id>;` on a fresh transport goes
//! through. Mutations (`put`, `remove`, `shutdown`) take the write lock and
//! are therefore mutually exclusive; `get` takes the read lock, so a reader
//! can never observe a partially-linked entry.
//!
//! After [`SessionRegistry::shutdown`] every operation is rejected and every
//! session that was registered has been told to tear down.

pub mod handlers;
pub mod message_loop;
pub mod session;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::error::{GatewayError, Result};

pub use handlers::{BackendHandlers, SessionHandlers};
pub use session::{Attachment, Session};

/// Concurrent map of live sessions.
///
/// Cloneable — all clones share the same inner map.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Default)]
struct RegistryInner {
    sessions: HashMap<Uuid, Arc<Session>>,
    shut: bool,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its id. At most one session per UUID.
    pub async fn put(&self, session: Arc<Session>) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.shut {
            return Err(GatewayError::Shutdown);
        }
        match inner.sessions.entry(session.id()) {
            Entry::Occupied(_) => Err(GatewayError::SessionConflict(session.id())),
            Entry::Vacant(slot) => {
                slot.insert(session);
                Ok(())
            }
        }
    }

    /// Look up a session. `None` for unknown ids and after shutdown.
    pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        let inner = self.inner.read().await;
        if inner.shut {
            return None;
        }
        inner.sessions.get(&id).cloned()
    }

    /// Remove and return a session.
    pub async fn remove(&self, id: Uuid) -> Result<Arc<Session>> {
        let mut inner = self.inner.write().await;
        if inner.shut {
            return Err(GatewayError::Shutdown);
        }
        inner
            .sessions
            .remove(&id)
            .ok_or_else(|| GatewayError::NotFound(format!("session {id}")))
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.sessions.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.sessions.is_empty()
    }

    pub async fn ids(&self) -> Vec<Uuid> {
        self.inner.read().await.sessions.keys().copied().collect()
    }

    /// Reject all further operations and tear down every registered session.
    /// Each session's message loop runs its own exactly-once cleanup.
    pub async fn shutdown(&self) {
        let drained: Vec<Arc<Session>> = {
            let mut inner = self.inner.write().await;
            inner.shut = true;
            inner.sessions.drain().map(|(_, s)| s).collect()
        };
        let count = drained.len();
        for session in drained {
            session.shutdown();
        }
        if count > 0 {
            info!("registry shut down, {count} session(s) told to terminate");
        }
    }
}
