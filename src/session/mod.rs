//! Logical session registry
//!
//! A session is a logical connection (one proxied stream) independent of the
//! physical channel that carries it. The client consults the registry to
//! decide whether a channel is worth reconnecting or keeping alive. The
//! server keeps its own per-connection table built from the same `Session`.

use crate::crypto::CryptoError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tracing::debug;

/// One logical session
#[derive(Debug, Clone)]
pub struct Session {
    pub id: u32,
    /// Index of the channel that carries the session
    pub conn_index: i64,
    /// IV of the connection instance the session was opened on
    pub iv: u64,
    pub user: String,
    pub created: Instant,
}

impl Session {
    /// Create a session that is not yet bound to a connection
    pub fn new(id: u32) -> Self {
        Self {
            id,
            conn_index: 0,
            iv: 0,
            user: String::new(),
            created: Instant::now(),
        }
    }
}

/// Registry of active sessions, shared by `Arc`
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<u32, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u32, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session, returning `false` if the id was already present
    pub fn insert(&self, session: Session) -> bool {
        let id = session.id;
        let inserted = self.lock().insert(id, session).is_none();
        if inserted {
            debug!(session = id, "session opened");
        }
        inserted
    }

    /// Open a session with a fresh random id, closed again when the guard drops
    pub fn open_random(self: &Arc<Self>) -> Result<SessionGuard, CryptoError> {
        loop {
            let id = crate::crypto::random_u32()?;
            if id != 0 && self.insert(Session::new(id)) {
                return Ok(SessionGuard {
                    registry: Arc::clone(self),
                    id,
                });
            }
        }
    }

    /// Remove a session
    pub fn close(&self, id: u32) -> Option<Session> {
        let removed = self.lock().remove(&id);
        if removed.is_some() {
            debug!(session = id, "session closed");
        }
        removed
    }

    pub fn contains(&self, id: u32) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Keeps a session registered until dropped
#[derive(Debug)]
pub struct SessionGuard {
    registry: Arc<SessionRegistry>,
    id: u32,
}

impl SessionGuard {
    pub fn id(&self) -> u32 {
        self.id
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry.close(self.id);
    }
}
