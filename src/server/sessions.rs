//! Server-side session bookkeeping
//!
//! Session ids are chosen by clients, so the same id can be live on many
//! connections at once. Every session is scoped to the `ConnId` that opened
//! it and is only visible through that identity.

use super::{ConnContext, ConnId};
use crate::session::Session;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

type Key = (ConnId, u32);

/// Sessions carried by authenticated connections
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: Mutex<HashMap<Key, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Key, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record `session_id` as open on the connection of `ctx`
    ///
    /// Returns `true` if the session was not open before. A session already
    /// open under the same identity moves to the current connection instance.
    pub fn open(&self, ctx: &ConnContext, session_id: u32) -> bool {
        let Some(conn) = ctx.conn_id() else {
            return false;
        };

        let mut sessions = self.lock();
        if let Some(existing) = sessions.get_mut(&(conn.clone(), session_id)) {
            existing.iv = ctx.iv;
            return false;
        }

        debug!(conn = %conn, session = session_id, "session opened");
        sessions.insert(
            (conn, session_id),
            Session {
                conn_index: ctx.index,
                iv: ctx.iv,
                user: ctx.user.clone(),
                ..Session::new(session_id)
            },
        );
        true
    }

    /// Remove `session_id` from the connection of `ctx`
    pub fn close(&self, ctx: &ConnContext, session_id: u32) -> Option<Session> {
        let conn = ctx.conn_id()?;
        let removed = self.lock().remove(&(conn, session_id));
        if let Some(session) = &removed {
            debug!(user = %session.user, session = session_id, "session closed");
        }
        removed
    }

    pub fn get(&self, conn: &ConnId, session_id: u32) -> Option<Session> {
        self.lock().get(&(conn.clone(), session_id)).cloned()
    }

    pub fn contains(&self, conn: &ConnId, session_id: u32) -> bool {
        self.lock().contains_key(&(conn.clone(), session_id))
    }

    /// Remove every session `conn` opened on the connection instance `iv`
    pub fn close_by_iv(&self, conn: &ConnId, iv: u64) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|(owner, _), s| owner != conn || s.iv != iv);
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
