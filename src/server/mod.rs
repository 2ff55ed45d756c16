//! Server side of the channel protocol
//!
//! Provides:
//! - `RequestProcessor`: decodes inbound buffers, answers auth frames and
//!   hands application events to a `RequestHandler`
//! - `EventQueue`/`EventQueueTable`: per-connection outbound buffering with
//!   peek/discard acknowledgement
//! - `SessionTable`: sessions scoped to the connection identity that opened them
//! - `Invoker`: request/response entry point with bounded pull delivery
//! - `Server`: TCP listener serving persistent client channels

mod invoke;
mod processor;
mod queue;
mod sessions;
mod stream;

pub use invoke::{pull, write_events, InvokeOutcome, Invoker, PullOptions};
pub use processor::{RequestHandler, RequestProcessor};
pub use queue::{EventQueue, EventQueueTable, QueueError, QueueHandle};
pub use sessions::SessionTable;
pub use stream::Server;

use crate::event::{AuthEvent, CodecError};
use crate::protocol::ProtocolError;
use std::fmt;
use std::io;
use thiserror::Error;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Request body has {0} trailing bytes")]
    Truncated(usize),
}

/// Identity of one client channel: the user plus the channel's pool index
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnId {
    pub user: String,
    pub index: i64,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.index)
    }
}

/// Per-connection state built up from auth frames
#[derive(Debug, Clone, Default)]
pub struct ConnContext {
    /// IV of the authenticated connection instance, 0 until authenticated
    pub iv: u64,
    pub index: i64,
    pub user: String,
    /// Set once an auth frame was refused
    pub rejected: bool,
}

impl ConnContext {
    pub fn is_authed(&self) -> bool {
        self.iv != 0 && !self.rejected
    }

    /// Adopt the identity of an accepted auth frame
    pub fn authenticate(&mut self, auth: &AuthEvent) {
        self.iv = auth.iv;
        self.index = auth.index;
        self.user = auth.user.clone();
    }

    pub fn conn_id(&self) -> Option<ConnId> {
        self.is_authed().then(|| ConnId {
            user: self.user.clone(),
            index: self.index,
        })
    }
}
