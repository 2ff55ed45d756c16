//! Client channel layer
//!
//! Provides:
//! - `RemoteChannel`: one physical connection with its auth handshake,
//!   batched encrypted write loop, decrypting read loop and heartbeat
//! - `ChannelTable`: round-robin pool of channels

mod remote;
mod table;

pub use remote::RemoteChannel;
pub use table::ChannelTable;

use crate::event::{CodecError, Event, AUTH_FAILED, AUTH_SUCCESS};
use crate::transport::TransportError;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel layer errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Server {addr} auth timeout after {elapsed:?}")]
    AuthTimeout { addr: String, elapsed: Duration },

    #[error("Server {addr} auth failed")]
    AuthFailed { addr: String },

    #[error("Server {addr} auth recv unexpected code: {code}")]
    UnexpectedAuthCode { addr: String, code: i32 },

    #[error("Channel is not running")]
    NotRunning,

    #[error("Channel already initialized")]
    AlreadyInitialized,

    #[error("Empty response")]
    EmptyResponse,

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// Authentication outcome of the current connection instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Pending,
    Success,
    Failed,
    Unexpected(i32),
}

impl AuthState {
    /// Map a notify code; code 0 leaves the state pending
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => AuthState::Pending,
            AUTH_SUCCESS => AuthState::Success,
            AUTH_FAILED => AuthState::Failed,
            other => AuthState::Unexpected(other),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, AuthState::Pending)
    }
}

/// Behavior switches of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelFlags {
    /// Skip the internal loops; the caller drives I/O synchronously
    pub direct_io: bool,
    /// Prepend an auth frame to every batch
    pub write_join_auth: bool,
    /// Prepend an auth frame to the first batch after connect
    pub open_join_auth: bool,
    /// Send periodic heartbeats while sessions exist
    pub heartbeat: bool,
}

/// Static configuration of one channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Remote endpoint, used for logs and errors
    pub addr: String,
    /// Identity within the pool, echoed in auth frames
    pub index: i64,
    pub user: String,
    pub flags: ChannelFlags,
    /// Capacity of the outbound event queue
    pub write_queue_capacity: usize,
    pub heartbeat_interval: Duration,
}

impl ChannelOptions {
    pub fn new(addr: impl Into<String>, index: i64) -> Self {
        Self {
            addr: addr.into(),
            index,
            user: String::new(),
            flags: ChannelFlags::default(),
            write_queue_capacity: crate::protocol::WRITE_QUEUE_CAPACITY,
            heartbeat_interval: crate::protocol::HEARTBEAT_INTERVAL,
        }
    }
}

/// Receives events decoded by channels once they are authenticated
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: Event);
}

impl EventHandler for mpsc::UnboundedSender<Event> {
    fn handle_event(&self, event: Event) {
        // Receiver gone means the application is shutting down.
        let _ = self.send(event);
    }
}
