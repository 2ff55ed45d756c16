//! Physical transport implementations
//!
//! A channel drives its connection through the `RemoteTransport` trait:
//! - streaming reads and writes for the read/write loops
//! - a one-shot request/response primitive for connectionless use
//! - an explicit open tagged with the connection IV
//!
//! `TcpRemote` is the TCP backend shipped with the crate.

mod tcp;

pub use tcp::TcpRemote;

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed")]
    Closed,

    #[error("Read timeout")]
    Timeout,

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),
}

/// Physical connection owned by a channel
///
/// All methods take `&self`: the read loop and the write loop use the same
/// transport concurrently, so implementations keep their halves behind
/// interior locks.
#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// (Re)open the connection for the connection instance identified by `iv`
    async fn open(&self, iv: u64) -> Result<(), TransportError>;

    /// Whether the connection is currently closed
    fn is_closed(&self) -> bool;

    /// Read available bytes; `Ok(0)` is never returned for an open stream
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Write all of `data`
    async fn write(&self, data: &[u8]) -> Result<usize, TransportError>;

    /// Close the connection; a pending read returns `TransportError::Closed`
    async fn close(&self);

    /// Send one request and wait for its whole response
    async fn request(&self, data: &[u8]) -> Result<Bytes, TransportError>;

    /// How long a read may stall before the connection is considered dead
    fn read_timeout(&self) -> Duration;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Read timeout in seconds
    pub read_timeout: u64,
    /// Write timeout in seconds
    pub write_timeout: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            read_timeout: 15,
            write_timeout: 15,
        }
    }
}
