//! # evtunnel
//!
//! Multiplexed, encrypted, authenticated event channels between a client
//! and a tunnel server.
//!
//! ## Features
//!
//! - **Channel pool** with round-robin selection over N physical connections
//! - **Per-connection-instance auth**: every (re)connect carries a fresh IV
//!   and must be acknowledged by the server before events are dispatched
//! - **Sealed event frames** keyed by the connection IV (ChaCha20-Poly1305)
//! - **Pull delivery** so connectionless request/response transports can
//!   emulate a persistent duplex stream
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Application Layer                   │
//! │      (EventHandler / RequestHandler callbacks)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Channel Layer                      │
//! │   (ChannelTable, RemoteChannel, auth rendezvous)    │
//! ├─────────────────────────────────────────────────────┤
//! │                   Event Layer                       │
//! │        (Event model, sealed frame codec)            │
//! ├─────────────────────────────────────────────────────┤
//! │               Server Delivery Layer                 │
//! │   (RequestProcessor, EventQueue, pull, pushers)     │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transport Layer                     │
//! │            (RemoteTransport, TCP)                   │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod channel;
pub mod config;
pub mod crypto;
pub mod event;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transport;

pub use config::Config;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Codec error: {0}")]
    Codec(#[from] event::CodecError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    #[error("Server error: {0}")]
    Server(#[from] server::ServerError),

    #[error("Configuration error: {0}")]
    Config(String),
}
