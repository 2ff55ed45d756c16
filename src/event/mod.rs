//! Event layer - the typed message units carried over a channel
//!
//! Provides:
//! - The `Event` model (auth, notify, heartbeat, data, close)
//! - Sealed frame encoding/decoding keyed by connection IV

mod codec;

pub use codec::{complete_frames_len, EventCodec, FRAME_HEADER_SIZE, MAX_FRAME_SIZE};

use bytes::Bytes;
use thiserror::Error;

/// Notify code: the auth frame was accepted
pub const AUTH_SUCCESS: i32 = 1;

/// Notify code: the auth frame was rejected
pub const AUTH_FAILED: i32 = 2;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    /// The buffer does not yet hold a complete frame
    #[error("Need more data")]
    NeedMoreData,

    #[error("Malformed event: {0}")]
    Malformed(String),

    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

impl CodecError {
    /// Whether the error only means "wait for more bytes"
    pub fn is_need_more(&self) -> bool {
        matches!(self, CodecError::NeedMoreData)
    }
}

/// Event kind tags on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EventType {
    Auth = 0x01,
    Notify = 0x02,
    Heartbeat = 0x03,
    Data = 0x04,
    Close = 0x05,
}

impl TryFrom<u8> for EventType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(EventType::Auth),
            0x02 => Ok(EventType::Notify),
            0x03 => Ok(EventType::Heartbeat),
            0x04 => Ok(EventType::Data),
            0x05 => Ok(EventType::Close),
            _ => Err(CodecError::Malformed(format!(
                "Unknown event type: {}",
                value
            ))),
        }
    }
}

/// Handshake frame identifying a channel and its connection IV
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthEvent {
    /// Channel index within the client's pool
    pub index: i64,
    /// IV of the connection instance this frame authenticates
    pub iv: u64,
    /// User the channel acts for
    pub user: String,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Auth(AuthEvent),
    /// Auth result pushed by the server
    Notify { code: i32 },
    Heartbeat,
    Data(Bytes),
    /// The logical session ended
    Close,
}

/// A typed message unit exchanged over a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Logical session this event belongs to (0 for connection-level events)
    pub session_id: u32,
    pub kind: EventKind,
}

impl Event {
    /// Create an auth frame
    pub fn auth(index: i64, iv: u64, user: impl Into<String>) -> Self {
        Self {
            session_id: 0,
            kind: EventKind::Auth(AuthEvent {
                index,
                iv,
                user: user.into(),
            }),
        }
    }

    /// Create an auth result notification
    pub fn notify(code: i32) -> Self {
        Self {
            session_id: 0,
            kind: EventKind::Notify { code },
        }
    }

    /// Create an empty keep-alive event
    pub fn heartbeat() -> Self {
        Self {
            session_id: 0,
            kind: EventKind::Heartbeat,
        }
    }

    /// Create a data event for a session
    pub fn data(session_id: u32, payload: Bytes) -> Self {
        Self {
            session_id,
            kind: EventKind::Data(payload),
        }
    }

    /// Create a close event for a session
    pub fn close(session_id: u32) -> Self {
        Self {
            session_id,
            kind: EventKind::Close,
        }
    }

    /// Wire tag for this event
    pub fn event_type(&self) -> EventType {
        match self.kind {
            EventKind::Auth(_) => EventType::Auth,
            EventKind::Notify { .. } => EventType::Notify,
            EventKind::Heartbeat => EventType::Heartbeat,
            EventKind::Data(_) => EventType::Data,
            EventKind::Close => EventType::Close,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.kind, EventKind::Auth(_))
    }

    /// Auth result code, if this is a notification
    pub fn notify_code(&self) -> Option<i32> {
        match self.kind {
            EventKind::Notify { code } => Some(code),
            _ => None,
        }
    }
}
