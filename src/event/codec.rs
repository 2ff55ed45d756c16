//! Sealed event frame encoding/decoding
//!
//! Frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |         Length (4B, BE)           |
//! +--------+--------+--------+--------+
//! | Scope  |      Nonce (12B) ...     |
//! +--------+--------+--------+--------+
//! |     Ciphertext + Tag (16B)        |
//! +--------+--------+--------+--------+
//! ```
//!
//! `Length` counts every byte after itself. `Scope` is 0 for frames sealed
//! under the universal key and 1 for frames sealed under a connection IV.
//! The 5 header bytes are bound in as associated data.
//!
//! Plaintext: `[type u8][session id u32 BE][body]`.

use super::{AuthEvent, CodecError, Event, EventKind, EventType};
use crate::crypto::{derive_iv_key, derive_universal_key, Cipher, CryptoError, NONCE_LEN, TAG_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length prefix plus scope byte
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum value of the length prefix (256 KB)
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

/// Event type plus session id
const PLAINTEXT_HEADER_SIZE: usize = 5;

const MIN_FRAME_LEN: usize = 1 + NONCE_LEN + PLAINTEXT_HEADER_SIZE + TAG_LEN;

const SCOPE_UNIVERSAL: u8 = 0;
const SCOPE_IV: u8 = 1;

/// Encrypts events into frames and decrypts frames back into events
///
/// Key `0` selects the universal key used before a connection is
/// authenticated; any other key is a connection IV.
pub struct EventCodec {
    secret: Vec<u8>,
    universal: Cipher,
}

impl EventCodec {
    /// Create a codec from the secret shared by both ends of the tunnel
    pub fn new(secret: &[u8]) -> Result<Self, CryptoError> {
        let universal = Cipher::new(&derive_universal_key(secret)?)?;
        Ok(Self {
            secret: secret.to_vec(),
            universal,
        })
    }

    /// Seal `event` under `key` and append the frame to `out`
    pub fn encrypt(&self, event: &Event, key: u64, out: &mut BytesMut) -> Result<(), CodecError> {
        let mut plaintext = encode_plain(event);

        let frame_len = 1 + NONCE_LEN + plaintext.len() + TAG_LEN;
        if frame_len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame_len, MAX_FRAME_SIZE));
        }

        let scope = if key == 0 { SCOPE_UNIVERSAL } else { SCOPE_IV };
        let mut header = [0u8; FRAME_HEADER_SIZE];
        header[..4].copy_from_slice(&(frame_len as u32).to_be_bytes());
        header[4] = scope;

        let nonce = Cipher::fresh_nonce()?;
        if key == 0 {
            self.universal.seal_in_place(&nonce, &header, &mut plaintext)?;
        } else {
            self.iv_cipher(key)?
                .seal_in_place(&nonce, &header, &mut plaintext)?;
        }

        out.reserve(FRAME_HEADER_SIZE + frame_len);
        out.put_slice(&header);
        out.put_slice(&nonce);
        out.put_slice(&plaintext);
        Ok(())
    }

    /// Seal every event in order under `key`
    pub fn encrypt_all<'a, I>(&self, events: I, key: u64, out: &mut BytesMut) -> Result<(), CodecError>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        for event in events {
            self.encrypt(event, key, out)?;
        }
        Ok(())
    }

    /// Decode one event from the front of `buf`
    ///
    /// Returns `CodecError::NeedMoreData` without consuming anything when the
    /// buffer holds only part of a frame. Universal frames open regardless of
    /// `key`; IV-scoped frames only open with the IV they were sealed under.
    pub fn decrypt(&self, buf: &mut BytesMut, key: u64) -> Result<Event, CodecError> {
        if buf.len() < 4 {
            return Err(CodecError::NeedMoreData);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame_len, MAX_FRAME_SIZE));
        }
        if frame_len < MIN_FRAME_LEN {
            return Err(CodecError::Malformed(format!(
                "Frame too short: {}",
                frame_len
            )));
        }
        if buf.len() < 4 + frame_len {
            return Err(CodecError::NeedMoreData);
        }

        let mut frame = buf.split_to(4 + frame_len);
        let (head, sealed) = frame.split_at_mut(FRAME_HEADER_SIZE + NONCE_LEN);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&head[FRAME_HEADER_SIZE..]);
        let header = &head[..FRAME_HEADER_SIZE];

        let plaintext = match header[4] {
            SCOPE_UNIVERSAL => self.universal.open_in_place(&nonce, header, sealed)?,
            SCOPE_IV if key == 0 => {
                return Err(CodecError::Malformed(
                    "IV-scoped frame before authentication".to_string(),
                ))
            }
            SCOPE_IV => self.iv_cipher(key)?.open_in_place(&nonce, header, sealed)?,
            other => {
                return Err(CodecError::Malformed(format!("Unknown key scope: {}", other)))
            }
        };

        decode_plain(plaintext)
    }

    /// Decode every complete event in `buf`
    ///
    /// A trailing partial frame is left in the buffer.
    pub fn decrypt_all(&self, buf: &mut BytesMut, key: u64) -> Result<Vec<Event>, CodecError> {
        let mut events = Vec::new();
        while !buf.is_empty() {
            match self.decrypt(buf, key) {
                Ok(event) => events.push(event),
                Err(CodecError::NeedMoreData) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(events)
    }

    fn iv_cipher(&self, iv: u64) -> Result<Cipher, CryptoError> {
        Cipher::new(&derive_iv_key(&self.secret, iv)?)
    }
}

/// Number of leading bytes of `buf` taken up by complete frames
///
/// Only length prefixes are inspected; nothing is decrypted.
pub fn complete_frames_len(buf: &[u8]) -> Result<usize, CodecError> {
    let mut offset = 0;
    while buf.len() - offset >= 4 {
        let head = &buf[offset..];
        let frame_len = u32::from_be_bytes([head[0], head[1], head[2], head[3]]) as usize;
        if frame_len > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(frame_len, MAX_FRAME_SIZE));
        }
        if frame_len < MIN_FRAME_LEN {
            return Err(CodecError::Malformed(format!("Frame too short: {}", frame_len)));
        }
        if head.len() < 4 + frame_len {
            break;
        }
        offset += 4 + frame_len;
    }
    Ok(offset)
}

fn encode_plain(event: &Event) -> Vec<u8> {
    let mut buf = Vec::with_capacity(PLAINTEXT_HEADER_SIZE + 32 + TAG_LEN);
    buf.put_u8(event.event_type() as u8);
    buf.put_u32(event.session_id);

    match &event.kind {
        EventKind::Auth(auth) => {
            buf.put_i64(auth.index);
            buf.put_u64(auth.iv);
            let user = auth.user.as_bytes();
            let len = user.len().min(u16::MAX as usize);
            buf.put_u16(len as u16);
            buf.put_slice(&user[..len]);
        }
        EventKind::Notify { code } => buf.put_i32(*code),
        EventKind::Data(payload) => buf.put_slice(payload),
        EventKind::Heartbeat | EventKind::Close => {}
    }
    buf
}

fn decode_plain(mut plain: &[u8]) -> Result<Event, CodecError> {
    if plain.remaining() < PLAINTEXT_HEADER_SIZE {
        return Err(CodecError::Malformed("Truncated event header".to_string()));
    }
    let event_type = EventType::try_from(plain.get_u8())?;
    let session_id = plain.get_u32();

    let kind = match event_type {
        EventType::Auth => {
            if plain.remaining() < 18 {
                return Err(CodecError::Malformed("Truncated auth event".to_string()));
            }
            let index = plain.get_i64();
            let iv = plain.get_u64();
            let user_len = plain.get_u16() as usize;
            if plain.remaining() != user_len {
                return Err(CodecError::Malformed("Invalid auth user length".to_string()));
            }
            let user = std::str::from_utf8(plain)
                .map_err(|_| CodecError::Malformed("Auth user is not UTF-8".to_string()))?
                .to_string();
            EventKind::Auth(AuthEvent { index, iv, user })
        }
        EventType::Notify => {
            if plain.remaining() != 4 {
                return Err(CodecError::Malformed("Invalid notify event".to_string()));
            }
            EventKind::Notify {
                code: plain.get_i32(),
            }
        }
        EventType::Heartbeat => EventKind::Heartbeat,
        EventType::Data => EventKind::Data(Bytes::copy_from_slice(plain)),
        EventType::Close => EventKind::Close,
    };

    Ok(Event { session_id, kind })
}
