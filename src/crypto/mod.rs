//! Cryptographic primitives for event sealing
//!
//! This module provides:
//! - ChaCha20-Poly1305 AEAD encryption
//! - HKDF-SHA256 key derivation
//! - Secure random number generation (IVs, nonces, session ids)

mod aead;
mod kdf;

pub use aead::Cipher;
pub use kdf::{derive_iv_key, derive_universal_key, Hkdf};

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Random generator failure")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a fresh connection IV
///
/// Zero is reserved for the universal key and is never returned.
pub fn random_iv() -> Result<u64, CryptoError> {
    loop {
        let mut buf = [0u8; 8];
        random_bytes(&mut buf)?;
        let iv = u64::from_le_bytes(buf);
        if iv != 0 {
            return Ok(iv);
        }
    }
}

/// Generate a random 32-bit identifier
pub fn random_u32() -> Result<u32, CryptoError> {
    let mut buf = [0u8; 4];
    random_bytes(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}
