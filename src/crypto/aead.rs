//! AEAD sealing for event frames
//!
//! ChaCha20-Poly1305 with an explicit nonce carried next to the ciphertext.
//! Event frames are sealed by independent peers that share no counter state,
//! so the nonce is random per frame rather than a running counter.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// AEAD cipher bound to one derived key
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Generate a fresh random nonce
    pub fn fresh_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        random_bytes(&mut nonce)?;
        Ok(nonce)
    }

    /// Seal `buffer` in place, appending the auth tag
    pub fn seal_in_place(
        &self,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
        buffer: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let nonce = Nonce::assume_unique_for_key(*nonce);

        self.key
            .seal_in_place_append_tag(nonce, Aad::from(associated_data), buffer)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))
    }

    /// Open `buffer` in place, verifying and stripping the auth tag
    ///
    /// Returns the plaintext as a prefix of `buffer`.
    pub fn open_in_place<'a>(
        &self,
        nonce: &[u8; NONCE_LEN],
        associated_data: &[u8],
        buffer: &'a mut [u8],
    ) -> Result<&'a mut [u8], CryptoError> {
        let nonce = Nonce::assume_unique_for_key(*nonce);

        self.key
            .open_in_place(nonce, Aad::from(associated_data), buffer)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}
