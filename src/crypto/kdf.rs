//! Key Derivation Functions
//!
//! HKDF-SHA256 derivation of event keys from the shared secret

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

const UNIVERSAL_KEY_LABEL: &[u8] = b"evtunnel_universal_key";
const SESSION_KEY_LABEL: &[u8] = b"evtunnel_session_key";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Create HKDF from input keying material
    ///
    /// # Arguments
    /// * `salt` - Optional salt (if None, uses zeros)
    /// * `ikm` - Input keying material
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = match salt {
            Some(s) => Salt::new(HKDF_SHA256, s),
            None => Salt::new(HKDF_SHA256, &[0u8; 32]),
        };

        let prk = salt.extract(ikm);

        Self { prk }
    }

    /// Expand the PRK into `output`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        let okm = self
            .prk
            .expand(&info_refs, HkdfLen(output.len()))
            .map_err(|_| CryptoError::KeyDerivation("HKDF expand failed".to_string()))?;

        okm.fill(output)
            .map_err(|_| CryptoError::KeyDerivation("HKDF fill failed".to_string()))?;

        Ok(())
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

/// Helper struct for HKDF output length
struct HkdfLen(usize);

impl hkdf::KeyType for HkdfLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the key used for frames sealed before a connection is authenticated
pub fn derive_universal_key(secret: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    Hkdf::new(None, secret).expand_key(UNIVERSAL_KEY_LABEL)
}

/// Derive the key scoped to one connection instance's IV
pub fn derive_iv_key(secret: &[u8], iv: u64) -> Result<[u8; KEY_LEN], CryptoError> {
    Hkdf::new(Some(&iv.to_be_bytes()), secret).expand_key(SESSION_KEY_LABEL)
}
