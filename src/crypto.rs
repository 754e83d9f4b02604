//! AES-256-GCM payload sealing for the wire protocol.
//!
//! # Wire Format
//!
//! A sealed payload is one base64 string (standard alphabet, padded):
//!
//! ```text
//! base64( nonce[12] ‖ tag[16] ‖ ciphertext[..] )
//! ```
//!
//! and travels inside the envelope `{ "payload": "<string>" }`.
//!
//! The codec takes any 256-bit [`CipherKey`]; where the key comes from is
//! the caller's business. The server default is [`CipherKey::legacy_shared`],
//! the fixed key every deployed client was built with.

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Key, Nonce, Tag,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key size for AES-256 (32 bytes).
pub const KEY_SIZE: usize = 32;

/// Nonce size for AES-GCM (96 bits = 12 bytes).
pub const NONCE_SIZE: usize = 12;

/// Authentication tag size (128 bits = 16 bytes).
pub const TAG_SIZE: usize = 16;

/// Errors from sealing or opening a payload.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The payload is not valid base64.
    #[error("invalid payload encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    /// The decoded payload cannot hold a nonce and a tag.
    #[error("payload too short: {0} bytes (need at least {min})", min = NONCE_SIZE + TAG_SIZE)]
    Truncated(usize),

    /// The tag did not verify: wrong key or tampered data.
    #[error("payload failed authentication")]
    Authentication,

    /// Encryption itself failed (plaintext beyond the AES-GCM limit).
    #[error("encryption failed")]
    Encryption,

    /// A configured key did not decode to exactly 32 bytes.
    #[error("key must be {expected} bytes, got {0}", expected = KEY_SIZE)]
    KeyLength(usize),
}

/// A 256-bit symmetric key, wiped from memory on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct CipherKey([u8; KEY_SIZE]);

impl CipherKey {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// The fixed key shared by every connection (32 bytes of `0x01`).
    ///
    /// Not derived per session; the handshake carries no key material.
    pub fn legacy_shared() -> Self {
        Self([1u8; KEY_SIZE])
    }

    /// Parse a base64-encoded 32-byte key.
    pub fn from_base64(encoded: &str) -> Result<Self, CipherError> {
        let mut decoded = BASE64.decode(encoded.trim())?;
        let key = match <[u8; KEY_SIZE]>::try_from(decoded.as_slice()) {
            Ok(bytes) => Ok(Self(bytes)),
            Err(_) => Err(CipherError::KeyLength(decoded.len())),
        };
        decoded.zeroize();
        key
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0))
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
///
/// Returns `base64(nonce ‖ tag ‖ ciphertext)`.
pub fn encrypt(plaintext: &[u8], key: &CipherKey) -> Result<String, CipherError> {
    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let mut buffer = plaintext.to_vec();
    let tag = key
        .cipher()
        .encrypt_in_place_detached(nonce, b"", &mut buffer)
        .map_err(|aes_gcm::aead::Error| CipherError::Encryption)?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + TAG_SIZE + buffer.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&tag);
    sealed.extend_from_slice(&buffer);
    Ok(BASE64.encode(sealed))
}

/// Decrypt a payload produced by [`encrypt`].
pub fn decrypt(payload: &str, key: &CipherKey) -> Result<Vec<u8>, CipherError> {
    let data = BASE64.decode(payload)?;
    if data.len() < NONCE_SIZE + TAG_SIZE {
        return Err(CipherError::Truncated(data.len()));
    }

    let (nonce_bytes, rest) = data.split_at(NONCE_SIZE);
    let (tag_bytes, ciphertext) = rest.split_at(TAG_SIZE);

    let mut buffer = ciphertext.to_vec();
    key.cipher()
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce_bytes),
            b"",
            &mut buffer,
            Tag::from_slice(tag_bytes),
        )
        .map_err(|aes_gcm::aead::Error| CipherError::Authentication)?;
    Ok(buffer)
}
