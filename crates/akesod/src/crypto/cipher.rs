//! AES-256-GCM with detached tags.
//!
//! Every strategy that encrypts payload bytes itself stores the ciphertext as
//! the object payload and the 16-byte tag in metadata (or, for Akeso, inside
//! the sealed header), so the tag is always handled separately here.

use aes_gcm::{
    aead::{rand_core::RngCore, AeadInPlace, KeyInit, OsRng},
    Aes256Gcm, Nonce, Tag,
};
use common::EngineError;
use thiserror::Error;

/// Byte length of an AES-256 key (32 bytes = 256 bits).
pub const KEY_LEN: usize = 32;

/// Byte length of an AES-GCM nonce (12 bytes = 96 bits).
pub const NONCE_LEN: usize = 12;

/// Byte length of an AES-GCM authentication tag.
pub const TAG_LEN: usize = 16;

/// All-zero nonce. Only safe with a key that encrypts exactly one message,
/// which is how Akeso uses its per-generation DEKs.
pub const ZERO_NONCE: [u8; NONCE_LEN] = [0u8; NONCE_LEN];

/// Errors produced by the cipher layer.
#[derive(Debug, Error)]
pub enum CipherError {
    /// The key is the wrong length (must be [`KEY_LEN`] bytes).
    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("invalid nonce length: expected {NONCE_LEN} bytes, got {0}")]
    InvalidNonceLength(usize),

    #[error("invalid tag length: expected {TAG_LEN} bytes, got {0}")]
    InvalidTagLength(usize),

    #[error("invalid IV length: expected 16 bytes, got {0}")]
    InvalidIvLength(usize),

    /// Encryption failed, or decryption failed authentication.
    #[error("aead operation failed")]
    AeadFailure,

    /// A sealed blob does not match the expected textual format.
    #[error("invalid sealed format")]
    InvalidFormat,
}

impl From<CipherError> for EngineError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::AeadFailure => EngineError::AuthenticationFailure(e.to_string()),
            other => EngineError::Input(other.to_string()),
        }
    }
}

/// Generate a fresh random nonce from the OS CSPRNG.
pub fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Encrypt `plaintext`, returning the ciphertext and its detached tag.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] / [`CipherError::InvalidNonceLength`]
/// for malformed inputs.
pub fn seal(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN]), CipherError> {
    let cipher = build_cipher(key)?;
    check_nonce(nonce)?;

    let mut buf = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buf)
        .map_err(|_| CipherError::AeadFailure)?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((buf, tag_bytes))
}

/// Decrypt `ciphertext` and verify its detached `tag`.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong key or
/// tampered data), or a length error for malformed inputs.
pub fn open(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(key)?;
    check_nonce(nonce)?;
    if tag.len() != TAG_LEN {
        return Err(CipherError::InvalidTagLength(tag.len()));
    }

    let mut buf = ciphertext.to_vec();
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), b"", &mut buf, Tag::from_slice(tag))
        .map_err(|_| CipherError::AeadFailure)?;
    Ok(buf)
}

fn build_cipher(key: &[u8]) -> Result<Aes256Gcm, CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    Aes256Gcm::new_from_slice(key).map_err(|_| CipherError::InvalidKeyLength(key.len()))
}

fn check_nonce(nonce: &[u8]) -> Result<(), CipherError> {
    if nonce.len() != NONCE_LEN {
        return Err(CipherError::InvalidNonceLength(nonce.len()));
    }
    Ok(())
}
