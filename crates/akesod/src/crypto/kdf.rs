//! HKDF-SHA256 derivation of a KEK from an Ed25519 private key.
//!
//! The group key agreement hands each rotation a fresh Ed25519 "stage key" as a
//! PKCS#8 PEM file. The bucket KEK is derived from that key's 32-byte seed.

use ed25519_dalek::{pkcs8::DecodePrivateKey, SigningKey};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::keys::{KeyBytes, KeyError};
use super::cipher::KEY_LEN;

/// HKDF `info` string binding the derived key to its purpose.
pub const KDF_INFO: &[u8] = b"aes-256-key from ed25519";

/// Derive a 256-bit KEK from a PEM-encoded Ed25519 PKCS#8 private key.
///
/// # Errors
///
/// Returns [`KeyError::Pem`] if there is no `PRIVATE KEY` block, the block is
/// malformed, or the key is not an Ed25519 PKCS#8 key.
pub fn derive_kek_from_pem(pem: &str, salt: &[u8]) -> Result<KeyBytes, KeyError> {
    let signing_key = SigningKey::from_pkcs8_pem(pem.trim())
        .map_err(|e| KeyError::Pem(format!("not an Ed25519 PKCS#8 PEM key: {e}")))?;
    derive_kek_from_seed(&signing_key.to_bytes(), salt)
}

/// Derive a 256-bit KEK from raw input keying material.
pub fn derive_kek_from_seed(ikm: &[u8], salt: &[u8]) -> Result<KeyBytes, KeyError> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|e| KeyError::Derivation(e.to_string()))?;
    let key = KeyBytes::from_slice(&okm);
    okm.iter_mut().for_each(|b| *b = 0);
    key
}
