//! AES-256-GCM-SIV sealing of small secrets (headers, keys) under a KEK.
//!
//! **Algorithm choice:** AES-256-GCM-SIV (RFC 8452) is nonce-misuse-resistant.
//! A KEK seals one header per object per rotation, across millions of objects,
//! so accidental nonce collisions must not break confidentiality.

use aes_gcm_siv::{
    aead::{rand_core::RngCore, Aead, KeyInit, OsRng},
    Aes256GcmSiv, Nonce,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};

use super::cipher::{CipherError, KEY_LEN, NONCE_LEN};

/// Prefix that appears at the start of every sealed value.
pub const VERSION_PREFIX: &str = "v1";

/// A sealed value.
///
/// The string representation is `v1.<base64url(nonce)>.<base64url(ciphertext+tag)>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedBlob {
    /// Raw nonce bytes.
    pub nonce: [u8; NONCE_LEN],
    /// Raw ciphertext + authentication tag bytes.
    pub ciphertext: Vec<u8>,
}

impl SealedBlob {
    /// Encode this value to its canonical string representation.
    pub fn to_string_repr(&self) -> String {
        format!(
            "{}.{}.{}",
            VERSION_PREFIX,
            URL_SAFE_NO_PAD.encode(self.nonce),
            URL_SAFE_NO_PAD.encode(&self.ciphertext),
        )
    }

    /// Parse a sealed string back into a [`SealedBlob`].
    ///
    /// # Errors
    ///
    /// Returns [`CipherError::InvalidFormat`] if the string does not match the
    /// expected `v1.<nonce>.<ciphertext>` structure.
    pub fn parse(s: &str) -> Result<Self, CipherError> {
        let parts: Vec<&str> = s.splitn(3, '.').collect();
        if parts.len() != 3 || parts[0] != VERSION_PREFIX {
            return Err(CipherError::InvalidFormat);
        }
        let nonce_bytes = URL_SAFE_NO_PAD
            .decode(parts[1])
            .map_err(|_| CipherError::InvalidFormat)?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(CipherError::InvalidFormat);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&nonce_bytes);

        let ciphertext = URL_SAFE_NO_PAD
            .decode(parts[2])
            .map_err(|_| CipherError::InvalidFormat)?;

        Ok(Self { nonce, ciphertext })
    }
}

/// Seal `plaintext` under `kek` with a fresh random nonce.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `kek` is not [`KEY_LEN`] bytes.
pub fn seal(plaintext: &[u8], kek: &[u8]) -> Result<SealedBlob, CipherError> {
    let cipher = build_cipher(kek)?;

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| CipherError::AeadFailure)?;

    Ok(SealedBlob {
        nonce: nonce_bytes,
        ciphertext,
    })
}

/// Open a [`SealedBlob`] with `kek`.
///
/// # Errors
///
/// Returns [`CipherError::AeadFailure`] if authentication fails (wrong KEK or
/// tampered data).
pub fn open(blob: &SealedBlob, kek: &[u8]) -> Result<Vec<u8>, CipherError> {
    let cipher = build_cipher(kek)?;
    let nonce = Nonce::from_slice(&blob.nonce);
    cipher
        .decrypt(nonce, blob.ciphertext.as_ref())
        .map_err(|_| CipherError::AeadFailure)
}

fn build_cipher(kek: &[u8]) -> Result<Aes256GcmSiv, CipherError> {
    if kek.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(kek.len()));
    }
    Aes256GcmSiv::new_from_slice(kek).map_err(|_| CipherError::InvalidKeyLength(kek.len()))
}
