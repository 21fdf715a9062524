//! AES-256-CTR keystream application.
//!
//! CTR is a plain XOR with a keystream, so the same call both adds and removes
//! a layer. Layers with different keys commute with each other and with the
//! GCM ciphertext underneath, which is what lets Akeso re-key stored bytes
//! without ever seeing the plaintext.

use ctr::cipher::{KeyIvInit, StreamCipher};

use super::cipher::{CipherError, KEY_LEN};
use super::iv::Iv128;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;

/// XOR `data` in place with the AES-256-CTR keystream for `key` starting at `iv`.
///
/// # Errors
///
/// Returns [`CipherError::InvalidKeyLength`] if `key` is not [`KEY_LEN`] bytes.
pub fn apply_keystream(key: &[u8], iv: &Iv128, data: &mut [u8]) -> Result<(), CipherError> {
    if key.len() != KEY_LEN {
        return Err(CipherError::InvalidKeyLength(key.len()));
    }
    let mut cipher = Aes256Ctr::new_from_slices(key, iv.as_bytes())
        .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
    cipher.apply_keystream(data);
    Ok(())
}
