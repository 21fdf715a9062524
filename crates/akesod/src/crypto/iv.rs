//! 128-bit big-endian counter used as the AES-CTR initial counter block.

use std::fmt;

use aes_gcm::aead::{rand_core::RngCore, OsRng};

use super::cipher::CipherError;

/// Byte length of a CTR IV.
pub const IV_LEN: usize = 16;

/// A 16-byte big-endian counter. Arithmetic wraps modulo 2^128, matching how
/// the CTR keystream itself advances.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Iv128([u8; IV_LEN]);

impl Iv128 {
    pub fn from_bytes(bytes: [u8; IV_LEN]) -> Self {
        Self(bytes)
    }

    /// # Errors
    ///
    /// Returns [`CipherError::InvalidIvLength`] unless `bytes` is 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CipherError> {
        let arr: [u8; IV_LEN] = bytes
            .try_into()
            .map_err(|_| CipherError::InvalidIvLength(bytes.len()))?;
        Ok(Self(arr))
    }

    pub fn random() -> Self {
        let mut bytes = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; IV_LEN] {
        &self.0
    }

    /// Return this counter advanced by `n`.
    #[must_use]
    pub fn add(self, n: u64) -> Self {
        Self::from_u128(self.to_u128().wrapping_add(u128::from(n)))
    }

    /// Return this counter moved back by `n`.
    #[must_use]
    pub fn sub(self, n: u64) -> Self {
        Self::from_u128(self.to_u128().wrapping_sub(u128::from(n)))
    }

    pub fn increment(&mut self) {
        *self = self.add(1);
    }

    pub fn decrement(&mut self) {
        *self = self.sub(1);
    }

    fn to_u128(self) -> u128 {
        u128::from_be_bytes(self.0)
    }

    fn from_u128(v: u128) -> Self {
        Self(v.to_be_bytes())
    }
}

impl fmt::Debug for Iv128 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Iv128({:032x})", self.to_u128())
    }
}
