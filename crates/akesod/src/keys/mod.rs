//! KEK and DEK key material.
//!
//! # Lifecycle
//!
//! Keys are supplied by the caller for a single operation or rotation job and
//! are never persisted or cached by the engine. [`KeyBytes`] zeroes itself on
//! drop and never prints its contents.

use std::path::Path;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{EngineError, StrategyTag};
use thiserror::Error;

use crate::crypto::{kdf, KEY_LEN};

/// Errors produced while loading or constructing key material.
#[derive(Debug, Error)]
pub enum KeyError {
    /// The key material has an unexpected length.
    #[error("key has invalid length: expected {KEY_LEN} bytes, got {0}")]
    InvalidLength(usize),

    #[error("failed to read key file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("invalid PEM key: {0}")]
    Pem(String),

    #[error("key derivation failed: {0}")]
    Derivation(String),

    #[error("invalid key encoding: {0}")]
    Encoding(String),

    #[error("provider key identifier is empty")]
    EmptyProviderKey,
}

impl From<KeyError> for EngineError {
    fn from(e: KeyError) -> Self {
        EngineError::Input(e.to_string())
    }
}

/// Fixed-size key buffer that holds exactly [`KEY_LEN`] bytes.
///
/// When this type is dropped, the memory is overwritten with zeroes to
/// minimise the window during which plaintext key material lives in RAM.
#[derive(Clone)]
pub struct KeyBytes(Box<[u8; KEY_LEN]>);

impl KeyBytes {
    /// # Errors
    ///
    /// Returns [`KeyError::InvalidLength`] unless `bytes` is [`KEY_LEN`] long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, KeyError> {
        if bytes.len() != KEY_LEN {
            return Err(KeyError::InvalidLength(bytes.len()));
        }
        let mut buf = Box::new([0u8; KEY_LEN]);
        buf.copy_from_slice(bytes);
        Ok(Self(buf))
    }

    /// Generate a fresh key from the OS CSPRNG.
    pub fn random() -> Self {
        use aes_gcm::aead::{rand_core::RngCore, OsRng};
        let mut buf = Box::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut buf[..]);
        Self(buf)
    }

    /// Decode a standard-base64 key, as carried in notification attributes.
    pub fn from_base64(encoded: &str) -> Result<Self, KeyError> {
        let mut raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| KeyError::Encoding(e.to_string()))?;
        let key = Self::from_slice(&raw);
        raw.iter_mut().for_each(|b| *b = 0);
        key
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.0[..])
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl Drop for KeyBytes {
    fn drop(&mut self) {
        self.0.iter_mut().for_each(|b| *b = 0);
    }
}

impl std::fmt::Debug for KeyBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material, not even in debug builds.
        f.write_str("KeyBytes([REDACTED])")
    }
}

/// A caller-supplied key for one side of an operation.
#[derive(Clone, Debug)]
pub enum KeyMaterial {
    /// Raw 32-byte key: a KEK for strawman, keywrap and akeso, or the
    /// customer-supplied key for csek.
    Raw(KeyBytes),
    /// Provider key identifier (e.g. a KMS key ARN) for cmek.
    ProviderKeyId(String),
}

impl KeyMaterial {
    /// Borrow the raw key, rejecting a provider key identifier.
    pub fn raw(&self, strategy: StrategyTag) -> Result<&KeyBytes, EngineError> {
        match self {
            KeyMaterial::Raw(k) => Ok(k),
            KeyMaterial::ProviderKeyId(_) => Err(EngineError::Input(format!(
                "{strategy} requires a raw {KEY_LEN}-byte key, got a provider key identifier"
            ))),
        }
    }

    /// Borrow the provider key identifier, rejecting raw key bytes.
    pub fn provider_key_id(&self, strategy: StrategyTag) -> Result<&str, EngineError> {
        match self {
            KeyMaterial::ProviderKeyId(id) => Ok(id),
            KeyMaterial::Raw(_) => Err(EngineError::Input(format!(
                "{strategy} requires a provider key identifier, got raw key bytes"
            ))),
        }
    }

    /// Load key material for `strategy` from a file.
    ///
    /// - cmek: the trimmed file contents are the provider key identifier.
    /// - otherwise, a PEM file is treated as an Ed25519 stage key and a KEK is
    ///   derived from it with `kdf_salt`; any other file must hold exactly
    ///   [`KEY_LEN`] raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`KeyError`] if the file cannot be read or has the wrong shape.
    pub fn load(path: &Path, strategy: StrategyTag, kdf_salt: &[u8]) -> Result<Self, KeyError> {
        let raw = std::fs::read(path).map_err(|e| KeyError::Io {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_file_bytes(raw, strategy, kdf_salt)
    }

    fn from_file_bytes(
        mut raw: Vec<u8>,
        strategy: StrategyTag,
        kdf_salt: &[u8],
    ) -> Result<Self, KeyError> {
        let result = if strategy == StrategyTag::Cmek {
            let id = String::from_utf8_lossy(&raw).trim().to_owned();
            if id.is_empty() {
                Err(KeyError::EmptyProviderKey)
            } else {
                Ok(KeyMaterial::ProviderKeyId(id))
            }
        } else if raw.starts_with(b"-----BEGIN ") {
            let text = String::from_utf8_lossy(&raw).into_owned();
            kdf::derive_kek_from_pem(&text, kdf_salt).map(KeyMaterial::Raw)
        } else {
            KeyBytes::from_slice(&raw).map(KeyMaterial::Raw)
        };
        raw.iter_mut().for_each(|b| *b = 0);
        result
    }
}
