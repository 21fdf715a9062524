//! The Akeso header: the DEK chain of one object, sealed under the bucket KEK.
//!
//! # Binary layout (before sealing)
//!
//! ```text
//! version (1) | base_iv (16) | data_tag (16) | count (2, BE) | deks (32 × count)
//! ```
//!
//! `deks[0]` encrypted the payload with AES-GCM under the zero nonce, and
//! `data_tag` is that encryption's tag. Every later `deks[i]` is one virtual
//! rotation: a CTR layer at [`layer_iv`]`(base_iv, i)` over the stored bytes.
//!
//! The encoded header is sealed with [`crate::crypto::wrap`] and stored in
//! object metadata as text. Opening it with the wrong KEK fails
//! authentication; it never decodes garbage.

pub mod pipeline;

pub use pipeline::{Layer, LayerPipeline};

use common::EngineError;
use thiserror::Error;

use crate::crypto::{iv::IV_LEN, wrap, CipherError, Iv128, KEY_LEN, TAG_LEN};
use crate::keys::KeyBytes;

const FORMAT_VERSION: u8 = 1;
const FIXED_LEN: usize = 1 + IV_LEN + TAG_LEN + 2;

/// Errors decoding or growing a header.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HeaderError {
    #[error("unsupported header version {0}")]
    UnsupportedVersion(u8),

    #[error("header truncated")]
    Truncated,

    #[error("header has {0} trailing bytes")]
    TrailingBytes(usize),

    #[error("header carries no DEKs")]
    Empty,

    #[error("header DEK chain is full")]
    TooManyDeks,

    #[error("{applied} layers requested but the header records only {recorded}")]
    LayerCount { applied: usize, recorded: usize },
}

impl From<HeaderError> for EngineError {
    fn from(e: HeaderError) -> Self {
        EngineError::Input(e.to_string())
    }
}

/// IV of CTR layer `index` (`index ≥ 1`, i.e. `deks[index]`).
///
/// Layer 1 sits at the base IV; the newest layer of a chain of `n` DEKs sits
/// at `base_iv + (n - 2)`.
pub fn layer_iv(base_iv: Iv128, index: usize) -> Iv128 {
    debug_assert!(index >= 1, "layer 0 is the GCM layer");
    base_iv.add(index.saturating_sub(1) as u64)
}

/// Decoded Akeso header.
#[derive(Clone, Debug)]
pub struct AkesoHeader {
    base_iv: Iv128,
    data_tag: [u8; TAG_LEN],
    deks: Vec<KeyBytes>,
}

impl AkesoHeader {
    /// A fresh header for a newly encrypted object.
    pub fn new(base_iv: Iv128, data_tag: [u8; TAG_LEN], dek: KeyBytes) -> Self {
        Self {
            base_iv,
            data_tag,
            deks: vec![dek],
        }
    }

    pub fn base_iv(&self) -> Iv128 {
        self.base_iv
    }

    pub fn data_tag(&self) -> &[u8; TAG_LEN] {
        &self.data_tag
    }

    pub fn deks(&self) -> &[KeyBytes] {
        &self.deks
    }

    /// Number of DEKs, i.e. rotation generations since the last compaction plus one.
    pub fn len(&self) -> usize {
        self.deks.len()
    }

    /// Always `false`; a header holds at least the GCM key.
    pub fn is_empty(&self) -> bool {
        self.deks.is_empty()
    }

    /// Number of CTR layers the chain describes (`len - 1`).
    pub fn layer_count(&self) -> usize {
        self.deks.len() - 1
    }

    /// Append the DEK of a new virtual rotation.
    pub fn push_dek(&mut self, dek: KeyBytes) -> Result<(), HeaderError> {
        if self.deks.len() >= usize::from(u16::MAX) {
            return Err(HeaderError::TooManyDeks);
        }
        self.deks.push(dek);
        Ok(())
    }

    /// Serialise to the binary layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FIXED_LEN + self.deks.len() * KEY_LEN);
        out.push(FORMAT_VERSION);
        out.extend_from_slice(self.base_iv.as_bytes());
        out.extend_from_slice(&self.data_tag);
        // push_dek keeps the count within u16.
        out.extend_from_slice(&(self.deks.len() as u16).to_be_bytes());
        for dek in &self.deks {
            out.extend_from_slice(dek.as_bytes());
        }
        out
    }

    /// Parse the binary layout.
    pub fn decode(bytes: &[u8]) -> Result<Self, HeaderError> {
        if bytes.len() < FIXED_LEN {
            return Err(HeaderError::Truncated);
        }
        if bytes[0] != FORMAT_VERSION {
            return Err(HeaderError::UnsupportedVersion(bytes[0]));
        }

        let mut offset = 1;
        let base_iv = Iv128::from_slice(&bytes[offset..offset + IV_LEN])
            .map_err(|_| HeaderError::Truncated)?;
        offset += IV_LEN;

        let mut data_tag = [0u8; TAG_LEN];
        data_tag.copy_from_slice(&bytes[offset..offset + TAG_LEN]);
        offset += TAG_LEN;

        let count = usize::from(u16::from_be_bytes([bytes[offset], bytes[offset + 1]]));
        offset += 2;
        if count == 0 {
            return Err(HeaderError::Empty);
        }

        let expected = offset + count * KEY_LEN;
        if bytes.len() < expected {
            return Err(HeaderError::Truncated);
        }
        if bytes.len() > expected {
            return Err(HeaderError::TrailingBytes(bytes.len() - expected));
        }

        let deks = bytes[offset..]
            .chunks_exact(KEY_LEN)
            .map(|chunk| KeyBytes::from_slice(chunk).map_err(|_| HeaderError::Truncated))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            base_iv,
            data_tag,
            deks,
        })
    }

    /// Seal the header under `kek`, returning the metadata text form.
    pub fn seal(&self, kek: &KeyBytes) -> Result<String, CipherError> {
        let mut plain = self.encode();
        let sealed = wrap::seal(&plain, kek.as_bytes());
        plain.iter_mut().for_each(|b| *b = 0);
        Ok(sealed?.to_string_repr())
    }

    /// Open a sealed header with `kek`.
    ///
    /// # Errors
    ///
    /// Any unwrap failure (wrong KEK, modified text, malformed encoding) is an
    /// [`EngineError::AuthenticationFailure`].
    pub fn open(kek: &KeyBytes, sealed: &str) -> Result<Self, EngineError> {
        let unwrap_failed =
            |e: CipherError| EngineError::AuthenticationFailure(format!("header unwrap failed: {e}"));

        let blob = wrap::SealedBlob::parse(sealed).map_err(unwrap_failed)?;
        let mut plain = wrap::open(&blob, kek.as_bytes()).map_err(unwrap_failed)?;
        let header = Self::decode(&plain);
        plain.iter_mut().for_each(|b| *b = 0);
        Ok(header?)
    }
}
