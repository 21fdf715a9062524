//! Cipher primitives for object protection.
//!
//! This module is intentionally free of store and HTTP dependencies.
//!
//! - [`cipher`]: AES-256-GCM with detached tags (payload encryption).
//! - [`wrap`]: AES-256-GCM-SIV sealing of headers and keys under a KEK.
//! - [`ctr`]: AES-256-CTR layers applied over stored ciphertext.
//! - [`iv`]: the 128-bit big-endian CTR counter.
//! - [`kdf`]: KEK derivation from Ed25519 key material.

pub mod cipher;
pub mod ctr;
pub mod iv;
pub mod kdf;
pub mod wrap;

pub use cipher::{CipherError, KEY_LEN, NONCE_LEN, TAG_LEN};
pub use iv::Iv128;
