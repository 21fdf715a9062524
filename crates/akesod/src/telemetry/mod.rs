//! Structured logging and optional OTLP span export.
//!
//! # Telemetry invariants
//!
//! - **No key material** appears in any span attribute or log field. Keys are
//!   only ever logged through [`KeyBytes`](crate::keys::KeyBytes)'s redacting
//!   `Debug`.
//! - Log level comes from `log_level` in the configuration (default `info`);
//!   `RUST_LOG` overrides it.
//! - Logs go to stderr so `akesod download` can stream plaintext on stdout.

pub mod init;

pub use init::{init_telemetry, shutdown_telemetry};
