//! Object protection strategies and key rotation for a single bucket.
//!
//! - [`strategy`]: the five protection schemes behind upload, download and
//!   update.
//! - [`header`]: the Akeso header codec and its CTR layer pipeline.
//! - [`rotation`]: bounded-concurrency, bucket-wide rotation jobs.
//! - [`responder`]: the physical re-encryption pass triggered by metadata
//!   change notifications.
//! - [`store`]: the object-store seam, with in-memory and S3 backends.

pub mod cli;
pub mod config;
pub mod crypto;
pub mod header;
pub mod keys;
pub mod responder;
pub mod rotation;
pub mod store;
pub mod strategy;
pub mod telemetry;
