//! `akeso-responder` binary entry point.
//!
//! Startup sequence:
//! 1. Load and validate [`Config`](config::Config) from environment variables.
//! 2. Initialise structured JSON logging.
//! 3. Initialise the S3 store for the configured bucket.
//! 4. Serve the push endpoint until interrupted.

mod config;
mod server;
mod telemetry;

use std::sync::Arc;

use anyhow::Result;
use akesod::store::S3Store;
use tracing::info;

use server::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = config::Config::from_env().map_err(|e| {
        eprintln!("ERROR: akeso-responder configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    telemetry::init(&cfg.log_level)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = cfg.port,
        bucket = %cfg.bucket,
        "akeso-responder starting"
    );

    // -----------------------------------------------------------------------
    // 3. Object store
    // -----------------------------------------------------------------------
    let store = S3Store::init(&cfg.bucket, cfg.s3_endpoint_url.as_deref()).await?;

    // -----------------------------------------------------------------------
    // 4. HTTP server
    // -----------------------------------------------------------------------
    let state = AppState::new(Arc::new(store), cfg.bucket.clone());
    server::serve(state, cfg.port).await
}
