//! Configuration loading and validation for `akesod`.
//!
//! Values come from an optional YAML file, overridden by `AKESOD_*`
//! environment variables (`AKESOD_BUCKET`, `AKESOD_MAX_LAYERS`, ...).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::strategy::AkesoPolicy;

/// Validated engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Bucket holding the protected objects. **Required.**
    pub bucket: String,

    /// Only objects under this prefix take part in rotations.
    #[serde(default)]
    pub prefix: String,

    /// Custom S3 endpoint (MinIO, LocalStack).
    #[serde(default)]
    pub s3_endpoint_url: Option<String>,

    /// Topic that metadata-update notifications are published to. Required
    /// for akeso rotations.
    #[serde(default)]
    pub notification_topic: Option<String>,

    /// CTR layers an akeso object may carry before a rotation compacts it.
    #[serde(default = "default_max_layers")]
    pub max_layers: usize,

    /// Object updates in flight during a rotation.
    #[serde(default = "default_max_concurrent_updates")]
    pub max_concurrent_updates: usize,

    /// HKDF salt used when a KEK is derived from a PEM stage key.
    #[serde(default)]
    pub kdf_salt: String,

    /// Tracing log level (e.g. `"info"`, `"debug"`).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// OTLP collector endpoint. Spans are only exported when set.
    #[serde(default)]
    pub otel_exporter_otlp_endpoint: Option<String>,
}

fn default_max_layers() -> usize {
    crate::strategy::akeso::DEFAULT_MAX_LAYERS
}
fn default_max_concurrent_updates() -> usize {
    16
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from `file` (if any) and the
    /// environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a value cannot be parsed,
    /// or validation fails.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("AKESOD"))
            .build()
            .context("failed to build akesod configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise akesod configuration")?;

        c.validate()?;
        Ok(c)
    }

    pub fn akeso_policy(&self) -> AkesoPolicy {
        AkesoPolicy::new(self.max_layers)
    }

    fn validate(&self) -> Result<()> {
        ensure_non_empty(&self.bucket, "AKESOD_BUCKET")?;
        if self.max_concurrent_updates == 0 {
            anyhow::bail!("AKESOD_MAX_CONCURRENT_UPDATES must be > 0");
        }
        if let Some(topic) = &self.notification_topic {
            ensure_non_empty(topic, "AKESOD_NOTIFICATION_TOPIC")?;
        }
        if let Some(url) = &self.s3_endpoint_url {
            ensure_non_empty(url, "AKESOD_S3_ENDPOINT_URL")?;
        }
        Ok(())
    }
}

fn ensure_non_empty(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        anyhow::bail!("{name} is required and must not be empty");
    }
    Ok(())
}
