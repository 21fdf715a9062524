//! Configuration loading and validation for the responder service.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated responder configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// TCP port the push endpoint listens on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bucket whose notifications this instance handles. **Required.**
    pub bucket: String,

    /// Custom S3 endpoint (MinIO, LocalStack).
    #[serde(default)]
    pub s3_endpoint_url: Option<String>,

    /// Tracing log level.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".into()
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .context("failed to build responder configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise responder configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("PORT must be non-zero");
        }
        if self.bucket.trim().is_empty() {
            anyhow::bail!("BUCKET is required and must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            port: default_port(),
            bucket: "protected-objects".into(),
            s3_endpoint_url: None,
            log_level: default_log_level(),
        }
    }

    #[test]
    fn defaults() {
        assert_eq!(default_port(), 8080);
        assert_eq!(default_log_level(), "info");
    }

    #[test]
    fn validate_rejects_zero_port() {
        let cfg = Config { port: 0, ..valid() };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_bucket() {
        let cfg = Config {
            bucket: "  ".into(),
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_valid_config() {
        assert!(valid().validate().is_ok());
    }
}
