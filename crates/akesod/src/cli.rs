//! `akesod` command line.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use common::{EngineError, StrategyTag};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::keys::KeyMaterial;
use crate::rotation::{Orchestrator, RotationJob, RotationReport};
use crate::store::{ObjectStore, S3Store};
use crate::strategy::Strategy;

/// Object encryption and key rotation for a single bucket.
#[derive(Parser, Debug)]
#[command(name = "akesod")]
#[command(version)]
#[command(about = "Protect objects with one of five strategies and rotate their keys")]
pub struct Cli {
    /// YAML configuration file; `AKESOD_*` environment variables override it.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Protect a local file and store it as a new object.
    Upload {
        #[arg(long)]
        strategy: StrategyTag,
        /// Key file: 32 raw bytes, a PEM stage key, or (cmek) a provider key id.
        #[arg(long)]
        key: PathBuf,
        /// Local file to upload.
        #[arg(long)]
        src: PathBuf,
        /// Destination object name.
        #[arg(long)]
        object: String,
    },
    /// Read an object and write its plaintext to a file or stdout.
    Download {
        #[arg(long)]
        strategy: StrategyTag,
        #[arg(long)]
        key: PathBuf,
        #[arg(long)]
        object: String,
        /// Output file; stdout when omitted.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Rotate a single object from the old key to the new key.
    Update {
        #[arg(long)]
        strategy: StrategyTag,
        #[arg(long)]
        old_key: PathBuf,
        #[arg(long)]
        new_key: PathBuf,
        #[arg(long)]
        object: String,
    },
    /// Rotate every object under the configured prefix.
    Rotate {
        #[arg(long)]
        strategy: StrategyTag,
        #[arg(long)]
        old_key: PathBuf,
        #[arg(long)]
        new_key: PathBuf,
        /// Overrides `prefix` from the configuration.
        #[arg(long)]
        prefix: Option<String>,
        /// Overrides `max_concurrent_updates` from the configuration.
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

/// Exit code for a failed run: the engine's code when the failure is an
/// [`EngineError`], `1` otherwise.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<EngineError>()
        .map_or(1, EngineError::exit_code)
}

/// Run `command` against the S3 bucket named in `cfg`.
///
/// # Errors
///
/// Returns an error if the store cannot be initialised or the command fails.
pub async fn run(command: Command, cfg: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn ObjectStore> =
        Arc::new(S3Store::init(&cfg.bucket, cfg.s3_endpoint_url.as_deref()).await?);

    let cancel = CancellationToken::new();
    if matches!(command, Command::Rotate { .. }) {
        let on_signal = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping rotation dispatch");
                on_signal.cancel();
            }
        });
    }

    execute(command, cfg, store, cancel).await?;
    Ok(())
}

/// Run `command` against `store`.
///
/// # Errors
///
/// The command's [`EngineError`]. A `rotate` that did not rotate every object
/// fails with [`EngineError::PartialRotationFailure`].
pub async fn execute(
    command: Command,
    cfg: &Config,
    store: Arc<dyn ObjectStore>,
    cancel: CancellationToken,
) -> Result<(), EngineError> {
    let salt = cfg.kdf_salt.as_bytes();
    let policy = cfg.akeso_policy();

    match command {
        Command::Upload {
            strategy,
            key,
            src,
            object,
        } => {
            let key = KeyMaterial::load(&key, strategy, salt)?;
            let payload = read_local(&src).await?;
            let version = Strategy::from_tag(strategy, policy)
                .upload(store.as_ref(), &object, &payload, &key)
                .await?;
            info!(object = %object, version = %version, bytes = payload.len(), "uploaded");
        }
        Command::Download {
            strategy,
            key,
            object,
            out,
        } => {
            let key = KeyMaterial::load(&key, strategy, salt)?;
            let plaintext = Strategy::from_tag(strategy, policy)
                .download(store.as_ref(), &object, &key)
                .await?;
            write_output(out.as_deref(), &plaintext).await?;
        }
        Command::Update {
            strategy,
            old_key,
            new_key,
            object,
        } => {
            ensure_layer_delivery(strategy, store.as_ref())?;
            let job = RotationJob {
                object_names: BTreeSet::from([object]),
                concurrency_limit: 1,
                old_key: KeyMaterial::load(&old_key, strategy, salt)?,
                new_key: KeyMaterial::load(&new_key, strategy, salt)?,
                strategy: Strategy::from_tag(strategy, policy),
            };
            let mut report = Orchestrator::new(store, cfg.notification_topic.clone())
                .run(job, cancel)
                .await?;
            if let Some(failure) = report.failures.pop() {
                return Err(failure.error);
            }
        }
        Command::Rotate {
            strategy,
            old_key,
            new_key,
            prefix,
            concurrency,
        } => {
            ensure_layer_delivery(strategy, store.as_ref())?;
            let job = RotationJob::plan(
                store.as_ref(),
                prefix.as_deref().unwrap_or(&cfg.prefix),
                Strategy::from_tag(strategy, policy),
                KeyMaterial::load(&old_key, strategy, salt)?,
                KeyMaterial::load(&new_key, strategy, salt)?,
                concurrency.unwrap_or(cfg.max_concurrent_updates),
            )
            .await?;
            let report = Orchestrator::new(store, cfg.notification_topic.clone())
                .run(job, cancel)
                .await?;
            print_summary(&report).await?;
            report.into_result()?;
        }
    }
    Ok(())
}

/// Akeso rotation hands the new layer's DEK to the responder through the
/// store's change notifications. Refuse it up front on a store that cannot
/// attach it.
fn ensure_layer_delivery(
    strategy: StrategyTag,
    store: &dyn ObjectStore,
) -> Result<(), EngineError> {
    if strategy == StrategyTag::Akeso && !store.notifications_carry_attributes() {
        return Err(EngineError::Input(
            "akeso rotation needs change notifications that carry custom attributes; \
             this store has none"
                .into(),
        ));
    }
    Ok(())
}

async fn read_local(path: &Path) -> Result<Vec<u8>, EngineError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| EngineError::Input(format!("cannot read {}: {e}", path.display())))
}

async fn write_output(path: Option<&Path>, bytes: &[u8]) -> Result<(), EngineError> {
    let result = match path {
        Some(path) => tokio::fs::write(path, bytes).await,
        None => {
            let mut stdout = tokio::io::stdout();
            match stdout.write_all(bytes).await {
                Ok(()) => stdout.flush().await,
                Err(e) => Err(e),
            }
        }
    };
    result.map_err(|e| EngineError::Input(format!("cannot write output: {e}")))
}

fn summary(report: &RotationReport) -> serde_json::Value {
    let failures: Vec<_> = report
        .failures
        .iter()
        .map(|f| serde_json::json!({ "object": f.name, "error": f.error.to_string() }))
        .collect();
    serde_json::json!({
        "job_id": report.job_id.to_string(),
        "strategy": report.strategy,
        "total": report.total,
        "succeeded": report.succeeded(),
        "outcomes": report.outcomes,
        "failures": failures,
        "skipped": report.skipped(),
        "cancelled": report.cancelled,
        "duration_ms": report.duration.as_millis() as u64,
    })
}

async fn print_summary(report: &RotationReport) -> Result<(), EngineError> {
    let mut line = serde_json::to_vec_pretty(&summary(report))
        .map_err(|e| EngineError::Internal(format!("cannot encode rotation summary: {e}")))?;
    line.push(b'\n');
    write_output(None, &line).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyBytes;
    use crate::store::{MemoryStore, MockObjectStore, StoreError};

    fn config() -> Config {
        Config {
            bucket: "cli-test".into(),
            prefix: String::new(),
            s3_endpoint_url: None,
            notification_topic: Some("rotation-topic".into()),
            max_layers: 3,
            max_concurrent_updates: 4,
            kdf_salt: String::new(),
            log_level: "info".into(),
            otel_exporter_otlp_endpoint: None,
        }
    }

    struct Scratch(PathBuf);

    impl Scratch {
        fn new(tag: &str) -> Self {
            let dir = std::env::temp_dir().join(format!(
                "akesod-cli-{tag}-{}-{}",
                std::process::id(),
                uuid::Uuid::new_v4()
            ));
            std::fs::create_dir_all(&dir).unwrap();
            Self(dir)
        }

        fn key(&self, name: &str) -> PathBuf {
            let path = self.0.join(name);
            std::fs::write(&path, KeyBytes::random().as_bytes()).unwrap();
            path
        }

        fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
            let path = self.0.join(name);
            std::fs::write(&path, contents).unwrap();
            path
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            std::fs::remove_dir_all(&self.0).ok();
        }
    }

    #[test]
    fn parses_rotate_arguments() {
        let cli = Cli::try_parse_from([
            "akesod",
            "--config",
            "akesod.yaml",
            "rotate",
            "--strategy",
            "akeso",
            "--old-key",
            "old.key",
            "--new-key",
            "new.key",
            "--concurrency",
            "8",
        ])
        .unwrap();
        assert_eq!(cli.config.as_deref(), Some(Path::new("akesod.yaml")));
        match cli.command {
            Command::Rotate {
                strategy,
                concurrency,
                prefix,
                ..
            } => {
                assert_eq!(strategy, StrategyTag::Akeso);
                assert_eq!(concurrency, Some(8));
                assert!(prefix.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_strategy() {
        let err = Cli::try_parse_from([
            "akesod", "upload", "--strategy", "rot13", "--key", "k", "--src", "s", "--object",
            "o",
        ])
        .unwrap_err();
        assert!(err.to_string().contains("rot13"));
    }

    #[test]
    fn exit_code_follows_engine_error() {
        let err = anyhow::Error::new(EngineError::ProtocolMismatch {
            expected: "csek".into(),
            found: "akeso".into(),
        });
        assert_eq!(exit_code(&err), 4);
        assert_eq!(exit_code(&anyhow::anyhow!("config missing")), 1);
    }

    #[tokio::test]
    async fn upload_update_download_through_commands() {
        let scratch = Scratch::new("flow");
        let cfg = config();
        let store = Arc::new(MemoryStore::new("cli-test"));
        let old_key = scratch.key("old.key");
        let new_key = scratch.key("new.key");
        let src = scratch.file("hello.txt", b"hello world");
        let out = scratch.0.join("out.txt");

        execute(
            Command::Upload {
                strategy: StrategyTag::Keywrap,
                key: old_key.clone(),
                src,
                object: "docs/hello.txt".into(),
            },
            &cfg,
            store.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        execute(
            Command::Update {
                strategy: StrategyTag::Keywrap,
                old_key: old_key.clone(),
                new_key: new_key.clone(),
                object: "docs/hello.txt".into(),
            },
            &cfg,
            store.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        execute(
            Command::Download {
                strategy: StrategyTag::Keywrap,
                key: new_key,
                object: "docs/hello.txt".into(),
                out: Some(out.clone()),
            },
            &cfg,
            store.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"hello world");

        let err = execute(
            Command::Download {
                strategy: StrategyTag::Keywrap,
                key: old_key,
                object: "docs/hello.txt".into(),
                out: Some(out),
            },
            &cfg,
            store,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::AuthenticationFailure(_)));
    }

    #[tokio::test]
    async fn update_surfaces_the_object_error() {
        let scratch = Scratch::new("update-err");
        let cfg = config();
        let store = Arc::new(MemoryStore::new("cli-test"));
        let err = execute(
            Command::Update {
                strategy: StrategyTag::Strawman,
                old_key: scratch.key("old.key"),
                new_key: scratch.key("new.key"),
                object: "missing".into(),
            },
            &cfg,
            store,
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn akeso_rotation_is_refused_without_attribute_delivery() {
        let scratch = Scratch::new("akeso-refused");
        let cfg = config();
        let commands = [
            Command::Update {
                strategy: StrategyTag::Akeso,
                old_key: scratch.key("old.key"),
                new_key: scratch.key("new.key"),
                object: "doc".into(),
            },
            Command::Rotate {
                strategy: StrategyTag::Akeso,
                old_key: scratch.0.join("missing-old.key"),
                new_key: scratch.0.join("missing-new.key"),
                prefix: None,
                concurrency: None,
            },
        ];
        for command in commands {
            let mut store = MockObjectStore::new();
            store
                .expect_notifications_carry_attributes()
                .returning(|| false);
            store.expect_configure_change_notification().never();
            store.expect_list_page().never();
            store.expect_head().never();
            store.expect_get().never();

            let err = execute(command, &cfg, Arc::new(store), CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(err, EngineError::Input(_)), "{err:?}");
            assert!(err.to_string().contains("custom attributes"), "{err}");
        }
    }

    #[tokio::test]
    async fn other_strategies_rotate_without_attribute_delivery() {
        let scratch = Scratch::new("keywrap-no-attrs");
        let mut store = MockObjectStore::new();
        store
            .expect_notifications_carry_attributes()
            .returning(|| false);
        store
            .expect_head()
            .returning(|name, _| Err(StoreError::NotFound(name.into())));

        let err = execute(
            Command::Update {
                strategy: StrategyTag::Keywrap,
                old_key: scratch.key("old.key"),
                new_key: scratch.key("new.key"),
                object: "doc".into(),
            },
            &config(),
            Arc::new(store),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)), "{err:?}");
    }

    #[tokio::test]
    async fn missing_source_file_is_input_error() {
        let scratch = Scratch::new("missing-src");
        let cfg = config();
        let err = execute(
            Command::Upload {
                strategy: StrategyTag::Strawman,
                key: scratch.key("k"),
                src: scratch.0.join("nope"),
                object: "o".into(),
            },
            &cfg,
            Arc::new(MemoryStore::new("cli-test")),
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn summary_lists_failures() {
        let mut report = RotationReport::new(uuid::Uuid::new_v4(), StrategyTag::Csek, 2);
        report.dispatched = 2;
        report.record("a".into(), Ok(crate::strategy::UpdateOutcome::Rekeyed));
        report.record("b".into(), Err(EngineError::NotFound("b".into())));
        let value = summary(&report);
        assert_eq!(value["strategy"], "csek");
        assert_eq!(value["succeeded"], 1);
        assert_eq!(value["outcomes"]["rekeyed"], 1);
        assert_eq!(value["failures"][0]["object"], "b");
    }
}
