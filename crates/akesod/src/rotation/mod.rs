//! Bucket-wide key rotation.
//!
//! A [`RotationJob`] names the objects to rotate and the keys to rotate
//! between. The [`Orchestrator`] runs the strategy's update for every object
//! with at most `concurrency_limit` updates in flight, collects every result
//! into one [`RotationReport`], and never lets one object's failure stop the
//! others.
//!
//! For akeso the orchestrator first generates the job DEK and installs a
//! metadata-update notification that carries it to the responder.

mod report;

pub use report::{ObjectFailure, RotationReport};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use common::{
    protocol::{EventType, NEW_DEK_ATTRIBUTE},
    EngineError,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::keys::{KeyBytes, KeyMaterial};
use crate::store::{list_all, NotificationConfig, ObjectStore};
use crate::strategy::{Strategy, UpdateKeys, UpdateOutcome};

/// One rotation trigger's worth of work.
#[derive(Debug, Clone)]
pub struct RotationJob {
    pub object_names: BTreeSet<String>,
    pub concurrency_limit: usize,
    pub old_key: KeyMaterial,
    pub new_key: KeyMaterial,
    pub strategy: Strategy,
}

impl RotationJob {
    /// Build a job over every object under `prefix`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Input`] for a zero concurrency limit; store errors from
    /// listing.
    pub async fn plan(
        store: &dyn ObjectStore,
        prefix: &str,
        strategy: Strategy,
        old_key: KeyMaterial,
        new_key: KeyMaterial,
        concurrency_limit: usize,
    ) -> Result<Self, EngineError> {
        if concurrency_limit == 0 {
            return Err(EngineError::Input(
                "concurrency limit must be at least 1".into(),
            ));
        }
        let object_names = list_all(store, prefix).await?.into_iter().collect();
        Ok(Self {
            object_names,
            concurrency_limit,
            old_key,
            new_key,
            strategy,
        })
    }
}

/// Keys shared by every task of a job; dropped when the last task ends.
struct JobKeys {
    strategy: Strategy,
    old: KeyMaterial,
    new: KeyMaterial,
    dek: Option<KeyBytes>,
}

impl JobKeys {
    fn update_keys(&self) -> UpdateKeys<'_> {
        UpdateKeys {
            old: &self.old,
            new: &self.new,
            dek: self.dek.as_ref(),
        }
    }
}

type TaskResult = (String, Result<UpdateOutcome, EngineError>);

/// Runs rotation jobs against one store.
pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    notification_topic: Option<String>,
}

impl Orchestrator {
    /// `notification_topic` is required for akeso jobs.
    pub fn new(store: Arc<dyn ObjectStore>, notification_topic: Option<String>) -> Self {
        Self {
            store,
            notification_topic,
        }
    }

    /// Rotate every object in `job`.
    ///
    /// Cancelling `cancel` stops dispatch; updates already running finish and
    /// are reported. Per-object failures are in the report, not the `Err`
    /// case; use [`RotationReport::into_result`] to fold them in.
    ///
    /// # Errors
    ///
    /// Only failures that prevent the job from starting: a zero concurrency
    /// limit, or (akeso) a missing topic or a failed notification setup.
    pub async fn run(
        &self,
        job: RotationJob,
        cancel: CancellationToken,
    ) -> Result<RotationReport, EngineError> {
        if job.concurrency_limit == 0 {
            return Err(EngineError::Input(
                "concurrency limit must be at least 1".into(),
            ));
        }

        let job_id = Uuid::new_v4();
        let started = Instant::now();
        let mut report = RotationReport::new(job_id, job.strategy.tag(), job.object_names.len());

        let dek = match job.strategy {
            Strategy::Akeso(_) => {
                let dek = KeyBytes::random();
                self.publish_dek(&dek).await?;
                Some(dek)
            }
            _ => None,
        };

        info!(
            %job_id,
            strategy = %job.strategy.tag(),
            objects = report.total,
            concurrency = job.concurrency_limit,
            "rotation started"
        );

        let keys = Arc::new(JobKeys {
            strategy: job.strategy,
            old: job.old_key,
            new: job.new_key,
            dek,
        });
        let semaphore = Arc::new(Semaphore::new(job.concurrency_limit));
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let mut names_by_task = HashMap::new();

        for name in job.object_names {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    report.cancelled = true;
                    break;
                }
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|_| EngineError::Internal("rotation semaphore closed".into()))?,
            };

            while let Some(joined) = tasks.try_join_next_with_id() {
                reap(&mut report, &mut names_by_task, joined);
            }

            let store = self.store.clone();
            let keys = keys.clone();
            let task_name = name.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let result = keys
                    .strategy
                    .update(&*store, &task_name, keys.update_keys())
                    .await;
                (task_name, result)
            });
            names_by_task.insert(handle.id(), name);
            report.dispatched += 1;
        }

        while let Some(joined) = tasks.join_next_with_id().await {
            reap(&mut report, &mut names_by_task, joined);
        }

        report.duration = started.elapsed();
        info!(
            %job_id,
            dispatched = report.dispatched,
            succeeded = report.succeeded(),
            failed = report.failures.len(),
            cancelled = report.cancelled,
            elapsed_ms = report.duration.as_millis() as u64,
            "rotation finished"
        );
        Ok(report)
    }

    async fn publish_dek(&self, dek: &KeyBytes) -> Result<(), EngineError> {
        let topic = self.notification_topic.as_deref().ok_or_else(|| {
            EngineError::Input("akeso rotation requires a notification topic".into())
        })?;
        let mut custom_attributes = BTreeMap::new();
        custom_attributes.insert(NEW_DEK_ATTRIBUTE.to_owned(), dek.to_base64());

        self.store
            .configure_change_notification(&NotificationConfig {
                topic: topic.to_owned(),
                event_type: EventType::ObjectMetadataUpdate,
                custom_attributes,
            })
            .await?;
        info!(topic = %topic, "rotation DEK published to change notifications");
        Ok(())
    }
}

fn reap(
    report: &mut RotationReport,
    names_by_task: &mut HashMap<tokio::task::Id, String>,
    joined: Result<(tokio::task::Id, TaskResult), tokio::task::JoinError>,
) {
    match joined {
        Ok((id, (name, result))) => {
            names_by_task.remove(&id);
            report.record(name, result);
        }
        Err(e) => {
            let name = names_by_task.remove(&e.id()).unwrap_or_default();
            warn!(object = %name, error = %e, "rotation task did not complete");
            report.record(name, Err(EngineError::Internal(e.to_string())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        ListPage, MemoryStore, Metadata, MockObjectStore, ObjectAttrs, Precondition,
        ProtectedObject, ServerSideEncryption, StoreError, VersionToken,
    };
    use crate::strategy::AkesoPolicy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Delegates to a [`MemoryStore`] and tracks concurrent `head` calls.
    struct CountingStore {
        inner: MemoryStore,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl CountingStore {
        fn new() -> Self {
            Self {
                inner: MemoryStore::new("b"),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ObjectStore for CountingStore {
        async fn head(
            &self,
            name: &str,
            sse: &ServerSideEncryption,
        ) -> Result<ObjectAttrs, StoreError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            let result = self.inner.head(name, sse).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }

        async fn get(
            &self,
            name: &str,
            sse: &ServerSideEncryption,
        ) -> Result<ProtectedObject, StoreError> {
            self.inner.get(name, sse).await
        }

        async fn put(
            &self,
            name: &str,
            payload: Vec<u8>,
            metadata: Metadata,
            sse: &ServerSideEncryption,
            precondition: &Precondition,
        ) -> Result<VersionToken, StoreError> {
            self.inner.put(name, payload, metadata, sse, precondition).await
        }

        async fn update_metadata(
            &self,
            name: &str,
            metadata: Metadata,
            expected: &VersionToken,
        ) -> Result<VersionToken, StoreError> {
            self.inner.update_metadata(name, metadata, expected).await
        }

        async fn rewrite_key(
            &self,
            name: &str,
            from: &ServerSideEncryption,
            to: &ServerSideEncryption,
            expected: &VersionToken,
        ) -> Result<VersionToken, StoreError> {
            self.inner.rewrite_key(name, from, to, expected).await
        }

        async fn list_page(
            &self,
            prefix: &str,
            page_token: Option<String>,
        ) -> Result<ListPage, StoreError> {
            self.inner.list_page(prefix, page_token).await
        }

        async fn configure_change_notification(
            &self,
            config: &NotificationConfig,
        ) -> Result<(), StoreError> {
            self.inner.configure_change_notification(config).await
        }
    }

    fn raw() -> KeyMaterial {
        KeyMaterial::Raw(KeyBytes::random())
    }

    async fn seed(store: &dyn ObjectStore, strategy: Strategy, key: &KeyMaterial, n: usize) {
        for i in 0..n {
            strategy
                .upload(store, &format!("obj-{i:03}"), b"payload", key)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn bounded_concurrency_and_completion() {
        let store = Arc::new(CountingStore::new());
        let (old, new) = (raw(), raw());
        seed(&*store, Strategy::KeyWrap, &old, 24).await;

        let job = RotationJob::plan(&*store, "", Strategy::KeyWrap, old, new.clone(), 4)
            .await
            .unwrap();
        let orchestrator = Orchestrator::new(store.clone(), None);
        let report = orchestrator
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.total, 24);
        assert_eq!(report.dispatched, 24);
        assert_eq!(report.outcomes["rewrapped"], 24);
        assert!(report.failures.is_empty());
        let max = store.max_in_flight.load(Ordering::SeqCst);
        assert!(max <= 4, "max in flight {max}");
        assert!(max >= 1);

        for i in 0..24 {
            let name = format!("obj-{i:03}");
            assert_eq!(
                Strategy::KeyWrap.download(&*store, &name, &new).await.unwrap(),
                b"payload"
            );
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_siblings() {
        let store = Arc::new(MemoryStore::new("b"));
        let (old, new) = (raw(), raw());
        seed(&*store, Strategy::Strawman, &old, 5).await;
        // One object under another strategy.
        Strategy::KeyWrap
            .upload(&*store, "odd-one", b"x", &old)
            .await
            .unwrap();

        let job = RotationJob::plan(&*store, "", Strategy::Strawman, old, new, 2)
            .await
            .unwrap();
        let report = Orchestrator::new(store.clone(), None)
            .run(job, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.succeeded(), 5);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].name, "odd-one");
        assert!(matches!(
            report.failures[0].error,
            EngineError::ProtocolMismatch { .. }
        ));
        assert!(matches!(
            report.into_result(),
            Err(EngineError::PartialRotationFailure { failed: 1, total: 6 })
        ));
    }

    #[tokio::test]
    async fn cancelled_before_start_dispatches_nothing() {
        let store = Arc::new(MemoryStore::new("b"));
        let (old, new) = (raw(), raw());
        seed(&*store, Strategy::Strawman, &old, 3).await;
        let job = RotationJob::plan(&*store, "", Strategy::Strawman, old, new, 2)
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = Orchestrator::new(store.clone(), None)
            .run(job, cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.dispatched, 0);
        assert_eq!(report.skipped(), 3);
    }

    #[tokio::test]
    async fn akeso_requires_topic() {
        let store = Arc::new(MemoryStore::new("b"));
        let job = RotationJob {
            object_names: BTreeSet::new(),
            concurrency_limit: 1,
            old_key: raw(),
            new_key: raw(),
            strategy: Strategy::Akeso(AkesoPolicy::default()),
        };
        let err = Orchestrator::new(store, None)
            .run(job, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[tokio::test]
    async fn akeso_dek_is_published_before_dispatch() {
        let mut store = MockObjectStore::new();
        store
            .expect_configure_change_notification()
            .withf(|config| {
                config.topic == "rotation"
                    && config.event_type == EventType::ObjectMetadataUpdate
                    && config
                        .custom_attributes
                        .get(NEW_DEK_ATTRIBUTE)
                        .is_some_and(|v| KeyBytes::from_base64(v).is_ok())
            })
            .times(1)
            .returning(|_| Err(StoreError::Unsupported("no attributes".into())));
        // No update may run when the DEK could not be published.
        store.expect_head().never();
        store.expect_get().never();

        let mut object_names = BTreeSet::new();
        object_names.insert("o".to_string());
        let job = RotationJob {
            object_names,
            concurrency_limit: 1,
            old_key: raw(),
            new_key: raw(),
            strategy: Strategy::Akeso(AkesoPolicy::default()),
        };
        let err = Orchestrator::new(Arc::new(store), Some("rotation".into()))
            .run(job, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Input(_)));
    }

    #[tokio::test]
    async fn plan_rejects_zero_concurrency() {
        let store = MemoryStore::new("b");
        assert!(matches!(
            RotationJob::plan(&store, "", Strategy::Strawman, raw(), raw(), 0).await,
            Err(EngineError::Input(_))
        ));
    }
}
