//! In-process [`ObjectStore`] with change notifications.
//!
//! Objects live in a `tokio::sync::RwLock<BTreeMap>`. Every write bumps a
//! store-wide generation counter whose value is the object's
//! [`VersionToken`]. Server-side encryption is modelled by access control
//! only: a customer key is remembered as its SHA-256 digest and must be
//! presented to read the payload, a provider key is recorded and reported
//! back. Metadata can be read without a key.
//!
//! When a [`NotificationConfig`] is installed for an event type, matching
//! writes publish a [`ChangeEvent`] on a broadcast channel; see
//! [`MemoryStore::subscribe`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use common::protocol::{ChangeEvent, EventType};
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use super::{
    ListPage, Metadata, NotificationConfig, ObjectAttrs, ObjectStore, Precondition,
    ProtectedObject, ServerSideEncryption, StoreError, VersionToken,
};

const DEFAULT_PAGE_SIZE: usize = 1000;
const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredEncryption {
    None,
    Customer([u8; 32]),
    Provider(String),
}

impl StoredEncryption {
    fn from_request(sse: &ServerSideEncryption) -> Self {
        match sse {
            ServerSideEncryption::None => StoredEncryption::None,
            ServerSideEncryption::CustomerKey(k) => StoredEncryption::Customer(key_digest(k)),
            ServerSideEncryption::ProviderKey(id) => StoredEncryption::Provider(id.clone()),
        }
    }

    fn provider_key(&self) -> Option<String> {
        match self {
            StoredEncryption::Provider(id) => Some(id.clone()),
            _ => None,
        }
    }
}

fn key_digest(key: &crate::keys::KeyBytes) -> [u8; 32] {
    Sha256::digest(key.as_bytes()).into()
}

#[derive(Debug, Clone)]
struct Entry {
    payload: Vec<u8>,
    metadata: Metadata,
    generation: u64,
    encryption: StoredEncryption,
}

impl Entry {
    fn version(&self) -> VersionToken {
        VersionToken(self.generation.to_string())
    }

    /// A customer-keyed object is readable only with its key; presenting a
    /// customer key for any other object is also an error.
    fn check_access(&self, name: &str, sse: &ServerSideEncryption) -> Result<(), StoreError> {
        match (&self.encryption, sse) {
            (StoredEncryption::Customer(digest), ServerSideEncryption::CustomerKey(k))
                if *digest == key_digest(k) =>
            {
                Ok(())
            }
            (StoredEncryption::Customer(_), _) | (_, ServerSideEncryption::CustomerKey(_)) => {
                Err(StoreError::KeyMismatch(name.to_owned()))
            }
            _ => Ok(()),
        }
    }

    fn check_version(&self, name: &str, expected: &VersionToken) -> Result<(), StoreError> {
        if self.version() != *expected {
            return Err(StoreError::PreconditionFailed(name.to_owned()));
        }
        Ok(())
    }
}

/// In-memory object store for one bucket.
pub struct MemoryStore {
    bucket: String,
    objects: RwLock<BTreeMap<String, Entry>>,
    generation: AtomicU64,
    page_size: usize,
    notifications: ArcSwap<Vec<NotificationConfig>>,
    events: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            bucket: bucket.into(),
            objects: RwLock::new(BTreeMap::new()),
            generation: AtomicU64::new(0),
            page_size: DEFAULT_PAGE_SIZE,
            notifications: ArcSwap::from_pointee(Vec::new()),
            events,
        }
    }

    /// Override the listing page size.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Receive change events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Raw stored payload, bypassing access checks.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn raw_payload(&self, name: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(name).map(|e| e.payload.clone())
    }

    /// Overwrite the stored payload without touching version or metadata.
    /// Simulates tampering at rest.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn corrupt_payload(&self, name: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.objects.write().await.get_mut(name) {
            Some(entry) => {
                f(&mut entry.payload);
                true
            }
            None => false,
        }
    }

    /// Overwrite one metadata value without bumping the version.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn corrupt_metadata(&self, name: &str, key: &str, value: &str) -> bool {
        match self.objects.write().await.get_mut(name) {
            Some(entry) => {
                entry.metadata.insert(key.to_owned(), value.to_owned());
                true
            }
            None => false,
        }
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn publish(&self, event_type: EventType, name: &str, entry: &Entry) {
        let configs = self.notifications.load();
        for config in configs.iter().filter(|c| c.event_type == event_type) {
            let event = ChangeEvent {
                event_type,
                bucket: self.bucket.clone(),
                name: name.to_owned(),
                generation: entry.generation.to_string(),
                metadata: entry.metadata.clone(),
                attributes: config.custom_attributes.clone(),
            };
            // No subscribers is not an error.
            let _ = self.events.send(event);
            debug!(
                topic = %config.topic,
                event = event_type.as_str(),
                object = %name,
                "published change event"
            );
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn head(
        &self,
        name: &str,
        sse: &ServerSideEncryption,
    ) -> Result<ObjectAttrs, StoreError> {
        let objects = self.objects.read().await;
        let entry = objects
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        if !matches!(sse, ServerSideEncryption::None) {
            entry.check_access(name, sse)?;
        }
        Ok(ObjectAttrs {
            metadata: entry.metadata.clone(),
            version: entry.version(),
            provider_key: entry.encryption.provider_key(),
        })
    }

    async fn get(
        &self,
        name: &str,
        sse: &ServerSideEncryption,
    ) -> Result<ProtectedObject, StoreError> {
        let objects = self.objects.read().await;
        let entry = objects
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        entry.check_access(name, sse)?;
        Ok(ProtectedObject {
            payload: entry.payload.clone(),
            metadata: entry.metadata.clone(),
            version: entry.version(),
            provider_key: entry.encryption.provider_key(),
        })
    }

    async fn put(
        &self,
        name: &str,
        payload: Vec<u8>,
        metadata: Metadata,
        sse: &ServerSideEncryption,
        precondition: &Precondition,
    ) -> Result<VersionToken, StoreError> {
        let mut objects = self.objects.write().await;
        match (precondition, objects.get(name)) {
            (Precondition::None, _) => {}
            (Precondition::DoesNotExist, None) => {}
            (Precondition::VersionMatches(expected), Some(existing)) => {
                existing.check_version(name, expected)?;
            }
            _ => return Err(StoreError::PreconditionFailed(name.to_owned())),
        }

        let entry = Entry {
            payload,
            metadata,
            generation: self.next_generation(),
            encryption: StoredEncryption::from_request(sse),
        };
        let version = entry.version();
        self.publish(EventType::ObjectFinalize, name, &entry);
        objects.insert(name.to_owned(), entry);
        Ok(version)
    }

    async fn update_metadata(
        &self,
        name: &str,
        metadata: Metadata,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let mut objects = self.objects.write().await;
        let entry = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        entry.check_version(name, expected)?;

        entry.metadata = metadata;
        entry.generation = self.next_generation();
        let version = entry.version();
        self.publish(EventType::ObjectMetadataUpdate, name, entry);
        Ok(version)
    }

    async fn rewrite_key(
        &self,
        name: &str,
        from: &ServerSideEncryption,
        to: &ServerSideEncryption,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let mut objects = self.objects.write().await;
        let entry = objects
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_owned()))?;
        entry.check_access(name, from)?;
        entry.check_version(name, expected)?;

        entry.encryption = StoredEncryption::from_request(to);
        entry.generation = self.next_generation();
        let version = entry.version();
        self.publish(EventType::ObjectFinalize, name, entry);
        Ok(version)
    }

    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<String>,
    ) -> Result<ListPage, StoreError> {
        use std::ops::Bound;

        let objects = self.objects.read().await;
        let start = match &page_token {
            Some(after) => Bound::Excluded(after.as_str()),
            None => Bound::Included(prefix),
        };
        let mut names: Vec<String> = objects
            .range::<str, _>((start, Bound::Unbounded))
            .map(|(name, _)| name)
            .skip_while(|name| !name.starts_with(prefix))
            .take_while(|name| name.starts_with(prefix))
            .take(self.page_size + 1)
            .cloned()
            .collect();

        let next_page_token = if names.len() > self.page_size {
            names.truncate(self.page_size);
            names.last().cloned()
        } else {
            None
        };
        Ok(ListPage {
            names,
            next_page_token,
        })
    }

    async fn configure_change_notification(
        &self,
        config: &NotificationConfig,
    ) -> Result<(), StoreError> {
        if config.topic.is_empty() {
            return Err(StoreError::Backend("notification topic is empty".into()));
        }
        let current = self.notifications.load();
        let mut next: Vec<NotificationConfig> = current
            .iter()
            .filter(|c| !(c.topic == config.topic && c.event_type == config.event_type))
            .cloned()
            .collect();
        next.push(config.clone());
        self.notifications.store(Arc::new(next));
        Ok(())
    }
}
