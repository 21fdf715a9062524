//! Object store abstraction.
//!
//! The engine never talks to a storage SDK directly. Every strategy works
//! against [`ObjectStore`], which exposes the handful of primitives the
//! protocols need: reads with optional server-side keys, conditional writes,
//! metadata-only updates, server-side key rewrites, paginated listing, and
//! change-notification configuration.
//!
//! Two backends ship with the crate:
//!
//! - [`memory::MemoryStore`]: an in-process store that also emits change
//!   events, used by tests and by single-process deployments.
//! - [`s3::S3Store`]: an S3-compatible bucket via `aws-sdk-s3`.

pub mod memory;
pub mod s3;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use common::{protocol::EventType, EngineError};
use thiserror::Error;

use crate::keys::KeyBytes;

pub use memory::MemoryStore;
pub use s3::S3Store;

/// Object names are limited to this many bytes.
pub const MAX_NAME_LEN: usize = 1024;

/// User metadata attached to an object.
pub type Metadata = BTreeMap<String, String>;

/// Opaque token identifying one state of an object.
///
/// Every successful write returns a new token; conditional writes compare
/// against it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionToken(pub String);

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Server-side encryption requested for a read or write.
#[derive(Debug, Clone)]
pub enum ServerSideEncryption {
    None,
    /// Customer-supplied key; the store keeps only its digest.
    CustomerKey(KeyBytes),
    /// Provider-managed key named by identifier.
    ProviderKey(String),
}

/// A fetched object.
#[derive(Debug, Clone)]
pub struct ProtectedObject {
    pub payload: Vec<u8>,
    pub metadata: Metadata,
    pub version: VersionToken,
    /// Provider key the store used, if any.
    pub provider_key: Option<String>,
}

/// Object attributes without the payload.
#[derive(Debug, Clone)]
pub struct ObjectAttrs {
    pub metadata: Metadata,
    pub version: VersionToken,
    pub provider_key: Option<String>,
}

/// Condition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    None,
    DoesNotExist,
    VersionMatches(VersionToken),
}

/// Change-notification configuration for a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationConfig {
    pub topic: String,
    pub event_type: EventType,
    /// Attributes attached to every notification but never stored with the
    /// object.
    pub custom_attributes: BTreeMap<String, String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub names: Vec<String>,
    pub next_page_token: Option<String>,
}

/// Errors returned by store backends.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    /// A conditional write found a different object version.
    #[error("precondition failed for {0}")]
    PreconditionFailed(String),

    /// The supplied server-side key does not match the object's key.
    #[error("encryption key mismatch for {0}")]
    KeyMismatch(String),

    #[error("unsupported by this store: {0}")]
    Unsupported(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(name) => EngineError::NotFound(name),
            StoreError::PreconditionFailed(name) => {
                EngineError::VersionConflict(format!("{name} changed concurrently"))
            }
            StoreError::KeyMismatch(_) => EngineError::AuthenticationFailure(e.to_string()),
            StoreError::Unsupported(_) => EngineError::Input(e.to_string()),
            StoreError::Backend(_) => EngineError::Store(e.to_string()),
        }
    }
}

/// Primitive operations the protection strategies are built on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch metadata without the payload.
    async fn head(
        &self,
        name: &str,
        sse: &ServerSideEncryption,
    ) -> Result<ObjectAttrs, StoreError>;

    /// Fetch payload and metadata.
    async fn get(
        &self,
        name: &str,
        sse: &ServerSideEncryption,
    ) -> Result<ProtectedObject, StoreError>;

    /// Write a full object, replacing payload and metadata.
    async fn put(
        &self,
        name: &str,
        payload: Vec<u8>,
        metadata: Metadata,
        sse: &ServerSideEncryption,
        precondition: &Precondition,
    ) -> Result<VersionToken, StoreError>;

    /// Replace the metadata of the object at version `expected`.
    async fn update_metadata(
        &self,
        name: &str,
        metadata: Metadata,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError>;

    /// Re-key a server-side encrypted object in place.
    async fn rewrite_key(
        &self,
        name: &str,
        from: &ServerSideEncryption,
        to: &ServerSideEncryption,
        expected: &VersionToken,
    ) -> Result<VersionToken, StoreError>;

    /// List one page of object names under `prefix`, in name order.
    async fn list_page(
        &self,
        prefix: &str,
        page_token: Option<String>,
    ) -> Result<ListPage, StoreError>;

    /// Install (or replace) a change-notification configuration.
    async fn configure_change_notification(
        &self,
        config: &NotificationConfig,
    ) -> Result<(), StoreError>;

    /// Whether change notifications can carry the custom attributes of their
    /// configuration. Akeso rotation delivers the new layer's DEK that way.
    fn notifications_carry_attributes(&self) -> bool {
        true
    }
}

/// List every object name under `prefix`, following pagination.
pub async fn list_all(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<String>, StoreError> {
    let mut names = Vec::new();
    let mut token = None;
    loop {
        let page = store.list_page(prefix, token).await?;
        names.extend(page.names);
        match page.next_page_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(names)
}

/// Reject names no backend can store.
pub fn validate_object_name(name: &str) -> Result<(), EngineError> {
    if name.is_empty() {
        return Err(EngineError::Input("object name is empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::Input(format!(
            "object name exceeds {MAX_NAME_LEN} bytes"
        )));
    }
    if name.contains(['\r', '\n', '\0']) {
        return Err(EngineError::Input(format!(
            "object name contains control characters: {name:?}"
        )));
    }
    Ok(())
}
