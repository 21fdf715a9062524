//! Per-object protection strategies.
//!
//! Every strategy records its [`StrategyTag`] in object metadata on upload
//! and refuses to read or rotate an object carrying a different tag. Every
//! mutation is conditioned on the version the strategy read.
//!
//! | strategy | payload cipher         | rotation cost                     |
//! |----------|------------------------|-----------------------------------|
//! | strawman | AES-GCM under the KEK  | download + re-upload              |
//! | csek     | store, customer key    | store-side rewrite                |
//! | cmek     | store, provider key    | download + re-upload              |
//! | keywrap  | AES-GCM under a DEK    | rewrap the DEK (metadata only)    |
//! | akeso    | AES-GCM + CTR layers   | header only, compaction at bound  |

pub mod akeso;
pub mod cmek;
pub mod csek;
pub mod keywrap;
pub mod strawman;

use std::time::Instant;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{protocol::meta, EngineError, StrategyTag};
use tracing::{info, warn};

use crate::keys::{KeyBytes, KeyMaterial};
use crate::store::{
    validate_object_name, Metadata, ObjectAttrs, ObjectStore, ProtectedObject,
    ServerSideEncryption, StoreError, VersionToken,
};

pub use akeso::AkesoPolicy;

/// A protection scheme, selected per call or per rotation job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Strawman,
    Csek,
    Cmek,
    KeyWrap,
    Akeso(AkesoPolicy),
}

/// Keys for one update.
#[derive(Debug, Clone, Copy)]
pub struct UpdateKeys<'a> {
    pub old: &'a KeyMaterial,
    pub new: &'a KeyMaterial,
    /// The rotation job's DEK. Required by akeso, ignored by the others.
    pub dek: Option<&'a KeyBytes>,
}

/// What an update did to the object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// Payload decrypted and written again under the new key.
    Reencrypted,
    /// The store re-keyed the object server-side.
    Rekeyed,
    /// Only the wrapped data key changed.
    Rewrapped,
    /// A virtual rotation was recorded in the header; `layers` CTR layers are
    /// now described by it.
    LazyRotated { layers: usize },
    /// The DEK chain was collapsed by a full re-encryption.
    Compacted,
}

impl UpdateOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOutcome::Reencrypted => "reencrypted",
            UpdateOutcome::Rekeyed => "rekeyed",
            UpdateOutcome::Rewrapped => "rewrapped",
            UpdateOutcome::LazyRotated { .. } => "lazy_rotated",
            UpdateOutcome::Compacted => "compacted",
        }
    }
}

impl Strategy {
    /// The strategy for `tag`; akeso takes `policy`.
    pub fn from_tag(tag: StrategyTag, policy: AkesoPolicy) -> Self {
        match tag {
            StrategyTag::Strawman => Strategy::Strawman,
            StrategyTag::Csek => Strategy::Csek,
            StrategyTag::Cmek => Strategy::Cmek,
            StrategyTag::Keywrap => Strategy::KeyWrap,
            StrategyTag::Akeso => Strategy::Akeso(policy),
        }
    }

    pub fn tag(&self) -> StrategyTag {
        match self {
            Strategy::Strawman => StrategyTag::Strawman,
            Strategy::Csek => StrategyTag::Csek,
            Strategy::Cmek => StrategyTag::Cmek,
            Strategy::KeyWrap => StrategyTag::Keywrap,
            Strategy::Akeso(_) => StrategyTag::Akeso,
        }
    }

    /// Protect `payload` and store it as a new object `name`.
    ///
    /// # Errors
    ///
    /// [`EngineError::Input`] for a bad name or the wrong kind of key,
    /// [`EngineError::VersionConflict`] if the object already exists.
    pub async fn upload(
        &self,
        store: &dyn ObjectStore,
        name: &str,
        payload: &[u8],
        key: &KeyMaterial,
    ) -> Result<VersionToken, EngineError> {
        validate_object_name(name)?;
        match self {
            Strategy::Strawman => strawman::upload(store, name, payload, key).await,
            Strategy::Csek => csek::upload(store, name, payload, key).await,
            Strategy::Cmek => cmek::upload(store, name, payload, key).await,
            Strategy::KeyWrap => keywrap::upload(store, name, payload, key).await,
            Strategy::Akeso(_) => akeso::upload(store, name, payload, key).await,
        }
    }

    /// Read and unprotect object `name`.
    ///
    /// # Errors
    ///
    /// [`EngineError::ProtocolMismatch`] if the object carries another tag,
    /// [`EngineError::AuthenticationFailure`] on a wrong key or tampering.
    pub async fn download(
        &self,
        store: &dyn ObjectStore,
        name: &str,
        key: &KeyMaterial,
    ) -> Result<Vec<u8>, EngineError> {
        validate_object_name(name)?;
        match self {
            Strategy::Strawman => strawman::download(store, name, key).await,
            Strategy::Csek => csek::download(store, name, key).await,
            Strategy::Cmek => cmek::download(store, name, key).await,
            Strategy::KeyWrap => keywrap::download(store, name, key).await,
            Strategy::Akeso(_) => akeso::download(store, name, key).await,
        }
    }

    /// Move object `name` from `keys.old` to `keys.new`.
    ///
    /// Never retries: a lost conditional write surfaces as
    /// [`EngineError::VersionConflict`] and leaves the object as it was.
    pub async fn update(
        &self,
        store: &dyn ObjectStore,
        name: &str,
        keys: UpdateKeys<'_>,
    ) -> Result<UpdateOutcome, EngineError> {
        validate_object_name(name)?;
        let started = Instant::now();
        let result = match self {
            Strategy::Strawman => strawman::update(store, name, keys).await,
            Strategy::Csek => csek::update(store, name, keys).await,
            Strategy::Cmek => cmek::update(store, name, keys).await,
            Strategy::KeyWrap => keywrap::update(store, name, keys).await,
            Strategy::Akeso(policy) => akeso::update(store, name, keys, policy).await,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(outcome) => info!(
                object = %name,
                strategy = %self.tag(),
                outcome = outcome.as_str(),
                elapsed_ms,
                "object updated"
            ),
            Err(e) => warn!(
                object = %name,
                strategy = %self.tag(),
                elapsed_ms,
                error = %e,
                "object update failed"
            ),
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Fail with [`EngineError::ProtocolMismatch`] unless `metadata` is tagged
/// `expected`.
pub(crate) fn check_tag(metadata: &Metadata, expected: StrategyTag) -> Result<(), EngineError> {
    match metadata.get(meta::STRATEGY) {
        Some(found) if found == expected.as_str() => Ok(()),
        found => Err(EngineError::ProtocolMismatch {
            expected: expected.to_string(),
            found: found.cloned().unwrap_or_else(|| "untagged".into()),
        }),
    }
}

/// Metadata for a freshly uploaded object.
pub(crate) fn tagged_metadata(tag: StrategyTag) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert(meta::STRATEGY.into(), tag.to_string());
    metadata
}

/// Decode a base64 protection field.
///
/// Missing or undecodable fields mean the object was tampered with.
pub(crate) fn meta_bytes(metadata: &Metadata, key: &str) -> Result<Vec<u8>, EngineError> {
    let value = metadata.get(key).ok_or_else(|| {
        EngineError::AuthenticationFailure(format!("protection field {key} is missing"))
    })?;
    STANDARD.decode(value).map_err(|e| {
        EngineError::AuthenticationFailure(format!("protection field {key} is corrupt: {e}"))
    })
}

pub(crate) fn put_meta_bytes(metadata: &mut Metadata, key: &str, value: &[u8]) {
    metadata.insert(key.into(), STANDARD.encode(value));
}

/// Turn a store key refusal into a tag mismatch when the metadata says the
/// object belongs to another strategy.
async fn explain_refusal(
    store: &dyn ObjectStore,
    name: &str,
    expected: StrategyTag,
    err: StoreError,
) -> EngineError {
    if let StoreError::KeyMismatch(_) = err {
        if let Ok(attrs) = store.head(name, &ServerSideEncryption::None).await {
            if let Err(mismatch) = check_tag(&attrs.metadata, expected) {
                return mismatch;
            }
        }
    }
    err.into()
}

/// `head` followed by a tag check.
pub(crate) async fn head_tagged(
    store: &dyn ObjectStore,
    name: &str,
    expected: StrategyTag,
    sse: &ServerSideEncryption,
) -> Result<ObjectAttrs, EngineError> {
    let attrs = match store.head(name, sse).await {
        Ok(attrs) => attrs,
        Err(e) => return Err(explain_refusal(store, name, expected, e).await),
    };
    check_tag(&attrs.metadata, expected)?;
    Ok(attrs)
}

/// `get` followed by a tag check.
pub(crate) async fn get_tagged(
    store: &dyn ObjectStore,
    name: &str,
    expected: StrategyTag,
    sse: &ServerSideEncryption,
) -> Result<ProtectedObject, EngineError> {
    let object = match store.get(name, sse).await {
        Ok(object) => object,
        Err(e) => return Err(explain_refusal(store, name, expected, e).await),
    };
    check_tag(&object.metadata, expected)?;
    Ok(object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn raw() -> KeyMaterial {
        KeyMaterial::Raw(KeyBytes::random())
    }

    fn key_for(strategy: &Strategy) -> KeyMaterial {
        match strategy {
            Strategy::Cmek => KeyMaterial::ProviderKeyId("kms/key-1".into()),
            _ => raw(),
        }
    }

    fn all() -> [Strategy; 5] {
        [
            Strategy::Strawman,
            Strategy::Csek,
            Strategy::Cmek,
            Strategy::KeyWrap,
            Strategy::Akeso(AkesoPolicy::default()),
        ]
    }

    #[test]
    fn tag_and_from_tag_agree() {
        for tag in StrategyTag::ALL {
            assert_eq!(Strategy::from_tag(tag, AkesoPolicy::default()).tag(), tag);
        }
    }

    #[test]
    fn check_tag_reports_found_value() {
        let metadata = tagged_metadata(StrategyTag::Keywrap);
        assert!(check_tag(&metadata, StrategyTag::Keywrap).is_ok());
        match check_tag(&metadata, StrategyTag::Akeso) {
            Err(EngineError::ProtocolMismatch { expected, found }) => {
                assert_eq!(expected, "akeso");
                assert_eq!(found, "keywrap");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            check_tag(&Metadata::new(), StrategyTag::Strawman),
            Err(EngineError::ProtocolMismatch { found, .. }) if found == "untagged"
        ));
    }

    #[test]
    fn corrupt_protection_field_is_authentication_failure() {
        let mut metadata = Metadata::new();
        metadata.insert(meta::DATA_NONCE.into(), "***".into());
        assert!(matches!(
            meta_bytes(&metadata, meta::DATA_NONCE),
            Err(EngineError::AuthenticationFailure(_))
        ));
        assert!(matches!(
            meta_bytes(&metadata, meta::DATA_TAG),
            Err(EngineError::AuthenticationFailure(_))
        ));
    }

    #[tokio::test]
    async fn round_trip_every_strategy() {
        let store = MemoryStore::new("bucket");
        for strategy in all() {
            let key = key_for(&strategy);
            let name = format!("obj-{}", strategy.tag());
            strategy
                .upload(&store, &name, b"hello world", &key)
                .await
                .unwrap();
            assert_eq!(
                strategy.download(&store, &name, &key).await.unwrap(),
                b"hello world"
            );
        }
    }

    #[tokio::test]
    async fn empty_payload_round_trips() {
        let store = MemoryStore::new("bucket");
        for strategy in all() {
            let key = key_for(&strategy);
            let name = format!("empty-{}", strategy.tag());
            strategy.upload(&store, &name, b"", &key).await.unwrap();
            assert!(strategy.download(&store, &name, &key).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn upload_does_not_overwrite() {
        let store = MemoryStore::new("bucket");
        let key = raw();
        Strategy::Strawman
            .upload(&store, "o", b"one", &key)
            .await
            .unwrap();
        assert!(matches!(
            Strategy::Strawman.upload(&store, "o", b"two", &key).await,
            Err(EngineError::VersionConflict(_))
        ));
    }

    #[tokio::test]
    async fn update_then_download_with_new_key() {
        let store = MemoryStore::new("bucket");
        let dek = KeyBytes::random();
        for strategy in all() {
            let (old, new) = match strategy {
                Strategy::Cmek => (
                    KeyMaterial::ProviderKeyId("kms/old".into()),
                    KeyMaterial::ProviderKeyId("kms/new".into()),
                ),
                _ => (raw(), raw()),
            };
            let name = format!("rot-{}", strategy.tag());
            strategy.upload(&store, &name, b"payload", &old).await.unwrap();
            strategy
                .update(
                    &store,
                    &name,
                    UpdateKeys {
                        old: &old,
                        new: &new,
                        dek: Some(&dek),
                    },
                )
                .await
                .unwrap();

            // Akeso with no responder running: the new layer is pending.
            assert_eq!(
                strategy.download(&store, &name, &new).await.unwrap(),
                b"payload",
                "{}",
                strategy.tag()
            );
            assert!(strategy.download(&store, &name, &old).await.is_err());
        }
    }

    #[tokio::test]
    async fn invalid_name_is_input_error() {
        let store = MemoryStore::new("bucket");
        assert!(matches!(
            Strategy::Strawman.upload(&store, "", b"x", &raw()).await,
            Err(EngineError::Input(_))
        ));
    }
}
