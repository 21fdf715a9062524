//! Akeso: lazy layered re-encryption.
//!
//! # Upload
//!
//! A fresh DEK `d0` encrypts the payload with AES-GCM under the zero nonce.
//! The header `{base_iv, data_tag, deks: [d0]}` is sealed under the KEK and
//! stored in metadata next to the ciphertext.
//!
//! # Update
//!
//! The header is opened with the old KEK and the job DEK is appended. While
//! the chain describes at most [`AkesoPolicy::max_layers`] CTR layers the
//! rotation is *lazy*: the header is resealed under the new KEK and only the
//! metadata is written, marked `ongoing_reencryption = true`. The responder
//! later adds the matching CTR layer to the payload. Past the bound, or when
//! the previous layer has not been applied yet, the object is *compacted*:
//! fully decrypted and re-encrypted under a fresh DEK and base IV.
//!
//! # Download
//!
//! Peel the physically present CTR layers newest first, then GCM-decrypt with
//! `d0`. An object marked `ongoing_reencryption = true` is one layer behind
//! its header, so its newest layer is not peeled.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{
    protocol::{meta, updated_by},
    EngineError, StrategyTag,
};
use tracing::{debug, info};

use super::{get_tagged, head_tagged, tagged_metadata, UpdateKeys, UpdateOutcome};
use crate::crypto::{cipher, cipher::ZERO_NONCE, Iv128};
use crate::header::{AkesoHeader, LayerPipeline};
use crate::keys::{KeyBytes, KeyMaterial};
use crate::store::{
    Metadata, ObjectStore, Precondition, ServerSideEncryption, VersionToken,
};

const TAG: StrategyTag = StrategyTag::Akeso;

/// Default bound on CTR layers before a rotation compacts.
pub const DEFAULT_MAX_LAYERS: usize = 3;

/// Compaction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AkesoPolicy {
    /// Most CTR layers an object may carry. Layer `max_layers` sits on top
    /// of the base DEK, so a chain holds up to `max_layers + 1` DEKs. `0`
    /// compacts on every rotation.
    pub max_layers: usize,
}

impl AkesoPolicy {
    pub fn new(max_layers: usize) -> Self {
        Self { max_layers }
    }

    /// Whether a chain describing `layers` CTR layers may stay lazy, that is
    /// hold `layers + 1` DEKs.
    pub fn is_lazy(&self, layers: usize) -> bool {
        layers <= self.max_layers
    }
}

impl Default for AkesoPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LAYERS)
    }
}

/// Whether the newest layer recorded in the header is still missing from the
/// payload.
pub fn is_pending(metadata: &Metadata) -> bool {
    metadata
        .get(meta::ONGOING_REENCRYPTION)
        .is_some_and(|v| v == "true")
}

fn open_header(kek: &KeyBytes, metadata: &Metadata) -> Result<AkesoHeader, EngineError> {
    let sealed = metadata.get(meta::DEKS).ok_or_else(|| {
        EngineError::AuthenticationFailure("akeso header is missing".into())
    })?;
    AkesoHeader::open(kek, sealed)
}

/// Layers physically present in the payload.
fn applied_layers(header: &AkesoHeader, metadata: &Metadata) -> usize {
    let recorded = header.layer_count();
    if is_pending(metadata) {
        recorded.saturating_sub(1)
    } else {
        recorded
    }
}

/// Recover the plaintext from a stored payload.
fn unprotect(
    header: &AkesoHeader,
    metadata: &Metadata,
    mut payload: Vec<u8>,
) -> Result<Vec<u8>, EngineError> {
    let pipeline = LayerPipeline::from_header(header, applied_layers(header, metadata))?;
    pipeline.peel(&mut payload)?;
    Ok(cipher::open(
        header.deks()[0].as_bytes(),
        &ZERO_NONCE,
        &payload,
        header.data_tag(),
    )?)
}

/// Encrypt `plaintext` under a fresh DEK and base IV, writing the sealed
/// header into `metadata`.
fn protect(
    kek: &KeyBytes,
    plaintext: &[u8],
    metadata: &mut Metadata,
) -> Result<Vec<u8>, EngineError> {
    let dek = KeyBytes::random();
    let base_iv = Iv128::random();
    let (ciphertext, tag) = cipher::seal(dek.as_bytes(), &ZERO_NONCE, plaintext)?;
    let header = AkesoHeader::new(base_iv, tag, dek);

    metadata.insert(meta::DEKS.into(), header.seal(kek)?);
    metadata.insert(meta::BASE_IV.into(), STANDARD.encode(base_iv.as_bytes()));
    metadata.insert(meta::UPDATED_BY.into(), updated_by::ENGINE.into());
    metadata.remove(meta::ONGOING_REENCRYPTION);
    metadata.remove(meta::TIMES_UPDATED);
    Ok(ciphertext)
}

pub(super) async fn upload(
    store: &dyn ObjectStore,
    name: &str,
    payload: &[u8],
    key: &KeyMaterial,
) -> Result<VersionToken, EngineError> {
    let kek = key.raw(TAG)?;
    let mut metadata = tagged_metadata(TAG);
    let ciphertext = protect(kek, payload, &mut metadata)?;
    Ok(store
        .put(
            name,
            ciphertext,
            metadata,
            &ServerSideEncryption::None,
            &Precondition::DoesNotExist,
        )
        .await?)
}

pub(super) async fn download(
    store: &dyn ObjectStore,
    name: &str,
    key: &KeyMaterial,
) -> Result<Vec<u8>, EngineError> {
    let kek = key.raw(TAG)?;
    let object = get_tagged(store, name, TAG, &ServerSideEncryption::None).await?;
    let header = open_header(kek, &object.metadata)?;
    unprotect(&header, &object.metadata, object.payload)
}

pub(super) async fn update(
    store: &dyn ObjectStore,
    name: &str,
    keys: UpdateKeys<'_>,
    policy: &AkesoPolicy,
) -> Result<UpdateOutcome, EngineError> {
    let old = keys.old.raw(TAG)?;
    let new = keys.new.raw(TAG)?;
    let dek = keys
        .dek
        .ok_or_else(|| EngineError::Input("akeso update requires the rotation DEK".into()))?;

    let attrs = head_tagged(store, name, TAG, &ServerSideEncryption::None).await?;
    let mut header = open_header(old, &attrs.metadata)?;
    let pending = is_pending(&attrs.metadata);
    header.push_dek(dek.clone())?;

    if !pending && policy.is_lazy(header.layer_count()) {
        let layers = header.layer_count();
        let mut metadata = attrs.metadata;
        metadata.insert(meta::DEKS.into(), header.seal(new)?);
        metadata.insert(meta::UPDATED_BY.into(), updated_by::METADATA_UPDATER.into());
        metadata.insert(meta::ONGOING_REENCRYPTION.into(), "true".into());
        metadata.insert(meta::TIMES_UPDATED.into(), header.len().to_string());
        store
            .update_metadata(name, metadata, &attrs.version)
            .await?;
        debug!(object = %name, layers, "header rotated; layer pending");
        return Ok(UpdateOutcome::LazyRotated { layers });
    }

    if pending {
        info!(object = %name, "previous layer not yet applied; compacting");
    }
    compact(store, name, old, new, &attrs.version).await?;
    Ok(UpdateOutcome::Compacted)
}

/// Collapse the chain: decrypt fully under `old`, re-encrypt from scratch
/// under `new`. The write is conditioned on `expected`.
async fn compact(
    store: &dyn ObjectStore,
    name: &str,
    old: &KeyBytes,
    new: &KeyBytes,
    expected: &VersionToken,
) -> Result<(), EngineError> {
    let object = get_tagged(store, name, TAG, &ServerSideEncryption::None).await?;
    if object.version != *expected {
        return Err(EngineError::VersionConflict(format!(
            "{name} changed during compaction"
        )));
    }

    let header = open_header(old, &object.metadata)?;
    let mut plaintext = unprotect(&header, &object.metadata, object.payload)?;

    let mut metadata = object.metadata;
    let ciphertext = protect(new, &plaintext, &mut metadata);
    plaintext.iter_mut().for_each(|b| *b = 0);

    store
        .put(
            name,
            ciphertext?,
            metadata,
            &ServerSideEncryption::None,
            &Precondition::VersionMatches(object.version),
        )
        .await?;
    Ok(())
}
