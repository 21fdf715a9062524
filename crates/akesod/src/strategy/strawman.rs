//! Strawman: the payload is AES-GCM encrypted directly under the KEK.
//!
//! Rotation decrypts and re-encrypts the whole payload; it is the cost
//! baseline the other strategies are measured against.

use common::{protocol::meta, EngineError, StrategyTag};

use super::{get_tagged, meta_bytes, put_meta_bytes, tagged_metadata, UpdateKeys, UpdateOutcome};
use crate::crypto::cipher;
use crate::keys::{KeyBytes, KeyMaterial};
use crate::store::{Metadata, ObjectStore, Precondition, ServerSideEncryption, VersionToken};

const TAG: StrategyTag = StrategyTag::Strawman;

/// Encrypt under `kek` with a fresh nonce, recording nonce and tag in
/// `metadata`.
fn encrypt_into(
    kek: &KeyBytes,
    payload: &[u8],
    metadata: &mut Metadata,
) -> Result<Vec<u8>, EngineError> {
    let nonce = cipher::random_nonce();
    let (ciphertext, tag) = cipher::seal(kek.as_bytes(), &nonce, payload)?;
    put_meta_bytes(metadata, meta::DATA_NONCE, &nonce);
    put_meta_bytes(metadata, meta::DATA_TAG, &tag);
    Ok(ciphertext)
}

fn decrypt(kek: &KeyBytes, ciphertext: &[u8], metadata: &Metadata) -> Result<Vec<u8>, EngineError> {
    let nonce = meta_bytes(metadata, meta::DATA_NONCE)?;
    let tag = meta_bytes(metadata, meta::DATA_TAG)?;
    Ok(cipher::open(kek.as_bytes(), &nonce, ciphertext, &tag)?)
}

pub(super) async fn upload(
    store: &dyn ObjectStore,
    name: &str,
    payload: &[u8],
    key: &KeyMaterial,
) -> Result<VersionToken, EngineError> {
    let kek = key.raw(TAG)?;
    let mut metadata = tagged_metadata(TAG);
    let ciphertext = encrypt_into(kek, payload, &mut metadata)?;
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
    decrypt(kek, &object.payload, &object.metadata)
}

pub(super) async fn update(
    store: &dyn ObjectStore,
    name: &str,
    keys: UpdateKeys<'_>,
) -> Result<UpdateOutcome, EngineError> {
    let old = keys.old.raw(TAG)?;
    let new = keys.new.raw(TAG)?;

    let object = get_tagged(store, name, TAG, &ServerSideEncryption::None).await?;
    let plaintext = decrypt(old, &object.payload, &object.metadata)?;

    let mut metadata = object.metadata;
    let ciphertext = encrypt_into(new, &plaintext, &mut metadata)?;
    store
        .put(
            name,
            ciphertext,
            metadata,
            &ServerSideEncryption::None,
            &Precondition::VersionMatches(object.version),
        )
        .await?;
    Ok(UpdateOutcome::Reencrypted)
}
