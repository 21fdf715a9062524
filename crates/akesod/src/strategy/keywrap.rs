//! KeyWrap: envelope encryption.
//!
//! A per-object data key encrypts the payload with AES-GCM; the KEK wraps the
//! data key with AES-GCM under its own nonce. Rotation rewraps the data key
//! and rewrites metadata only.
//!
//! The wrapped key field holds the 32-byte encrypted key followed by its
//! 16-byte tag.

use common::{protocol::meta, EngineError, StrategyTag};

use super::{
    get_tagged, head_tagged, meta_bytes, put_meta_bytes, tagged_metadata, UpdateKeys,
    UpdateOutcome,
};
use crate::crypto::{cipher, KEY_LEN, TAG_LEN};
use crate::keys::{KeyBytes, KeyMaterial};
use crate::store::{Metadata, ObjectStore, Precondition, ServerSideEncryption, VersionToken};

const TAG: StrategyTag = StrategyTag::Keywrap;

fn wrap_into(kek: &KeyBytes, data_key: &KeyBytes, metadata: &mut Metadata) -> Result<(), EngineError> {
    let nonce = cipher::random_nonce();
    let (mut wrapped, tag) = cipher::seal(kek.as_bytes(), &nonce, data_key.as_bytes())?;
    wrapped.extend_from_slice(&tag);
    put_meta_bytes(metadata, meta::KEY_NONCE, &nonce);
    put_meta_bytes(metadata, meta::WRAPPED_KEY, &wrapped);
    Ok(())
}

fn unwrap(kek: &KeyBytes, metadata: &Metadata) -> Result<KeyBytes, EngineError> {
    let nonce = meta_bytes(metadata, meta::KEY_NONCE)?;
    let wrapped = meta_bytes(metadata, meta::WRAPPED_KEY)?;
    if wrapped.len() != KEY_LEN + TAG_LEN {
        return Err(EngineError::AuthenticationFailure(format!(
            "wrapped key has {} bytes",
            wrapped.len()
        )));
    }
    let (ciphertext, tag) = wrapped.split_at(KEY_LEN);
    let mut raw = cipher::open(kek.as_bytes(), &nonce, ciphertext, tag)?;
    let key = KeyBytes::from_slice(&raw);
    raw.iter_mut().for_each(|b| *b = 0);
    Ok(key?)
}

pub(super) async fn upload(
    store: &dyn ObjectStore,
    name: &str,
    payload: &[u8],
    key: &KeyMaterial,
) -> Result<VersionToken, EngineError> {
    let kek = key.raw(TAG)?;
    let data_key = KeyBytes::random();

    let nonce = cipher::random_nonce();
    let (ciphertext, tag) = cipher::seal(data_key.as_bytes(), &nonce, payload)?;

    let mut metadata = tagged_metadata(TAG);
    put_meta_bytes(&mut metadata, meta::DATA_NONCE, &nonce);
    put_meta_bytes(&mut metadata, meta::DATA_TAG, &tag);
    wrap_into(kek, &data_key, &mut metadata)?;

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

    let data_key = unwrap(kek, &object.metadata)?;
    let nonce = meta_bytes(&object.metadata, meta::DATA_NONCE)?;
    let tag = meta_bytes(&object.metadata, meta::DATA_TAG)?;
    Ok(cipher::open(
        data_key.as_bytes(),
        &nonce,
        &object.payload,
        &tag,
    )?)
}

pub(super) async fn update(
    store: &dyn ObjectStore,
    name: &str,
    keys: UpdateKeys<'_>,
) -> Result<UpdateOutcome, EngineError> {
    let old = keys.old.raw(TAG)?;
    let new = keys.new.raw(TAG)?;

    let attrs = head_tagged(store, name, TAG, &ServerSideEncryption::None).await?;
    let data_key = unwrap(old, &attrs.metadata)?;

    let mut metadata = attrs.metadata;
    wrap_into(new, &data_key, &mut metadata)?;
    store
        .update_metadata(name, metadata, &attrs.version)
        .await?;
    Ok(UpdateOutcome::Rewrapped)
}
