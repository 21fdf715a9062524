//! CSEK: the store encrypts with a customer-supplied key.
//!
//! The engine never sees ciphertext. Rotation is a store-side rewrite from
//! the old customer key to the new one.

use common::{EngineError, StrategyTag};

use super::{get_tagged, head_tagged, tagged_metadata, UpdateKeys, UpdateOutcome};
use crate::keys::KeyMaterial;
use crate::store::{ObjectStore, Precondition, ServerSideEncryption, VersionToken};

const TAG: StrategyTag = StrategyTag::Csek;

fn customer_key(key: &KeyMaterial) -> Result<ServerSideEncryption, EngineError> {
    Ok(ServerSideEncryption::CustomerKey(key.raw(TAG)?.clone()))
}

pub(super) async fn upload(
    store: &dyn ObjectStore,
    name: &str,
    payload: &[u8],
    key: &KeyMaterial,
) -> Result<VersionToken, EngineError> {
    let sse = customer_key(key)?;
    Ok(store
        .put(
            name,
            payload.to_vec(),
            tagged_metadata(TAG),
            &sse,
            &Precondition::DoesNotExist,
        )
        .await?)
}

pub(super) async fn download(
    store: &dyn ObjectStore,
    name: &str,
    key: &KeyMaterial,
) -> Result<Vec<u8>, EngineError> {
    let sse = customer_key(key)?;
    // Attributes first: the tag must match before the store decrypts.
    head_tagged(store, name, TAG, &sse).await?;
    let object = get_tagged(store, name, TAG, &sse).await?;
    Ok(object.payload)
}

pub(super) async fn update(
    store: &dyn ObjectStore,
    name: &str,
    keys: UpdateKeys<'_>,
) -> Result<UpdateOutcome, EngineError> {
    let from = customer_key(keys.old)?;
    let to = customer_key(keys.new)?;

    let attrs = head_tagged(store, name, TAG, &from).await?;
    store
        .rewrite_key(name, &from, &to, &attrs.version)
        .await?;
    Ok(UpdateOutcome::Rekeyed)
}
