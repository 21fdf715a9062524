//! CMEK: the store encrypts with a provider-managed key named by identifier.
//!
//! Rotation downloads the object and writes it back under the new key
//! identifier.

use common::{EngineError, StrategyTag};

use super::{get_tagged, tagged_metadata, UpdateKeys, UpdateOutcome};
use crate::keys::KeyMaterial;
use crate::store::{
    ObjectStore, Precondition, ProtectedObject, ServerSideEncryption, VersionToken,
};

const TAG: StrategyTag = StrategyTag::Cmek;

/// The object must have been written under `expected`.
fn check_provider_key(
    name: &str,
    object: &ProtectedObject,
    expected: &str,
) -> Result<(), EngineError> {
    match object.provider_key.as_deref() {
        Some(found) if found == expected => Ok(()),
        Some(found) => Err(EngineError::AuthenticationFailure(format!(
            "{name} is protected by provider key {found}, not {expected}"
        ))),
        None => Err(EngineError::AuthenticationFailure(format!(
            "{name} is not protected by a provider key"
        ))),
    }
}

pub(super) async fn upload(
    store: &dyn ObjectStore,
    name: &str,
    payload: &[u8],
    key: &KeyMaterial,
) -> Result<VersionToken, EngineError> {
    let key_id = key.provider_key_id(TAG)?;
    Ok(store
        .put(
            name,
            payload.to_vec(),
            tagged_metadata(TAG),
            &ServerSideEncryption::ProviderKey(key_id.to_owned()),
            &Precondition::DoesNotExist,
        )
        .await?)
}

pub(super) async fn download(
    store: &dyn ObjectStore,
    name: &str,
    key: &KeyMaterial,
) -> Result<Vec<u8>, EngineError> {
    let key_id = key.provider_key_id(TAG)?;
    let object = get_tagged(store, name, TAG, &ServerSideEncryption::None).await?;
    check_provider_key(name, &object, key_id)?;
    Ok(object.payload)
}

pub(super) async fn update(
    store: &dyn ObjectStore,
    name: &str,
    keys: UpdateKeys<'_>,
) -> Result<UpdateOutcome, EngineError> {
    let old_id = keys.old.provider_key_id(TAG)?;
    let new_id = keys.new.provider_key_id(TAG)?;

    let object = get_tagged(store, name, TAG, &ServerSideEncryption::None).await?;
    check_provider_key(name, &object, old_id)?;

    store
        .put(
            name,
            object.payload,
            object.metadata,
            &ServerSideEncryption::ProviderKey(new_id.to_owned()),
            &Precondition::VersionMatches(object.version),
        )
        .await?;
    Ok(UpdateOutcome::Reencrypted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyBytes;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn wrong_provider_key_is_authentication_failure() {
        let store = MemoryStore::new("b");
        upload(&store, "o", b"x", &KeyMaterial::ProviderKeyId("kms/a".into()))
            .await
            .unwrap();
        assert!(matches!(
            download(&store, "o", &KeyMaterial::ProviderKeyId("kms/b".into())).await,
            Err(EngineError::AuthenticationFailure(_))
        ));
    }

    #[tokio::test]
    async fn raw_key_is_rejected() {
        let store = MemoryStore::new("b");
        assert!(matches!(
            upload(&store, "o", b"x", &KeyMaterial::Raw(KeyBytes::random())).await,
            Err(EngineError::Input(_))
        ));
    }

    #[tokio::test]
    async fn update_moves_to_new_key() {
        let store = MemoryStore::new("b");
        let old = KeyMaterial::ProviderKeyId("kms/a".into());
        let new = KeyMaterial::ProviderKeyId("kms/b".into());
        upload(&store, "o", b"x", &old).await.unwrap();
        update(
            &store,
            "o",
            UpdateKeys {
                old: &old,
                new: &new,
                dek: None,
            },
        )
        .await
        .unwrap();
        let object = store.get("o", &ServerSideEncryption::None).await.unwrap();
        assert_eq!(object.provider_key.as_deref(), Some("kms/b"));
    }
}
