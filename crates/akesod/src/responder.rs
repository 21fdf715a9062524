//! Physical re-encryption: applies the CTR layer a lazy rotation recorded.
//!
//! The responder reacts to `OBJECT_METADATA_UPDATE` events. The job DEK
//! arrives out of band in the notification attribute
//! [`NEW_DEK_ATTRIBUTE`]; the base IV is read from plain object metadata. It
//! never sees plaintext and never needs a KEK.
//!
//! The object is re-read before the layer is applied, and the event is
//! skipped unless the object is still waiting for exactly the layer the event
//! describes. The write is conditioned on the version read, so a concurrent
//! rotation or compaction wins and the responder's write fails.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{
    protocol::{meta, updated_by, ChangeEvent, EventType, NEW_DEK_ATTRIBUTE},
    EngineError, StrategyTag,
};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::crypto::Iv128;
use crate::header::{layer_iv, Layer};
use crate::keys::KeyBytes;
use crate::store::{Metadata, ObjectStore, Precondition, ServerSideEncryption};
use crate::strategy::{akeso::is_pending, check_tag};

/// Why an event did not lead to a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Not a metadata update.
    NotMetadataUpdate,
    /// A full write by the engine or by the responder itself.
    OwnWrite,
    /// The object is not an Akeso object.
    NotAkeso,
    /// No layer is pending.
    NotPending,
    /// The object moved on since the event was emitted.
    Stale,
}

/// Result of handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponderOutcome {
    /// Layer `layer` (header index) was applied.
    Applied { layer: usize },
    Skipped(SkipReason),
}

fn times_updated(metadata: &Metadata) -> Result<usize, EngineError> {
    let raw = metadata
        .get(meta::TIMES_UPDATED)
        .ok_or_else(|| EngineError::Input(format!("{} missing", meta::TIMES_UPDATED)))?;
    let count: usize = raw
        .parse()
        .map_err(|_| EngineError::Input(format!("invalid {}: {raw}", meta::TIMES_UPDATED)))?;
    if count < 2 {
        return Err(EngineError::Input(format!(
            "{} must be at least 2, got {count}",
            meta::TIMES_UPDATED
        )));
    }
    Ok(count)
}

fn base_iv(metadata: &Metadata) -> Result<Iv128, EngineError> {
    let encoded = metadata
        .get(meta::BASE_IV)
        .ok_or_else(|| EngineError::Input(format!("{} missing", meta::BASE_IV)))?;
    let bytes = STANDARD
        .decode(encoded)
        .map_err(|e| EngineError::Input(format!("invalid {}: {e}", meta::BASE_IV)))?;
    Ok(Iv128::from_slice(&bytes)?)
}

fn is_own_write(metadata: &Metadata) -> bool {
    matches!(
        metadata.get(meta::UPDATED_BY).map(String::as_str),
        Some(updated_by::ENGINE) | Some(updated_by::RESPONDER)
    )
}

/// Apply the pending CTR layer described by `event`.
///
/// # Errors
///
/// [`EngineError::Input`] for a malformed event or object fields,
/// [`EngineError::VersionConflict`] if the object changed between read and
/// write. Both are reported so the transport can redeliver or drop.
pub async fn apply_pending_layer(
    store: &dyn ObjectStore,
    event: &ChangeEvent,
) -> Result<ResponderOutcome, EngineError> {
    if event.event_type != EventType::ObjectMetadataUpdate {
        return Ok(ResponderOutcome::Skipped(SkipReason::NotMetadataUpdate));
    }
    if is_own_write(&event.metadata) {
        return Ok(ResponderOutcome::Skipped(SkipReason::OwnWrite));
    }
    if !is_pending(&event.metadata) {
        return Ok(ResponderOutcome::Skipped(SkipReason::NotPending));
    }

    let encoded = event.attributes.get(NEW_DEK_ATTRIBUTE).ok_or_else(|| {
        EngineError::Input(format!("event attribute {NEW_DEK_ATTRIBUTE} missing"))
    })?;
    let dek = KeyBytes::from_base64(encoded)?;
    let expected_count = times_updated(&event.metadata)?;

    let object = store.get(&event.name, &ServerSideEncryption::None).await?;
    if check_tag(&object.metadata, StrategyTag::Akeso).is_err() {
        return Ok(ResponderOutcome::Skipped(SkipReason::NotAkeso));
    }
    if !is_pending(&object.metadata) {
        return Ok(ResponderOutcome::Skipped(SkipReason::NotPending));
    }
    if times_updated(&object.metadata)? != expected_count {
        return Ok(ResponderOutcome::Skipped(SkipReason::Stale));
    }

    let index = expected_count - 1;
    let layer = Layer::new(dek, layer_iv(base_iv(&object.metadata)?, index));
    let mut payload = object.payload;
    layer.apply(&mut payload)?;

    let mut metadata = object.metadata;
    metadata.insert(meta::UPDATED_BY.into(), updated_by::RESPONDER.into());
    metadata.insert(meta::ONGOING_REENCRYPTION.into(), "false".into());
    store
        .put(
            &event.name,
            payload,
            metadata,
            &ServerSideEncryption::None,
            &Precondition::VersionMatches(object.version),
        )
        .await?;

    Ok(ResponderOutcome::Applied { layer: index })
}

/// Drive [`apply_pending_layer`] from a store's event stream until the
/// channel closes.
pub fn spawn_in_process(
    store: Arc<dyn ObjectStore>,
    mut events: broadcast::Receiver<ChangeEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "responder lagged; skipped events stay pending until the next rotation");
                    continue;
                }
                Err(RecvError::Closed) => break,
            };
            match apply_pending_layer(store.as_ref(), &event).await {
                Ok(ResponderOutcome::Applied { layer }) => {
                    info!(object = %event.name, layer, "layer applied")
                }
                Ok(ResponderOutcome::Skipped(reason)) => {
                    debug!(object = %event.name, ?reason, "event skipped")
                }
                Err(e) => warn!(object = %event.name, error = %e, "layer apply failed"),
            }
        }
        debug!("responder event stream closed");
    })
}
