//! Axum request handlers for all service endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use common::{
    protocol::{
        ChangeEvent, ErrorResponse, EventType, HealthResponse, ObjectResource, PushEnvelope,
        EVENT_TYPE_ATTRIBUTE,
    },
    EngineError,
};
use tracing::{debug, info, warn};

use akesod::responder::{apply_pending_layer, ResponderOutcome};

use super::state::AppState;

/// `POST /` — one push delivery from the notification transport.
///
/// Answers `204` when the pending layer was applied or the event needs no
/// work. Any other answer makes the transport redeliver.
pub async fn push(State(state): State<AppState>, Json(envelope): Json<PushEnvelope>) -> Response {
    let message_id = envelope.message.message_id.clone();
    let event = match decode_event(envelope) {
        Ok(event) => event,
        Err(e) => {
            warn!(message_id = %message_id, error = %e, "undecodable push delivery");
            return error_response(&e);
        }
    };

    if event.bucket != *state.bucket {
        warn!(
            message_id = %message_id,
            bucket = %event.bucket,
            "delivery for another bucket dropped"
        );
        return StatusCode::NO_CONTENT.into_response();
    }

    match apply_pending_layer(state.store.as_ref(), &event).await {
        Ok(ResponderOutcome::Applied { layer }) => {
            info!(message_id = %message_id, object = %event.name, layer, "pending layer applied");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(ResponderOutcome::Skipped(reason)) => {
            debug!(message_id = %message_id, object = %event.name, ?reason, "event skipped");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => {
            warn!(
                message_id = %message_id,
                object = %event.name,
                error = %e,
                transient = e.is_transient(),
                "pending layer not applied"
            );
            error_response(&e)
        }
    }
}

/// `GET /health` — liveness check.
pub async fn health(State(state): State<AppState>) -> Response {
    let body = HealthResponse {
        status: "ok".into(),
        bucket: state.bucket.as_str().to_owned(),
    };
    (StatusCode::OK, Json(body)).into_response()
}

/// Catch-all 404 handler.
pub async fn not_found() -> impl IntoResponse {
    let err = ErrorResponse::new("not_found", "the requested resource does not exist");
    (StatusCode::NOT_FOUND, Json(err))
}

/// Unpack the base64 object resource and the delivery attributes.
fn decode_event(envelope: PushEnvelope) -> Result<ChangeEvent, EngineError> {
    let message = envelope.message;
    let data = STANDARD
        .decode(message.data.as_bytes())
        .map_err(|e| EngineError::Input(format!("message data is not base64: {e}")))?;
    let resource: ObjectResource = serde_json::from_slice(&data)
        .map_err(|e| EngineError::Input(format!("message data is not an object resource: {e}")))?;
    let event_type = message
        .attributes
        .get(EVENT_TYPE_ATTRIBUTE)
        .ok_or_else(|| EngineError::Input(format!("attribute {EVENT_TYPE_ATTRIBUTE} missing")))?
        .parse::<EventType>()?;

    Ok(ChangeEvent {
        event_type,
        bucket: resource.bucket,
        name: resource.name,
        generation: resource.generation,
        metadata: resource.metadata,
        attributes: message.attributes,
    })
}

fn error_response(e: &EngineError) -> Response {
    let status =
        StatusCode::from_u16(e.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorResponse::new(e.code(), e.to_string()))).into_response()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use super::*;
    use akesod::keys::{KeyBytes, KeyMaterial};
    use akesod::store::{MemoryStore, NotificationConfig, ObjectStore, ServerSideEncryption};
    use akesod::strategy::{AkesoPolicy, Strategy, UpdateKeys};
    use axum::{body::Body, http::Request, Router};
    use common::protocol::{meta, updated_by, PushMessage, NEW_DEK_ATTRIBUTE};
    use tower::ServiceExt;

    use crate::server::router;

    const BUCKET: &str = "protected";

    fn envelope_for(event: &ChangeEvent) -> PushEnvelope {
        let resource = ObjectResource {
            bucket: event.bucket.clone(),
            name: event.name.clone(),
            generation: event.generation.clone(),
            metadata: event.metadata.clone(),
        };
        let mut attributes = event.attributes.clone();
        attributes.insert(
            EVENT_TYPE_ATTRIBUTE.into(),
            event.event_type.as_str().into(),
        );
        PushEnvelope {
            message: PushMessage {
                data: STANDARD.encode(serde_json::to_vec(&resource).unwrap()),
                attributes,
                message_id: "m-1".into(),
            },
            subscription: "projects/p/subscriptions/akeso".into(),
        }
    }

    fn post(envelope: &PushEnvelope) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(envelope).unwrap()))
            .unwrap()
    }

    fn app(store: Arc<MemoryStore>) -> Router {
        router::build(AppState::new(store, BUCKET.into()))
    }

    /// Uploads an akeso object and lazily rotates it once, returning the
    /// metadata-update event the store emitted.
    async fn pending_object(store: &MemoryStore) -> (ChangeEvent, KeyMaterial) {
        let mut rx = store.subscribe();
        let akeso = Strategy::Akeso(AkesoPolicy::default());
        let old = KeyMaterial::Raw(KeyBytes::random());
        let new = KeyMaterial::Raw(KeyBytes::random());
        akeso.upload(store, "doc", b"hello world", &old).await.unwrap();

        let dek = KeyBytes::random();
        let mut custom_attributes = BTreeMap::new();
        custom_attributes.insert(NEW_DEK_ATTRIBUTE.to_owned(), dek.to_base64());
        store
            .configure_change_notification(&NotificationConfig {
                topic: "rotation".into(),
                event_type: EventType::ObjectMetadataUpdate,
                custom_attributes,
            })
            .await
            .unwrap();
        akeso
            .update(
                store,
                "doc",
                UpdateKeys {
                    old: &old,
                    new: &new,
                    dek: Some(&dek),
                },
            )
            .await
            .unwrap();
        (rx.recv().await.unwrap(), new)
    }

    #[tokio::test]
    async fn push_applies_pending_layer() {
        let store = Arc::new(MemoryStore::new(BUCKET));
        let (event, new_key) = pending_object(&store).await;

        let resp = app(store.clone())
            .oneshot(post(&envelope_for(&event)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let attrs = store
            .head("doc", &ServerSideEncryption::None)
            .await
            .unwrap();
        assert_eq!(attrs.metadata[meta::UPDATED_BY], updated_by::RESPONDER);
        assert_eq!(attrs.metadata[meta::ONGOING_REENCRYPTION], "false");
        let plaintext = Strategy::Akeso(AkesoPolicy::default())
            .download(&*store, "doc", &new_key)
            .await
            .unwrap();
        assert_eq!(plaintext, b"hello world");

        // Redelivery is acknowledged without another write.
        let resp = app(store.clone())
            .oneshot(post(&envelope_for(&event)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn finalize_event_is_acknowledged_without_write() {
        let store = Arc::new(MemoryStore::new(BUCKET));
        let (mut event, _) = pending_object(&store).await;
        event.event_type = EventType::ObjectFinalize;
        let before = store.raw_payload("doc").await.unwrap();

        let resp = app(store.clone())
            .oneshot(post(&envelope_for(&event)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(store.raw_payload("doc").await.unwrap(), before);
    }

    #[tokio::test]
    async fn other_bucket_is_dropped() {
        let store = Arc::new(MemoryStore::new(BUCKET));
        let (mut event, _) = pending_object(&store).await;
        event.bucket = "elsewhere".into();
        let before = store.raw_payload("doc").await.unwrap();

        let resp = app(store.clone())
            .oneshot(post(&envelope_for(&event)))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert_eq!(store.raw_payload("doc").await.unwrap(), before);
    }

    #[tokio::test]
    async fn missing_dek_is_bad_request() {
        let store = Arc::new(MemoryStore::new(BUCKET));
        let (mut event, _) = pending_object(&store).await;
        event.attributes.remove(NEW_DEK_ATTRIBUTE);

        let resp = app(store).oneshot(post(&envelope_for(&event))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let store = Arc::new(MemoryStore::new(BUCKET));
        let (mut event, _) = pending_object(&store).await;
        event.name = "gone".into();

        let resp = app(store).oneshot(post(&envelope_for(&event))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn decode_rejects_bad_base64() {
        let envelope = PushEnvelope {
            message: PushMessage {
                data: "%%%".into(),
                attributes: BTreeMap::new(),
                message_id: String::new(),
            },
            subscription: String::new(),
        };
        assert!(matches!(decode_event(envelope), Err(EngineError::Input(_))));
    }

    #[test]
    fn decode_requires_event_type() {
        let resource = ObjectResource {
            bucket: BUCKET.into(),
            name: "doc".into(),
            generation: "1".into(),
            metadata: BTreeMap::new(),
        };
        let envelope = PushEnvelope {
            message: PushMessage {
                data: STANDARD.encode(serde_json::to_vec(&resource).unwrap()),
                attributes: BTreeMap::new(),
                message_id: String::new(),
            },
            subscription: String::new(),
        };
        let err = decode_event(envelope).unwrap_err();
        assert_eq!(err.code(), "bad_request");
    }

    #[tokio::test]
    async fn health_reports_bucket() {
        let store = Arc::new(MemoryStore::new(BUCKET));
        let req = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let resp = app(store).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(health.bucket, BUCKET);
    }
}
