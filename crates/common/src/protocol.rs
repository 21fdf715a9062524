//! Types exchanged between the engine, the object store, and the responder.
//!
//! Object metadata is the only place protection state lives at rest, so the
//! key names below are part of the on-store format and must not change.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

// ---------------------------------------------------------------------------
// Strategy tags
// ---------------------------------------------------------------------------

/// Per-object protection scheme, recorded in metadata under
/// [`meta::STRATEGY`] at upload time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyTag {
    /// Direct AES-GCM under the KEK; rotation rewrites the payload.
    Strawman,
    /// Store-managed customer-supplied key.
    Csek,
    /// Store-managed provider key identifier.
    Cmek,
    /// Envelope encryption: data key wrapped by the KEK.
    Keywrap,
    /// Lazy layered re-encryption.
    Akeso,
}

impl StrategyTag {
    /// Every tag, in declaration order.
    pub const ALL: [StrategyTag; 5] = [
        StrategyTag::Strawman,
        StrategyTag::Csek,
        StrategyTag::Cmek,
        StrategyTag::Keywrap,
        StrategyTag::Akeso,
    ];

    /// The metadata value for this tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyTag::Strawman => "strawman",
            StrategyTag::Csek => "csek",
            StrategyTag::Cmek => "cmek",
            StrategyTag::Keywrap => "keywrap",
            StrategyTag::Akeso => "akeso",
        }
    }
}

impl fmt::Display for StrategyTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyTag {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyTag::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| EngineError::Input(format!("unknown strategy: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Metadata keys
// ---------------------------------------------------------------------------

/// Object metadata key names.
pub mod meta {
    pub const STRATEGY: &str = "akeso_strategy";
    pub const DATA_NONCE: &str = "akeso_data_nonce";
    pub const DATA_TAG: &str = "akeso_data_tag";
    pub const KEY_NONCE: &str = "akeso_key_nonce";
    pub const WRAPPED_KEY: &str = "akeso_wrapped_key";
    /// Sealed Akeso header.
    pub const DEKS: &str = "akeso_deks";
    /// Base IV in the clear, for the responder (which never sees the header).
    pub const BASE_IV: &str = "akeso_iv";
    pub const UPDATED_BY: &str = "updated_by";
    pub const ONGOING_REENCRYPTION: &str = "ongoing_reencryption";
    pub const TIMES_UPDATED: &str = "times_updated";
}

/// Values written to [`meta::UPDATED_BY`].
pub mod updated_by {
    /// Full writes by the engine (upload, compaction).
    pub const ENGINE: &str = "akesod";
    /// Header-only lazy rotation by the engine.
    pub const METADATA_UPDATER: &str = "akesod-metadata-updater";
    /// Physical layer applied by the responder.
    pub const RESPONDER: &str = "cloud-function";
}

/// Notification attribute carrying the base64 job DEK to the responder.
pub const NEW_DEK_ATTRIBUTE: &str = "new_dek";

/// Notification attribute naming the [`EventType`] of a push delivery.
pub const EVENT_TYPE_ATTRIBUTE: &str = "eventType";

// ---------------------------------------------------------------------------
// Change notifications
// ---------------------------------------------------------------------------

/// Store event kinds the engine subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// A new object generation was written (upload or payload rewrite).
    ObjectFinalize,
    /// Only the metadata of an existing generation changed.
    ObjectMetadataUpdate,
    ObjectDelete,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ObjectFinalize => "OBJECT_FINALIZE",
            EventType::ObjectMetadataUpdate => "OBJECT_METADATA_UPDATE",
            EventType::ObjectDelete => "OBJECT_DELETE",
        }
    }
}

impl FromStr for EventType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OBJECT_FINALIZE" => Ok(EventType::ObjectFinalize),
            "OBJECT_METADATA_UPDATE" => Ok(EventType::ObjectMetadataUpdate),
            "OBJECT_DELETE" => Ok(EventType::ObjectDelete),
            other => Err(EngineError::Input(format!("unknown event type: {other}"))),
        }
    }
}

/// A store change event as seen by the responder.
///
/// `metadata` is the object's metadata at the time of the change; `attributes`
/// are the out-of-band custom attributes of the notification configuration
/// and are never persisted with the object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub bucket: String,
    pub name: String,
    pub generation: String,
    pub metadata: BTreeMap<String, String>,
    pub attributes: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Push delivery envelope
// ---------------------------------------------------------------------------

/// Body of a push delivery from the notification transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

/// The message inside a [`PushEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    /// Base64-encoded JSON [`ObjectResource`].
    pub data: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub message_id: String,
}

/// Object resource carried in a notification payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectResource {
    pub bucket: String,
    pub name: String,
    #[serde(default)]
    pub generation: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// HTTP bodies
// ---------------------------------------------------------------------------

/// Standard error response body returned on any non-2xx status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Short machine-readable error code (e.g. `"bad_request"`).
    pub code: String,
    /// Human-readable description safe to expose to callers.
    pub message: String,
}

impl ErrorResponse {
    /// Construct an [`ErrorResponse`] from a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// Response body for `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub bucket: String,
}
