//! Common error types shared across crates.

use thiserror::Error;

/// Top-level engine error type.
///
/// Variants follow the failure taxonomy of the rotation engine. The two
/// binaries map them onto process exit codes ([`EngineError::exit_code`]) and
/// HTTP status codes ([`EngineError::http_status`]).
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed key or nonce sizes, bad locations, missing configuration.
    /// Nothing has been written when this is returned.
    #[error("invalid input: {0}")]
    Input(String),

    /// A GCM tag or header unwrap failed: tampered data or the wrong key.
    #[error("authentication failure: {0}")]
    AuthenticationFailure(String),

    /// The object's recorded strategy differs from the requested one.
    #[error("protocol mismatch: expected strategy {expected}, object is tagged {found}")]
    ProtocolMismatch { expected: String, found: String },

    /// A conditional write lost a race against a concurrent writer.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    /// One or more objects failed inside a bucket-wide rotation job.
    #[error("rotation incomplete: {failed} of {total} objects failed")]
    PartialRotationFailure { failed: usize, total: usize },

    /// The named object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The object store rejected or failed a request.
    #[error("store error: {0}")]
    Store(String),

    /// An unexpected internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Returns `true` for failures that may succeed when retried unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::VersionConflict(_) | EngineError::Store(_))
    }

    /// Returns the HTTP status code that should be sent for this error.
    ///
    /// Push transports redeliver on any non-2xx answer, so transient failures
    /// map to 409/503 and permanent ones to 4xx/500.
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Input(_) => 400,
            EngineError::AuthenticationFailure(_) => 500,
            EngineError::ProtocolMismatch { .. } => 422,
            EngineError::VersionConflict(_) => 409,
            EngineError::PartialRotationFailure { .. } => 500,
            EngineError::NotFound(_) => 404,
            EngineError::Store(_) => 503,
            EngineError::Internal(_) => 500,
        }
    }

    /// Short machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Input(_) => "bad_request",
            EngineError::AuthenticationFailure(_) => "authentication_failure",
            EngineError::ProtocolMismatch { .. } => "protocol_mismatch",
            EngineError::VersionConflict(_) => "version_conflict",
            EngineError::PartialRotationFailure { .. } => "partial_rotation_failure",
            EngineError::NotFound(_) => "not_found",
            EngineError::Store(_) => "store_unavailable",
            EngineError::Internal(_) => "internal_error",
        }
    }

    /// Returns the process exit code the CLI uses for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::Input(_) => 2,
            EngineError::AuthenticationFailure(_) => 3,
            EngineError::ProtocolMismatch { .. } => 4,
            EngineError::VersionConflict(_) => 5,
            EngineError::PartialRotationFailure { .. } => 6,
            EngineError::NotFound(_) => 7,
            EngineError::Store(_) => 8,
            EngineError::Internal(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_codes() {
        assert_eq!(EngineError::Input("x".into()).http_status(), 400);
        assert_eq!(EngineError::VersionConflict("x".into()).http_status(), 409);
        assert_eq!(EngineError::NotFound("x".into()).http_status(), 404);
        assert_eq!(EngineError::Store("x".into()).http_status(), 503);
        assert_eq!(
            EngineError::AuthenticationFailure("x".into()).http_status(),
            500
        );
    }

    #[test]
    fn exit_codes_are_non_zero() {
        let errors = [
            EngineError::Input("x".into()),
            EngineError::AuthenticationFailure("x".into()),
            EngineError::ProtocolMismatch {
                expected: "akeso".into(),
                found: "keywrap".into(),
            },
            EngineError::VersionConflict("x".into()),
            EngineError::PartialRotationFailure { failed: 1, total: 2 },
            EngineError::NotFound("x".into()),
            EngineError::Store("x".into()),
            EngineError::Internal("x".into()),
        ];
        for e in errors {
            assert_ne!(e.exit_code(), 0, "{e}");
        }
    }

    #[test]
    fn error_codes() {
        assert_eq!(EngineError::Input("x".into()).code(), "bad_request");
        assert_eq!(
            EngineError::VersionConflict("x".into()).code(),
            "version_conflict"
        );
    }

    #[test]
    fn transient_classification() {
        assert!(EngineError::VersionConflict("x".into()).is_transient());
        assert!(EngineError::Store("x".into()).is_transient());
        assert!(!EngineError::AuthenticationFailure("x".into()).is_transient());
        assert!(!EngineError::Input("x".into()).is_transient());
    }

    #[test]
    fn display_includes_strategies() {
        let e = EngineError::ProtocolMismatch {
            expected: "akeso".into(),
            found: "strawman".into(),
        };
        let s = e.to_string();
        assert!(s.contains("akeso") && s.contains("strawman"));
    }
}
