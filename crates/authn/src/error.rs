//! Authentication error types.
//!
//! Two layers of errors live here:
//!
//! - [`AuthError`] is the internal, diagnostic error. Every failure inside the core is recovered
//!   into one of its kinds, which is logged and kept for in-process inspection.
//! - [`AuthRejection`] is what callers outside the process see: a generic "authentication failed"
//!   with an opaque correlation id and a retry hint. It never renders the internal kind.

use std::fmt;

use serde::{Serialize, Serializer, ser::SerializeStruct};
use thiserror::Error;
use tokengate_storage::{StorageError, SubjectId};
use uuid::Uuid;

/// Authentication failures.
///
/// | Kind | Retryable |
/// |------|-----------|
/// | `MalformedRequest` | no |
/// | `UnknownSubject`, `RevokedKey`, `ExpiredKey` | no |
/// | `InvalidSignature` | no (same payload always fails) |
/// | `NonceReplayed`, `NonceExpired` | no (fetch a fresh nonce) |
/// | `IssuanceUnavailable` | yes |
/// | `StoreTimeout` | yes, with backoff |
/// | `StoreUnavailable` | only if the store fault is transient |
/// | `InvalidCredential` | no |
///
/// # Non-exhaustive
///
/// This enum is marked `#[non_exhaustive]`: new variants may be added in
/// future minor releases without a semver-breaking change. Downstream match
/// expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// The request failed shape validation before any lookup happened.
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// No key entry exists for the subject.
    #[error("Unknown subject: {subject_id}")]
    UnknownSubject {
        /// Subject that has no registered key.
        subject_id: SubjectId,
    },

    /// Every key entry of the subject has been revoked.
    #[error("Key revoked for subject {subject_id}: {kid}")]
    RevokedKey {
        /// Subject whose key is revoked.
        subject_id: SubjectId,
        /// Most recent revoked key.
        kid: String,
    },

    /// The subject's unrevoked key is outside its validity window.
    #[error("Key outside validity window for subject {subject_id}: {kid}")]
    ExpiredKey {
        /// Subject whose key is not currently valid.
        subject_id: SubjectId,
        /// Key that is expired or not yet valid.
        kid: String,
    },

    /// Signature verification failed, including undecodable signatures and
    /// unsupported key algorithms.
    #[error("Invalid signature")]
    InvalidSignature,

    /// The nonce was already consumed by an earlier request.
    #[error("Nonce replayed")]
    NonceReplayed,

    /// The nonce is outside its freshness window or was never issued.
    #[error("Nonce expired")]
    NonceExpired,

    /// The token issuer could not mint a credential.
    #[error("Issuance unavailable: {0}")]
    IssuanceUnavailable(String),

    /// The key store did not answer within the configured bound.
    #[error("Key store timeout")]
    StoreTimeout,

    /// The key store failed with something other than a timeout.
    ///
    /// Wraps the original [`StorageError`] to preserve the full error source
    /// chain for debugging and structured logging.
    #[error("Key store unavailable: {0}")]
    StoreUnavailable(
        /// The underlying storage error.
        #[source]
        StorageError,
    ),

    /// A session credential presented for validation was rejected.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),
}

impl AuthError {
    /// Creates a [`AuthError::MalformedRequest`].
    #[must_use]
    pub fn malformed_request(reason: impl Into<String>) -> Self {
        Self::MalformedRequest(reason.into())
    }

    /// Creates an [`AuthError::UnknownSubject`].
    #[must_use]
    pub fn unknown_subject(subject_id: SubjectId) -> Self {
        Self::UnknownSubject { subject_id }
    }

    /// Creates an [`AuthError::RevokedKey`].
    #[must_use]
    pub fn revoked_key(subject_id: SubjectId, kid: impl Into<String>) -> Self {
        Self::RevokedKey { subject_id, kid: kid.into() }
    }

    /// Creates an [`AuthError::ExpiredKey`].
    #[must_use]
    pub fn expired_key(subject_id: SubjectId, kid: impl Into<String>) -> Self {
        Self::ExpiredKey { subject_id, kid: kid.into() }
    }

    /// Creates an [`AuthError::InvalidSignature`].
    #[must_use]
    pub fn invalid_signature() -> Self {
        Self::InvalidSignature
    }

    /// Creates an [`AuthError::NonceReplayed`].
    #[must_use]
    pub fn nonce_replayed() -> Self {
        Self::NonceReplayed
    }

    /// Creates an [`AuthError::NonceExpired`].
    #[must_use]
    pub fn nonce_expired() -> Self {
        Self::NonceExpired
    }

    /// Creates an [`AuthError::IssuanceUnavailable`].
    #[must_use]
    pub fn issuance_unavailable(reason: impl Into<String>) -> Self {
        Self::IssuanceUnavailable(reason.into())
    }

    /// Creates an [`AuthError::StoreTimeout`].
    #[must_use]
    pub fn store_timeout() -> Self {
        Self::StoreTimeout
    }

    /// Creates an [`AuthError::InvalidCredential`].
    #[must_use]
    pub fn invalid_credential(reason: impl Into<String>) -> Self {
        Self::InvalidCredential(reason.into())
    }

    /// Returns `true` if repeating the same request later may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::IssuanceUnavailable(_) | Self::StoreTimeout => true,
            Self::StoreUnavailable(source) => source.is_transient(),
            _ => false,
        }
    }

    /// Stable snake_case name of the error kind, used as a log field.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedRequest(_) => "malformed_request",
            Self::UnknownSubject { .. } => "unknown_subject",
            Self::RevokedKey { .. } => "revoked_key",
            Self::ExpiredKey { .. } => "expired_key",
            Self::InvalidSignature => "invalid_signature",
            Self::NonceReplayed => "nonce_replayed",
            Self::NonceExpired => "nonce_expired",
            Self::IssuanceUnavailable(_) => "issuance_unavailable",
            Self::StoreTimeout => "store_timeout",
            Self::StoreUnavailable(_) => "store_unavailable",
            Self::InvalidCredential(_) => "invalid_credential",
        }
    }
}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Timeout => AuthError::StoreTimeout,
            other => AuthError::StoreUnavailable(other),
        }
    }
}

impl From<jsonwebtoken::errors::Error> for AuthError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        match err.kind() {
            ErrorKind::InvalidToken => AuthError::invalid_credential("Invalid JWT structure"),
            ErrorKind::InvalidSignature => AuthError::invalid_credential("Signature mismatch"),
            ErrorKind::ExpiredSignature => AuthError::invalid_credential("Token expired"),
            ErrorKind::InvalidIssuer => AuthError::invalid_credential("Issuer validation failed"),
            ErrorKind::InvalidAlgorithm => AuthError::invalid_credential("Algorithm not supported"),
            _ => AuthError::invalid_credential(format!("JWT error: {err}")),
        }
    }
}

/// Result type alias for authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Progress of a request through the authentication pipeline.
///
/// ```text
/// Received → KeyResolved → SignatureVerified → NonceConsumed → Issued
///     └──────────┴──────────────┴──────────────────┴──→ Rejected
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthStage {
    /// The request arrived; nothing has been checked yet.
    Received,
    /// A usable public key was found for the subject.
    KeyResolved,
    /// The signature over the canonical message checked out.
    SignatureVerified,
    /// The nonce was consumed; the request can no longer be replayed.
    NonceConsumed,
    /// A session token was minted.
    Issued,
}

impl AuthStage {
    /// Returns the snake_case name of the stage.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::KeyResolved => "key_resolved",
            Self::SignatureVerified => "signature_verified",
            Self::NonceConsumed => "nonce_consumed",
            Self::Issued => "issued",
        }
    }
}

impl fmt::Display for AuthStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only error shape that leaves the authentication core.
///
/// `Display` and `Serialize` reveal nothing beyond "authentication failed",
/// the correlation id and whether a retry may help. The internal
/// [`AuthError`] is kept for in-process diagnostics via
/// [`reason`](Self::reason) and is not exposed through
/// [`std::error::Error::source`].
///
/// ```
/// use tokengate_authn::{AuthError, AuthRejection, AuthStage};
///
/// let rejection = AuthRejection::new(AuthStage::Received, AuthError::nonce_replayed());
/// assert_eq!(rejection.to_string(), "authentication failed");
/// assert!(matches!(rejection.reason(), AuthError::NonceReplayed));
/// ```
#[derive(Debug, Error)]
#[error("authentication failed")]
pub struct AuthRejection {
    correlation_id: Uuid,
    stage: AuthStage,
    reason: AuthError,
}

impl AuthRejection {
    /// Wraps `reason` with a fresh correlation id.
    #[must_use]
    pub fn new(stage: AuthStage, reason: AuthError) -> Self {
        Self { correlation_id: Uuid::new_v4(), stage, reason }
    }

    /// Opaque identifier shared between the caller-visible rejection and the
    /// server-side log line.
    #[must_use]
    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    /// Last stage the request completed before it was rejected.
    #[must_use]
    pub fn stage(&self) -> AuthStage {
        self.stage
    }

    /// Returns `true` if the caller may retry the same request.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.reason.is_retryable()
    }

    /// Internal failure kind. For in-process diagnostics only.
    #[must_use]
    pub fn reason(&self) -> &AuthError {
        &self.reason
    }

    /// Consumes the rejection, returning the internal failure kind.
    #[must_use]
    pub fn into_reason(self) -> AuthError {
        self.reason
    }
}

impl Serialize for AuthRejection {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut body = serializer.serialize_struct("AuthRejection", 3)?;
        body.serialize_field("error", "authentication_failed")?;
        body.serialize_field("correlation_id", &self.correlation_id)?;
        body.serialize_field("retryable", &self.is_retryable())?;
        body.end()
    }
}
