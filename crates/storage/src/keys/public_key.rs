//! Subject public key entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::types::SubjectId;

/// Signature scheme a stored public key belongs to.
///
/// Subjects registered by older clients may carry RSA or P-256 keys (the
/// registration flow accepted any SubjectPublicKeyInfo PEM). Only
/// [`SignatureAlgorithm::Ed25519`] has a verification path; entries tagged with
/// anything else are stored and resolved normally but never verify.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureAlgorithm {
    /// Ed25519 (RFC 8032), 32-byte public keys, 64-byte signatures.
    Ed25519,
    /// ECDSA over P-256 with SHA-256.
    EcdsaP256Sha256,
    /// RSASSA-PKCS1-v1_5 with SHA-256.
    RsaPkcs1Sha256,
}

impl SignatureAlgorithm {
    /// Returns the wire name of the algorithm.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::EcdsaP256Sha256 => "ecdsa_p256_sha256",
            Self::RsaPkcs1Sha256 => "rsa_pkcs1_sha256",
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a [`PublicKeyEntry`] at a given instant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyState {
    /// Not revoked and inside its validity window.
    Active,
    /// `valid_from` lies in the future.
    NotYetValid,
    /// `valid_until` lies in the past.
    Expired,
    /// Permanently revoked.
    Revoked,
}

/// A subject's public key as held by the key store.
///
/// The private half never leaves the subject. Entries form a history per
/// subject: rotation revokes the previous entry and appends a new one, so a
/// subject has at most one active entry at any instant.
///
/// # Validity Rules
///
/// An entry verifies requests at instant `now` only if:
/// - `revoked_at.is_none()`
/// - `now >= valid_from`
/// - `valid_until.is_none() || now <= valid_until`
///
/// # Example
///
/// ```
/// use chrono::{Duration, Utc};
/// use tokengate_storage::keys::{KeyState, PublicKeyEntry, SignatureAlgorithm};
///
/// let entry = PublicKeyEntry::builder()
///     .subject_id(42)
///     .kid("42-2026-01")
///     .public_key("11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo".to_owned())
///     .valid_until(Utc::now() + Duration::days(90))
///     .build();
///
/// assert_eq!(entry.algorithm, SignatureAlgorithm::Ed25519);
/// assert_eq!(entry.state_at(Utc::now()), KeyState::Active);
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, bon::Builder)]
#[serde(deny_unknown_fields)]
pub struct PublicKeyEntry {
    /// Subject that owns the key.
    #[builder(into)]
    pub subject_id: SubjectId,

    /// Key identifier, unique within the subject's history.
    #[builder(into)]
    pub kid: String,

    /// Signature scheme of `public_key`.
    #[builder(default = SignatureAlgorithm::Ed25519)]
    pub algorithm: SignatureAlgorithm,

    /// Public key material, base64url-encoded without padding.
    ///
    /// For Ed25519 this is the raw 32-byte point (43 characters).
    #[builder(into)]
    pub public_key: Zeroizing<String>,

    /// When the entry was registered.
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    /// Start of the validity window.
    #[builder(default = Utc::now())]
    pub valid_from: DateTime<Utc>,

    /// End of the validity window, inclusive. `None` means open-ended.
    pub valid_until: Option<DateTime<Utc>>,

    /// Revocation timestamp. Once set it is never cleared.
    pub revoked_at: Option<DateTime<Utc>>,

    /// Human-readable revocation reason kept for audit.
    #[serde(default)]
    pub revocation_reason: Option<String>,
}

impl PublicKeyEntry {
    /// Returns `true` if the entry has been revoked.
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        self.revoked_at.is_some()
    }

    /// Evaluates the entry's lifecycle state at `now`.
    ///
    /// Revocation takes precedence over the validity window.
    #[must_use]
    pub fn state_at(&self, now: DateTime<Utc>) -> KeyState {
        if self.is_revoked() {
            return KeyState::Revoked;
        }
        if now < self.valid_from {
            return KeyState::NotYetValid;
        }
        if let Some(valid_until) = self.valid_until
            && now > valid_until
        {
            return KeyState::Expired;
        }
        KeyState::Active
    }

    /// Returns `true` if the entry is usable for verification at `now`.
    #[must_use]
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        self.state_at(now) == KeyState::Active
    }

    /// Returns `true` if the validity windows of `self` and `other` share at
    /// least one instant. Windows are closed intervals; a missing
    /// `valid_until` extends to infinity.
    #[must_use]
    pub fn window_overlaps(&self, other: &PublicKeyEntry) -> bool {
        let self_starts_in_time = other.valid_until.is_none_or(|until| self.valid_from <= until);
        let other_starts_in_time = self.valid_until.is_none_or(|until| other.valid_from <= until);
        self_starts_in_time && other_starts_in_time
    }
}
