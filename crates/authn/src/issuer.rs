//! Session token minting and validation.
//!
//! Tokens are compact EdDSA-signed JWTs. The server's Ed25519 key is the
//! only secret involved; without it a third party can neither mint a token
//! nor alter one.
//!
//! # Claims
//!
//! | Claim | Meaning |
//! |-------|---------|
//! | `iss` | configured issuer |
//! | `sub` | subject id, decimal |
//! | `iat` | issuance time, Unix seconds |
//! | `exp` | expiry, Unix seconds (exclusive) |
//! | `jti` | random UUID v4 |

use std::fmt;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};
use ed25519_dalek::SigningKey;
use fail::fail_point;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use tokengate_storage::{SubjectId, Zeroizing};
use uuid::Uuid;

use crate::{
    config::{AuthConfig, ConfigError},
    error::{AuthError, Result},
};

/// PKCS#8 v1 prefix for a bare Ed25519 private key; the 32-byte seed follows.
const ED25519_PKCS8_PREFIX: [u8; 16] = [
    0x30, 0x2e, // SEQUENCE, 46 bytes
    0x02, 0x01, 0x00, // INTEGER version 0
    0x30, 0x05, // SEQUENCE, 5 bytes (algorithm identifier)
    0x06, 0x03, 0x2b, 0x65, 0x70, // OID 1.3.101.112 (Ed25519)
    0x04, 0x22, // OCTET STRING, 34 bytes
    0x04, 0x20, // OCTET STRING, 32 bytes (the actual key)
];

/// The server-side Ed25519 key that signs session tokens.
///
/// Raw key bytes only ever live in [`Zeroizing`] buffers.
pub struct ServerSigningKey {
    kid: String,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    public_key_b64: String,
}

impl ServerSigningKey {
    /// Generates a fresh random key.
    #[must_use]
    pub fn generate(kid: impl Into<String>) -> Self {
        Self::from_signing_key(kid.into(), &SigningKey::generate(&mut OsRng))
    }

    /// Loads a key from a base64url (no padding) 32-byte seed.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the seed does not decode to
    /// exactly 32 bytes.
    pub fn from_seed_b64(
        kid: impl Into<String>,
        seed_b64: &str,
    ) -> std::result::Result<Self, ConfigError> {
        let bytes: Zeroizing<Vec<u8>> =
            Zeroizing::new(URL_SAFE_NO_PAD.decode(seed_b64).map_err(|e| ConfigError::Invalid {
                field: "signing_key_seed",
                reason: format!("base64 decode: {e}"),
            })?);
        let seed: Zeroizing<[u8; 32]> =
            Zeroizing::new(bytes.as_slice().try_into().map_err(|_| ConfigError::Invalid {
                field: "signing_key_seed",
                reason: format!("expected 32 bytes, got {}", bytes.len()),
            })?);
        Ok(Self::from_signing_key(kid.into(), &SigningKey::from_bytes(&seed)))
    }

    fn from_signing_key(kid: String, signing_key: &SigningKey) -> Self {
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(signing_key.to_bytes());
        let mut pkcs8_der = Zeroizing::new(ED25519_PKCS8_PREFIX.to_vec());
        pkcs8_der.extend_from_slice(&*seed);

        let public_key = signing_key.verifying_key().to_bytes();
        Self {
            kid,
            encoding_key: EncodingKey::from_ed_der(&pkcs8_der),
            decoding_key: DecodingKey::from_ed_der(&public_key),
            public_key_b64: URL_SAFE_NO_PAD.encode(public_key),
        }
    }

    /// Key id placed in the JWT header.
    #[must_use]
    pub fn kid(&self) -> &str {
        &self.kid
    }

    /// Public half as base64url without padding, for publishing to token
    /// consumers.
    #[must_use]
    pub fn public_key_b64(&self) -> &str {
        &self.public_key_b64
    }
}

impl fmt::Debug for ServerSigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSigningKey")
            .field("kid", &self.kid)
            .field("public_key", &self.public_key_b64)
            .finish_non_exhaustive()
    }
}

/// Claims carried by a session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionClaims {
    /// Issuer.
    pub iss: String,
    /// Subject id, decimal.
    pub sub: String,
    /// Issued at (Unix seconds).
    pub iat: i64,
    /// Expires at (Unix seconds, exclusive).
    pub exp: i64,
    /// Unique token id.
    pub jti: String,
}

impl SessionClaims {
    /// Parses `sub` back into a [`SubjectId`].
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] if `sub` is not a positive
    /// integer.
    pub fn subject_id(&self) -> Result<SubjectId> {
        self.sub
            .parse::<i64>()
            .ok()
            .map(SubjectId::from)
            .filter(|id| id.is_valid())
            .ok_or_else(|| AuthError::invalid_credential("sub is not a subject id"))
    }
}

/// A minted session token.
#[derive(Clone)]
pub struct Token {
    /// Subject the token was issued to.
    pub subject_id: SubjectId,
    /// Issuance instant.
    pub issued_at: DateTime<Utc>,
    /// Expiry instant (exclusive).
    pub expires_at: DateTime<Utc>,
    credential: Zeroizing<String>,
}

impl Token {
    /// The signed credential text.
    #[must_use]
    pub fn credential(&self) -> &str {
        &self.credential
    }

    /// The signed credential as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        self.credential.as_bytes()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("subject_id", &self.subject_id)
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("credential", &"<redacted>")
            .finish()
    }
}

/// Mints and validates session tokens.
#[derive(Debug)]
pub struct TokenIssuer {
    key: ServerSigningKey,
    issuer: String,
    ttl: TimeDelta,
}

impl TokenIssuer {
    /// Creates an issuer with the issuer claim and TTL of `config`.
    #[must_use]
    pub fn new(key: ServerSigningKey, config: &AuthConfig) -> Self {
        Self {
            key,
            issuer: config.issuer().to_owned(),
            ttl: TimeDelta::from_std(config.token_ttl()).unwrap_or(TimeDelta::MAX),
        }
    }

    /// The signing key.
    #[must_use]
    pub fn key(&self) -> &ServerSigningKey {
        &self.key
    }

    /// Mints a token for `subject_id`, valid from `now` for the configured
    /// TTL. Both instants are truncated to whole seconds to match the
    /// `iat`/`exp` claims.
    ///
    /// Synchronous: callers holding a consumed nonce reach a result without
    /// yielding.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::IssuanceUnavailable`] if signing fails or the
    /// expiry is not representable.
    #[tracing::instrument(skip(self, now), fields(subject_id = %subject_id))]
    pub fn issue(&self, subject_id: SubjectId, now: DateTime<Utc>) -> Result<Token> {
        let now = now.trunc_subsecs(0);
        let expires_at = now
            .checked_add_signed(self.ttl)
            .ok_or_else(|| AuthError::issuance_unavailable("token expiry out of range"))?;
        let claims = SessionClaims {
            iss: self.issuer.clone(),
            sub: subject_id.to_string(),
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
            jti: Uuid::new_v4().to_string(),
        };

        let mut header = Header::new(Algorithm::EdDSA);
        header.kid = Some(self.key.kid.clone());

        fail_point!("issuer-before-sign", |_| {
            Err(AuthError::issuance_unavailable("injected failure before signing"))
        });
        let credential = jsonwebtoken::encode(&header, &claims, &self.key.encoding_key)
            .map_err(|e| AuthError::issuance_unavailable(format!("signing failed: {e}")))?;

        tracing::info!(
            audit.action = "issue_token",
            audit.resource = %format_args!("subject:{subject_id}"),
            audit.result = "success",
            jti = %claims.jti,
            "audit_event"
        );

        Ok(Token { subject_id, issued_at: now, expires_at, credential: Zeroizing::new(credential) })
    }

    /// Checks a credential minted by this issuer and returns its claims.
    ///
    /// Expiry is judged against `now`, not the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] if the credential is
    /// malformed, signed by another key or algorithm, from another issuer,
    /// or expired at `now`.
    pub fn validate(&self, credential: &str, now: DateTime<Utc>) -> Result<SessionClaims> {
        let header = decode_header(credential)?;
        if header.kid.as_deref() != Some(self.key.kid.as_str()) {
            return Err(AuthError::invalid_credential("unknown key id"));
        }

        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.validate_exp = false; // judged against the injected clock below
        validation.validate_nbf = false;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let claims = decode::<SessionClaims>(credential, &self.key.decoding_key, &validation)?.claims;

        if now.timestamp() >= claims.exp {
            return Err(AuthError::invalid_credential("token expired"));
        }
        claims.subject_id()?;
        Ok(claims)
    }
}
