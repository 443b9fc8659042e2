//! # tokengate authentication core
//!
//! Turns a signed nonce request into a short-lived session token.
//!
//! This crate provides:
//! - **Challenges**: server-issued nonces, each consumable once within a freshness window
//! - **Key resolution**: a cached, bounded lookup of the subject's active public key
//! - **Signature verification**: Ed25519 over a length-prefixed canonical message
//! - **Token issuance**: EdDSA-signed JWT session tokens with expiry
//!
//! ## Flow
//!
//! ```text
//! client                                   AuthenticationCore
//!   │ ── issue_challenge(subject) ────────►  NonceLedger.register
//!   │ ◄─────────────────────── nonce ──────
//!   │   sign(canonical_message(subject, nonce))
//!   │ ── authenticate(TokenRequest) ──────►  KeyResolver.resolve
//!   │                                        SignatureVerifier.verify
//!   │                                        NonceLedger.try_consume
//!   │ ◄──────────── Token | rejection ─────  TokenIssuer.issue
//! ```
//!
//! ## Errors
//!
//! Every failure leaves the core as an [`AuthRejection`]: a generic
//! "authentication failed" with a correlation id. The internal [`AuthError`]
//! kind is logged under the same correlation id.
//!
//! ## Features
//!
//! - **`testutil`**: key pair generation, request signing, a fault-injecting key store and
//!   assertion macros
//! - **`failpoints`**: enables `fail` fail points (`resolver-before-store-fetch`,
//!   `issuer-before-sign`)

#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The authentication state machine.
pub mod authentication;
/// Canonical request encoding.
pub mod canonical;
/// Injectable time source.
pub mod clock;
/// Configuration.
pub mod config;
/// Authentication error types.
pub mod error;
/// Session token minting and validation.
pub mod issuer;
/// Subject key resolution.
pub mod key_resolver;
/// Nonce issuance and consumption.
pub mod nonce;
/// The signed request.
pub mod request;
mod retry;
/// Shared test utilities.
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used, clippy::panic)]
pub mod testutil;
/// Request shape and algorithm checks.
pub mod validation;
/// Signature verification.
pub mod verifier;

// Re-export key types for convenience
pub use authentication::AuthenticationCore;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AuthConfig, ConfigError, RetryPolicyConfig};
pub use error::{AuthError, AuthRejection, AuthStage, Result};
pub use issuer::{ServerSigningKey, SessionClaims, Token, TokenIssuer};
pub use key_resolver::KeyResolver;
pub use nonce::{ConsumeOutcome, InMemoryNonceLedger, NonceChallenge, NonceLedger, NonceRecord};
pub use request::TokenRequest;
pub use verifier::SignatureVerifier;
