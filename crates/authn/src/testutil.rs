//! Shared test utilities for authentication testing.
//!
//! This module provides helpers for generating subject key pairs, signing
//! requests the way a real client would, wrapping a key store with injected
//! faults, and asserting on authentication errors. It is feature-gated behind
//! `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! tokengate-authn = { path = "../authn", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use tokengate_authn::testutil::{TestKeyPair, entry_for};
//! ```

use std::{
    collections::VecDeque,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::Mutex;
use rand_core::OsRng;
use tokengate_storage::{
    StorageError, StorageResult, SubjectId,
    keys::{MemorySubjectKeyStore, PublicKeyEntry, SubjectKeyStore},
};

use crate::{
    authentication::AuthenticationCore, canonical::canonical_message, clock::ManualClock,
    config::AuthConfig, issuer::ServerSigningKey, request::TokenRequest,
};

/// A subject's Ed25519 key pair, as held by a client.
pub struct TestKeyPair {
    signing_key: SigningKey,
}

impl TestKeyPair {
    /// Generates a fresh random key pair.
    #[must_use]
    pub fn generate() -> Self {
        Self { signing_key: SigningKey::generate(&mut OsRng) }
    }

    /// Public key as base64url without padding (43 characters), the format
    /// stored in [`PublicKeyEntry::public_key`].
    #[must_use]
    pub fn public_key_b64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().to_bytes())
    }

    /// Signs arbitrary bytes, returning base64url text without padding.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.sign(message).to_bytes())
    }

    /// Builds a correctly signed [`TokenRequest`].
    #[must_use]
    pub fn sign_request(&self, subject: i64, nonce: &str) -> TokenRequest {
        let message = canonical_message(SubjectId::from(subject), nonce);
        TokenRequest::new(subject, nonce, self.sign(&message))
    }
}

/// Creates an active, open-ended [`PublicKeyEntry`] for `pair`, valid since
/// one hour ago.
#[must_use]
pub fn entry_for(subject: i64, kid: &str, pair: &TestKeyPair) -> PublicKeyEntry {
    PublicKeyEntry::builder()
        .subject_id(subject)
        .kid(kid)
        .public_key(pair.public_key_b64())
        .valid_from(Utc::now() - chrono::Duration::hours(1))
        .build()
}

/// Registers a fresh key pair for `subject` in `store` and returns it.
///
/// # Panics
///
/// Panics if registration fails.
pub async fn enroll(store: &impl SubjectKeyStore, subject: i64) -> TestKeyPair {
    let pair = TestKeyPair::generate();
    store
        .register_key(&entry_for(subject, &format!("{subject}-a"), &pair))
        .await
        .expect("enroll: register_key failed");
    pair
}

/// Builds an [`AuthenticationCore`] over `store` with a fresh server key,
/// driven by `clock`.
#[must_use]
pub fn test_core(
    config: AuthConfig,
    store: Arc<dyn SubjectKeyStore>,
    clock: &ManualClock,
) -> AuthenticationCore {
    AuthenticationCore::builder()
        .config(config)
        .key_store(store)
        .signing_key(ServerSigningKey::generate("test-server"))
        .clock(Arc::new(clock.clone()))
        .build()
}

/// A [`SubjectKeyStore`] wrapper that injects faults into `get_keys`.
///
/// Queued failures are returned one per call, in order, before the wrapped
/// store is consulted. A configured delay is applied to every `get_keys`
/// call, which makes timeouts reproducible under a paused tokio clock.
#[derive(Clone, Default)]
pub struct FlakyKeyStore {
    inner: MemorySubjectKeyStore,
    failures: Arc<Mutex<VecDeque<fn() -> StorageError>>>,
    delay: Arc<Mutex<Duration>>,
    get_count: Arc<AtomicUsize>,
}

impl FlakyKeyStore {
    /// Wraps an existing in-memory store.
    #[must_use]
    pub fn new(inner: MemorySubjectKeyStore) -> Self {
        Self { inner, ..Self::default() }
    }

    /// Queues `count` failures produced by `factory`.
    pub fn fail_next(&self, count: usize, factory: fn() -> StorageError) {
        let mut failures = self.failures.lock();
        for _ in 0..count {
            failures.push_back(factory);
        }
    }

    /// Delays every subsequent `get_keys` call.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Number of `get_keys` calls observed so far.
    #[must_use]
    pub fn get_count(&self) -> usize {
        self.get_count.load(Ordering::SeqCst)
    }

    /// The wrapped store.
    #[must_use]
    pub fn inner(&self) -> &MemorySubjectKeyStore {
        &self.inner
    }
}

#[async_trait]
impl SubjectKeyStore for FlakyKeyStore {
    async fn register_key(&self, entry: &PublicKeyEntry) -> StorageResult<()> {
        self.inner.register_key(entry).await
    }

    async fn get_keys(&self, subject_id: SubjectId) -> StorageResult<Vec<PublicKeyEntry>> {
        self.get_count.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().pop_front();
        if let Some(factory) = failure {
            return Err(factory());
        }
        self.inner.get_keys(subject_id).await
    }

    async fn revoke_key(
        &self,
        subject_id: SubjectId,
        kid: &str,
        reason: Option<&str>,
    ) -> StorageResult<()> {
        self.inner.revoke_key(subject_id, kid, reason).await
    }

    async fn rotate_key(&self, new_entry: &PublicKeyEntry) -> StorageResult<()> {
        self.inner.rotate_key(new_entry).await
    }

    async fn remove_subject(&self, subject_id: SubjectId) -> StorageResult<usize> {
        self.inner.remove_subject(subject_id).await
    }
}

/// Asserts that a [`Result<T, AuthError>`] is an `Err` matching the given
/// [`AuthError`](crate::error::AuthError) variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use tokengate_authn::assert_auth_error;
/// use tokengate_authn::error::AuthError;
///
/// let result: Result<(), AuthError> = Err(AuthError::nonce_expired());
/// assert_auth_error!(result, NonceExpired);
/// ```
#[macro_export]
macro_rules! assert_auth_error {
    ($result:expr, $variant:ident) => {
        $crate::assert_auth_error!($result, $variant, "assertion failed")
    };
    ($result:expr, $variant:ident, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::AuthError::$variant { .. })),
            "{}: expected AuthError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            result,
        );
    }};
}

/// Asserts that a [`Result<T, AuthRejection>`](crate::error::AuthRejection)
/// is a rejection whose internal reason is the given `AuthError` variant.
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use tokengate_authn::assert_rejected;
/// use tokengate_authn::error::{AuthError, AuthRejection, AuthStage};
///
/// let result: Result<(), AuthRejection> =
///     Err(AuthRejection::new(AuthStage::Received, AuthError::nonce_replayed()));
/// assert_rejected!(result, NonceReplayed);
/// ```
#[macro_export]
macro_rules! assert_rejected {
    ($result:expr, $variant:ident) => {
        $crate::assert_rejected!($result, $variant, "assertion failed")
    };
    ($result:expr, $variant:ident, $msg:expr) => {{
        match $result {
            Err(rejection) => assert!(
                matches!(rejection.reason(), $crate::error::AuthError::$variant { .. }),
                "{}: expected rejection with AuthError::{}, got: {:?}",
                $msg,
                stringify!($variant),
                rejection.reason(),
            ),
            Ok(_) => panic!("{}: expected rejection with AuthError::{}, got Ok", $msg, stringify!($variant)),
        }
    }};
}
