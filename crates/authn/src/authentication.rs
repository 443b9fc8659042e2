//! The authentication state machine.
//!
//! ```text
//! Received ──resolve──► KeyResolved ──verify──► SignatureVerified ──consume──► NonceConsumed ──issue──► Issued
//!    │                       │                         │                            │
//!    └───────────────────────┴─────────────────────────┴────────────────────────────┴──► Rejected
//! ```
//!
//! Steps run in this fixed order and never skip ahead. The nonce is only
//! consumed once the signature has verified, so a rejected request leaves
//! it untouched. Once consumed, the remaining work is synchronous: a caller
//! that drops the future can no longer interrupt between consumption and
//! issuance.

use std::{sync::Arc, time::Duration};

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand_core::{OsRng, RngCore};
use tokengate_storage::{SubjectId, keys::SubjectKeyStore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    canonical::canonical_message,
    clock::{Clock, SystemClock},
    config::AuthConfig,
    error::{AuthError, AuthRejection, AuthStage},
    issuer::{ServerSigningKey, SessionClaims, Token, TokenIssuer},
    key_resolver::KeyResolver,
    nonce::{ConsumeOutcome, InMemoryNonceLedger, NonceChallenge, NonceLedger, spawn_purge_task},
    request::TokenRequest,
    validation::validate_request,
    verifier::SignatureVerifier,
};

/// Random bytes per issued nonce.
const NONCE_BYTES: usize = 32;

/// Turns signed nonce requests into session tokens.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tokengate_authn::{AuthenticationCore, TokenRequest, config::AuthConfig, issuer::ServerSigningKey};
/// use tokengate_storage::keys::MemorySubjectKeyStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let core = AuthenticationCore::builder()
///     .config(AuthConfig::default())
///     .key_store(Arc::new(MemorySubjectKeyStore::new()))
///     .signing_key(ServerSigningKey::generate("server-1"))
///     .build();
///
/// let challenge = core.issue_challenge(42.into()).await?;
/// // ... the client signs challenge.nonce and sends back a request ...
/// # let request = TokenRequest::new(42, challenge.nonce, "sig");
/// let token = core.authenticate(&request).await?;
/// # Ok(())
/// # }
/// ```
pub struct AuthenticationCore {
    resolver: KeyResolver,
    verifier: SignatureVerifier,
    ledger: Arc<dyn NonceLedger>,
    issuer: TokenIssuer,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    purge_interval: Duration,
    cancel_token: CancellationToken,
}

#[bon::bon]
impl AuthenticationCore {
    /// Assembles a core from its collaborators.
    ///
    /// `clock` defaults to the system clock and `ledger` to an
    /// [`InMemoryNonceLedger`] sized by `config`.
    #[builder]
    pub fn new(
        config: AuthConfig,
        key_store: Arc<dyn SubjectKeyStore>,
        signing_key: ServerSigningKey,
        #[builder(default = Arc::new(SystemClock) as Arc<dyn Clock>)] clock: Arc<dyn Clock>,
        ledger: Option<Arc<dyn NonceLedger>>,
    ) -> Self {
        let ledger: Arc<dyn NonceLedger> = match ledger {
            Some(ledger) => ledger,
            None => Arc::new(InMemoryNonceLedger::from_config(&config)),
        };
        Self {
            resolver: KeyResolver::new(key_store, &config),
            verifier: SignatureVerifier::new(),
            ledger,
            issuer: TokenIssuer::new(signing_key, &config),
            clock,
            store_timeout: config.store_timeout(),
            purge_interval: config.purge_interval(),
            cancel_token: CancellationToken::new(),
        }
    }
}

impl AuthenticationCore {
    /// Authenticates a signed request and mints a session token.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthRejection`] for every failure. Its public face is
    /// always "authentication failed"; the internal [`AuthError`] kind is
    /// logged together with the rejection's correlation id.
    #[tracing::instrument(
        name = "authenticate",
        skip(self, request),
        fields(
            subject_id = %request.subject_id(),
            stage = tracing::field::Empty,
            correlation_id = tracing::field::Empty,
        )
    )]
    pub async fn authenticate(&self, request: &TokenRequest) -> Result<Token, AuthRejection> {
        match self.run(request).await {
            Ok(token) => {
                tracing::Span::current().record("stage", AuthStage::Issued.as_str());
                Ok(token)
            },
            Err(rejection) => {
                let span = tracing::Span::current();
                span.record("stage", rejection.stage().as_str());
                span.record("correlation_id", tracing::field::display(rejection.correlation_id()));
                tracing::warn!(
                    kind = rejection.reason().kind(),
                    stage = %rejection.stage(),
                    correlation_id = %rejection.correlation_id(),
                    retryable = rejection.is_retryable(),
                    error = %rejection.reason(),
                    "authentication rejected"
                );
                Err(rejection)
            },
        }
    }

    async fn run(&self, request: &TokenRequest) -> Result<Token, AuthRejection> {
        let subject_id = request.subject_id();
        validate_request(request).map_err(reject_at(AuthStage::Received))?;

        let key = self
            .resolver
            .resolve(subject_id, self.clock.now())
            .await
            .map_err(reject_at(AuthStage::Received))?;

        let message = canonical_message(subject_id, request.nonce());
        if !self.verifier.verify(&message, request.signature(), &key) {
            return Err(AuthRejection::new(AuthStage::KeyResolved, AuthError::invalid_signature()));
        }

        let now = self.clock.now();
        let consume = self.ledger.try_consume(subject_id, request.nonce(), now);
        let outcome = tokio::time::timeout(self.store_timeout, consume)
            .await
            .map_err(|_| AuthError::store_timeout())
            .and_then(|result| result.map_err(AuthError::from))
            .map_err(reject_at(AuthStage::SignatureVerified))?;
        match outcome {
            ConsumeOutcome::Consumed(record) => {
                tracing::debug!(consumed_at = %record.consumed_at, "nonce consumed");
            },
            ConsumeOutcome::AlreadyUsed => {
                return Err(AuthRejection::new(
                    AuthStage::SignatureVerified,
                    AuthError::nonce_replayed(),
                ));
            },
            ConsumeOutcome::Expired => {
                return Err(AuthRejection::new(
                    AuthStage::SignatureVerified,
                    AuthError::nonce_expired(),
                ));
            },
        }

        // No await points past this line.
        self.issuer.issue(subject_id, now).map_err(reject_at(AuthStage::NonceConsumed))
    }

    /// Issues a fresh nonce for `subject_id` to sign.
    ///
    /// Does not consult the key store, so the answer is the same for known
    /// and unknown subjects.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthRejection`] if the subject id is not positive or the
    /// ledger fails. A subject already holding the maximum number of
    /// outstanding challenges, or a ledger full of them, gets a retryable
    /// rejection; challenges already handed out are never displaced.
    #[tracing::instrument(skip(self), fields(subject_id = %subject_id))]
    pub async fn issue_challenge(
        &self,
        subject_id: SubjectId,
    ) -> Result<NonceChallenge, AuthRejection> {
        if !subject_id.is_valid() {
            let rejection = AuthRejection::new(
                AuthStage::Received,
                AuthError::malformed_request("subject id must be positive"),
            );
            tracing::warn!(
                kind = rejection.reason().kind(),
                correlation_id = %rejection.correlation_id(),
                "challenge rejected"
            );
            return Err(rejection);
        }

        let mut bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut bytes);
        let nonce = URL_SAFE_NO_PAD.encode(bytes);

        let registered = tokio::time::timeout(
            self.store_timeout,
            self.ledger.register(subject_id, nonce, self.clock.now()),
        )
        .await
        .map_err(|_| AuthError::store_timeout())
        .and_then(|result| result.map_err(AuthError::from));

        registered.map_err(|reason| {
            let rejection = AuthRejection::new(AuthStage::Received, reason);
            tracing::warn!(
                kind = rejection.reason().kind(),
                correlation_id = %rejection.correlation_id(),
                error = %rejection.reason(),
                "challenge registration failed"
            );
            rejection
        })
    }

    /// Checks a session token minted by this core against the current time.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidCredential`] if the token is forged,
    /// malformed or expired.
    pub fn validate_token(&self, credential: &str) -> Result<SessionClaims, AuthError> {
        self.issuer.validate(credential, self.clock.now())
    }

    /// Starts the periodic nonce ledger purge. The task stops on
    /// [`shutdown`](Self::shutdown) or when the core is dropped.
    ///
    /// # Panics
    ///
    /// Must be called within a Tokio runtime context.
    pub fn start_purge_task(&self) -> JoinHandle<()> {
        spawn_purge_task(
            Arc::clone(&self.ledger),
            Arc::clone(&self.clock),
            self.purge_interval,
            self.cancel_token.child_token(),
        )
    }

    /// Stops background tasks.
    pub fn shutdown(&self) {
        self.cancel_token.cancel();
    }

    /// The key resolver, for cache invalidation after revocation or rotation.
    #[must_use]
    pub fn resolver(&self) -> &KeyResolver {
        &self.resolver
    }

    /// The nonce ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<dyn NonceLedger> {
        &self.ledger
    }

    /// The token issuer.
    #[must_use]
    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }
}

impl Drop for AuthenticationCore {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

fn reject_at(stage: AuthStage) -> impl FnOnce(AuthError) -> AuthRejection {
    move |reason| AuthRejection::new(stage, reason)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::{SubsecRound, TimeDelta};
    use tokengate_storage::keys::MemorySubjectKeyStore;

    use super::*;
    use crate::{
        assert_rejected,
        clock::ManualClock,
        testutil::{TestKeyPair, enroll},
    };

    struct Fixture {
        core: AuthenticationCore,
        store: MemorySubjectKeyStore,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let store = MemorySubjectKeyStore::new();
        let clock = ManualClock::default();
        let core = AuthenticationCore::builder()
            .config(AuthConfig::default())
            .key_store(Arc::new(store.clone()))
            .signing_key(ServerSigningKey::generate("server-1"))
            .clock(Arc::new(clock.clone()))
            .build();
        Fixture { core, store, clock }
    }

    #[tokio::test]
    async fn test_happy_path() {
        let fx = fixture();
        let pair = enroll(&fx.store, 42).await;
        let challenge = fx.core.issue_challenge(SubjectId::from(42)).await.unwrap();

        let token = fx.core.authenticate(&pair.sign_request(42, &challenge.nonce)).await.unwrap();
        assert_eq!(token.subject_id, SubjectId::from(42));
        assert_eq!(token.issued_at, fx.clock.now().trunc_subsecs(0));

        let claims = fx.core.validate_token(token.credential()).unwrap();
        assert_eq!(claims.sub, "42");
    }

    #[tokio::test]
    async fn test_challenge_nonce_shape() {
        let fx = fixture();
        let challenge = fx.core.issue_challenge(SubjectId::from(7)).await.unwrap();
        assert_eq!(challenge.nonce.len(), 43);
        assert_eq!(challenge.expires_at - challenge.issued_at, TimeDelta::minutes(5));
    }

    #[tokio::test]
    async fn test_challenge_for_unknown_subject_is_issued() {
        let fx = fixture();
        assert!(fx.core.issue_challenge(SubjectId::from(99)).await.is_ok());
    }

    #[tokio::test]
    async fn test_challenge_for_invalid_subject_rejected() {
        let fx = fixture();
        assert_rejected!(fx.core.issue_challenge(SubjectId::from(0)).await, MalformedRequest);
    }

    #[tokio::test]
    async fn test_stage_recorded_on_rejection() {
        let fx = fixture();
        let pair = enroll(&fx.store, 42).await;
        let stranger = TestKeyPair::generate();
        let challenge = fx.core.issue_challenge(SubjectId::from(42)).await.unwrap();

        let forged = stranger.sign_request(42, &challenge.nonce);
        let err = fx.core.authenticate(&forged).await.unwrap_err();
        assert_eq!(err.stage(), AuthStage::KeyResolved);
        assert!(matches!(err.reason(), AuthError::InvalidSignature));

        // The nonce survived the rejection.
        assert!(fx.core.authenticate(&pair.sign_request(42, &challenge.nonce)).await.is_ok());
    }

    #[tokio::test]
    async fn test_malformed_request_short_circuits() {
        let fx = fixture();
        let result = fx.core.authenticate(&TokenRequest::new(42, "", "sig")).await;
        let err = result.unwrap_err();
        assert_eq!(err.stage(), AuthStage::Received);
        assert!(matches!(err.reason(), AuthError::MalformedRequest(_)));
    }

    #[tokio::test]
    async fn test_token_validation_follows_clock() {
        let fx = fixture();
        let pair = enroll(&fx.store, 42).await;
        let challenge = fx.core.issue_challenge(SubjectId::from(42)).await.unwrap();
        let token = fx.core.authenticate(&pair.sign_request(42, &challenge.nonce)).await.unwrap();

        fx.clock.advance(TimeDelta::minutes(16));
        assert!(matches!(
            fx.core.validate_token(token.credential()),
            Err(AuthError::InvalidCredential(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_task_stops_on_shutdown() {
        let fx = fixture();
        let handle = fx.core.start_purge_task();
        fx.core.shutdown();
        handle.await.unwrap();
    }
}
