//! Freshness window boundary tests, driven through the full pipeline with a
//! manual clock.

#![allow(clippy::expect_used, clippy::panic)]

use std::{sync::Arc, time::Duration};

use chrono::TimeDelta;
use rstest::rstest;
use tokengate_authn::{
    AuthError, AuthenticationCore, Clock, InMemoryNonceLedger, ManualClock, NonceLedger, assert_rejected,
    config::AuthConfig,
    issuer::ServerSigningKey,
    testutil::enroll,
};
use tokengate_storage::{StorageError, SubjectId, keys::MemorySubjectKeyStore};

struct Harness {
    core: AuthenticationCore,
    store: MemorySubjectKeyStore,
    clock: ManualClock,
    ledger: Arc<InMemoryNonceLedger>,
}

fn harness(window: Duration) -> Harness {
    let config = AuthConfig::builder().nonce_window(window).build().expect("valid config");
    let store = MemorySubjectKeyStore::new();
    let clock = ManualClock::default();
    let ledger = Arc::new(InMemoryNonceLedger::from_config(&config));
    let core = AuthenticationCore::builder()
        .config(config)
        .key_store(Arc::new(store.clone()))
        .signing_key(ServerSigningKey::generate("test-server"))
        .clock(Arc::new(clock.clone()))
        .ledger(Arc::clone(&ledger) as Arc<dyn NonceLedger>)
        .build();
    Harness { core, store, clock, ledger }
}

#[rstest]
#[case::immediately(TimeDelta::zero())]
#[case::halfway(TimeDelta::seconds(150))]
#[case::exactly_at_window(TimeDelta::minutes(5))]
#[tokio::test]
async fn consumable_within_window(#[case] elapsed: TimeDelta) {
    let h = harness(Duration::from_secs(300));
    let pair = enroll(&h.store, 42).await;
    let challenge = h.core.issue_challenge(SubjectId::from(42)).await.expect("challenge");

    h.clock.advance(elapsed);
    let result = h.core.authenticate(&pair.sign_request(42, &challenge.nonce)).await;
    assert!(result.is_ok(), "expected issuance after {elapsed}, got {result:?}");
}

#[rstest]
#[case::one_ms_late(TimeDelta::minutes(5) + TimeDelta::milliseconds(1))]
#[case::a_day_late(TimeDelta::days(1))]
#[tokio::test]
async fn expired_after_window(#[case] elapsed: TimeDelta) {
    let h = harness(Duration::from_secs(300));
    let pair = enroll(&h.store, 42).await;
    let challenge = h.core.issue_challenge(SubjectId::from(42)).await.expect("challenge");

    h.clock.advance(elapsed);
    assert_rejected!(
        h.core.authenticate(&pair.sign_request(42, &challenge.nonce)).await,
        NonceExpired
    );
}

#[tokio::test]
async fn configured_window_is_honoured() {
    let h = harness(Duration::from_secs(30));
    let pair = enroll(&h.store, 42).await;

    let first = h.core.issue_challenge(SubjectId::from(42)).await.expect("challenge");
    h.clock.advance(TimeDelta::seconds(30));
    assert!(h.core.authenticate(&pair.sign_request(42, &first.nonce)).await.is_ok());

    let second = h.core.issue_challenge(SubjectId::from(42)).await.expect("challenge");
    h.clock.advance(TimeDelta::seconds(31));
    assert_rejected!(
        h.core.authenticate(&pair.sign_request(42, &second.nonce)).await,
        NonceExpired
    );
}

#[tokio::test]
async fn replay_stays_rejected_across_purge() {
    let h = harness(Duration::from_secs(300));
    let pair = enroll(&h.store, 42).await;
    let challenge = h.core.issue_challenge(SubjectId::from(42)).await.expect("challenge");
    let request = pair.sign_request(42, &challenge.nonce);
    h.core.authenticate(&request).await.expect("issued");

    // Inside the window the consumed record answers.
    h.clock.advance(TimeDelta::minutes(4));
    assert_rejected!(h.core.authenticate(&request).await, NonceReplayed);

    // Past the window, before and after the record is purged.
    h.clock.advance(TimeDelta::minutes(2));
    assert_rejected!(h.core.authenticate(&request).await, NonceExpired);
    assert_eq!(h.ledger.purge_expired(h.clock.now()).await, 1);
    assert_rejected!(h.core.authenticate(&request).await, NonceExpired);
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn stale_outstanding_challenges_are_purged() {
    let h = harness(Duration::from_secs(300));
    for subject in 1..=10 {
        h.core.issue_challenge(SubjectId::from(subject)).await.expect("challenge");
    }
    assert_eq!(h.ledger.len(), 10);

    h.clock.advance(TimeDelta::minutes(5));
    assert_eq!(h.ledger.purge_expired(h.clock.now()).await, 0, "boundary is inclusive");

    h.clock.advance(TimeDelta::seconds(1));
    assert_eq!(h.ledger.purge_expired(h.clock.now()).await, 10);
    assert!(h.ledger.is_empty());
}

#[tokio::test]
async fn extra_challenge_requests_cannot_burn_an_issued_nonce() {
    let max_outstanding = 4;
    let h = harness(Duration::from_secs(300));
    let pair = enroll(&h.store, 42).await;
    let victim = h.core.issue_challenge(SubjectId::from(42)).await.expect("challenge");

    // Anyone may ask for challenges on behalf of subject 42.
    for _ in 1..max_outstanding {
        h.core.issue_challenge(SubjectId::from(42)).await.expect("challenge");
    }
    let refused = h.core.issue_challenge(SubjectId::from(42)).await.expect_err("cap reached");
    assert!(matches!(
        refused.reason(),
        AuthError::StoreUnavailable(StorageError::RateLimitExceeded { .. })
    ));
    assert!(refused.is_retryable());
    assert_eq!(h.ledger.outstanding_for(SubjectId::from(42)), max_outstanding);

    assert!(h.core.authenticate(&pair.sign_request(42, &victim.nonce)).await.is_ok());
    h.core.issue_challenge(SubjectId::from(42)).await.expect("a slot freed up");
}

#[tokio::test]
async fn challenge_slots_reopen_once_the_window_passes() {
    let h = harness(Duration::from_secs(300));
    let pair = enroll(&h.store, 42).await;
    for _ in 0..4 {
        h.core.issue_challenge(SubjectId::from(42)).await.expect("challenge");
    }
    assert!(h.core.issue_challenge(SubjectId::from(42)).await.is_err());

    h.clock.advance(TimeDelta::minutes(5) + TimeDelta::milliseconds(1));
    let fresh = h.core.issue_challenge(SubjectId::from(42)).await.expect("stale ones pruned");
    assert_eq!(h.ledger.outstanding_for(SubjectId::from(42)), 1);
    assert!(h.core.authenticate(&pair.sign_request(42, &fresh.nonce)).await.is_ok());
}
