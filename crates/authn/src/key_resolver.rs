//! Resolution of a subject's currently trusted public key.
//!
//! [`KeyResolver`] wraps a [`SubjectKeyStore`] with an in-memory cache of
//! key histories so that a burst of requests from one subject costs one
//! store round-trip.
//!
//! # Architecture
//!
//! ```text
//! request arrives → subject_id
//!              → check local cache (subject → key history)
//!              → miss? fetch history from the store (bounded, retried)
//!              → select the entry active at `now`
//!              → verify signature with it
//! ```
//!
//! # Cache Strategy
//!
//! - **What is cached**: the raw key history, never a verdict. Validity windows are re-evaluated
//!   against the injected clock on every call, so a key that expires while cached stops resolving
//!   immediately.
//! - **TTL**: Default 60 seconds. Revocations propagate within this window, or immediately after
//!   [`KeyResolver::invalidate`].
//! - **Unknown subjects** are not cached, so a freshly registered subject resolves on its next
//!   request.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use fail::fail_point;
use moka::future::Cache;
use tokengate_storage::{
    SubjectId,
    keys::{PublicKeyEntry, SubjectKeyStore},
};

use crate::{
    config::{AuthConfig, RetryPolicyConfig},
    error::{AuthError, Result},
    retry::with_retry,
};

/// Maps a subject to its currently trusted public key.
///
/// # Selection Rules
///
/// Given the subject's key history and the current instant:
/// - the entry that is active (unrevoked and inside its window) wins
/// - otherwise, if any unrevoked entry exists, resolution fails with [`AuthError::ExpiredKey`]
///   (this covers both expired and not-yet-valid windows)
/// - otherwise, if entries exist they are all revoked: [`AuthError::RevokedKey`]
/// - an empty history is [`AuthError::UnknownSubject`]
///
/// # Failure Handling
///
/// Every store call is bounded by the configured store timeout and retried
/// with backoff on transient failures. A call that stays slow surfaces as
/// [`AuthError::StoreTimeout`].
pub struct KeyResolver {
    /// Cached key histories with TTL-based expiration.
    cache: Cache<SubjectId, Arc<Vec<PublicKeyEntry>>>,
    /// Backing store.
    store: Arc<dyn SubjectKeyStore>,
    /// Monotonic generation counter incremented on every invalidation.
    ///
    /// If the generation changes between the start and end of a store
    /// fetch, the fetched history is used for the current call but not
    /// written into the cache.
    invalidation_gen: Arc<AtomicU64>,
    store_timeout: Duration,
    retry_policy: RetryPolicyConfig,
}

impl KeyResolver {
    /// Creates a resolver using the cache, timeout and retry settings of
    /// `config`.
    #[must_use]
    pub fn new(store: Arc<dyn SubjectKeyStore>, config: &AuthConfig) -> Self {
        Self {
            cache: Cache::builder()
                .time_to_live(config.key_cache_ttl())
                .max_capacity(config.key_cache_capacity())
                .build(),
            store,
            invalidation_gen: Arc::new(AtomicU64::new(0)),
            store_timeout: config.store_timeout(),
            retry_policy: config.retry_policy().clone(),
        }
    }

    /// Returns the entry that may verify requests from `subject_id` at `now`.
    ///
    /// # Errors
    ///
    /// - [`AuthError::UnknownSubject`] if the subject has no entries
    /// - [`AuthError::RevokedKey`] if every entry is revoked
    /// - [`AuthError::ExpiredKey`] if the unrevoked entry is outside its window
    /// - [`AuthError::StoreTimeout`] if the store did not answer in time
    /// - [`AuthError::StoreUnavailable`] for any other store failure
    #[tracing::instrument(skip(self, now), fields(subject_id = %subject_id))]
    pub async fn resolve(&self, subject_id: SubjectId, now: DateTime<Utc>) -> Result<PublicKeyEntry> {
        if let Some(history) = self.cache.get(&subject_id).await {
            tracing::debug!(cache = "L1", "cache hit");
            return select_entry(subject_id, &history, now);
        }
        tracing::debug!(cache = "L1", "cache miss");

        let history = self.fetch(subject_id).await?;
        select_entry(subject_id, &history, now)
    }

    async fn fetch(&self, subject_id: SubjectId) -> Result<Arc<Vec<PublicKeyEntry>>> {
        let gen_before = self.invalidation_gen.load(Ordering::Acquire);

        fail_point!("resolver-before-store-fetch", |_| {
            Err(AuthError::from(tokengate_storage::StorageError::internal(
                "injected failure before store fetch"
            )))
        });
        let history = with_retry(&self.retry_policy, self.store_timeout, "get_keys", || {
            self.store.get_keys(subject_id)
        })
        .await?;
        let history = Arc::new(history);

        if history.is_empty() {
            return Ok(history);
        }

        if self.invalidation_gen.load(Ordering::Acquire) != gen_before {
            tracing::debug!(
                subject_id = %subject_id,
                "Discarding store result for cache: invalidation occurred during fetch"
            );
            return Ok(history);
        }

        self.cache.insert(subject_id, Arc::clone(&history)).await;
        tracing::debug!(cache = "store", entries = history.len(), "populated cache");
        Ok(history)
    }

    /// Drops the cached history of one subject.
    ///
    /// Call this after revoking or rotating the subject's key so the change
    /// takes effect before the cache TTL runs out.
    #[tracing::instrument(skip(self))]
    pub async fn invalidate(&self, subject_id: SubjectId) {
        self.invalidation_gen.fetch_add(1, Ordering::Release);
        self.cache.invalidate(&subject_id).await;
        tracing::info!(
            audit.action = "invalidate_key_cache",
            audit.resource = %format_args!("subject:{subject_id}"),
            audit.result = "success",
            "audit_event"
        );
    }

    /// Drops every cached history.
    #[tracing::instrument(skip(self))]
    pub async fn clear_all(&self) {
        let evicted = self.cache.entry_count();
        self.invalidation_gen.fetch_add(1, Ordering::Release);
        self.cache.invalidate_all();
        tracing::info!(
            audit.action = "clear_key_cache",
            audit.resource = "all_subject_keys",
            audit.result = "success",
            audit.evicted = evicted,
            "audit_event"
        );
    }

    /// Number of cached subjects. Approximate until [`sync`](Self::sync)
    /// has run.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }

    /// Runs pending cache maintenance so counts are exact.
    pub async fn sync(&self) {
        self.cache.run_pending_tasks().await;
    }
}

/// Picks the entry that may verify requests at `now` from a subject's
/// history. See [`KeyResolver`] for the rules.
///
/// # Errors
///
/// [`AuthError::UnknownSubject`], [`AuthError::RevokedKey`] or
/// [`AuthError::ExpiredKey`] as described on [`KeyResolver`].
pub fn select_entry(
    subject_id: SubjectId,
    history: &[PublicKeyEntry],
    now: DateTime<Utc>,
) -> Result<PublicKeyEntry> {
    let mut active = history.iter().filter(|entry| entry.is_active_at(now));
    if let Some(first) = active.next() {
        let chosen = match active.next() {
            None => first,
            Some(second) => {
                // Only a store that skips overlap checks can get here.
                tracing::warn!(
                    subject_id = %subject_id,
                    first = %first.kid,
                    second = %second.kid,
                    "multiple active keys, using the newest"
                );
                history
                    .iter()
                    .filter(|entry| entry.is_active_at(now))
                    .max_by_key(|entry| entry.valid_from)
                    .unwrap_or(first)
            },
        };
        return Ok(chosen.clone());
    }

    if let Some(unrevoked) =
        history.iter().filter(|entry| !entry.is_revoked()).max_by_key(|entry| entry.valid_from)
    {
        return Err(AuthError::expired_key(subject_id, unrevoked.kid.clone()));
    }

    match history.iter().max_by_key(|entry| entry.revoked_at) {
        Some(revoked) => Err(AuthError::revoked_key(subject_id, revoked.kid.clone())),
        None => Err(AuthError::unknown_subject(subject_id)),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use tokengate_storage::{
        StorageError,
        keys::MemorySubjectKeyStore,
        testutil::{make_entry, make_entry_with_window},
    };

    use super::*;
    use crate::{assert_auth_error, testutil::FlakyKeyStore};

    fn config() -> AuthConfig {
        AuthConfig::builder()
            .store_timeout(Duration::from_millis(500))
            .retry_policy(
                RetryPolicyConfig::builder()
                    .max_retries(2)
                    .initial_backoff(Duration::from_millis(10))
                    .max_backoff(Duration::from_millis(40))
                    .build(),
            )
            .build()
            .unwrap()
    }

    fn resolver(store: Arc<dyn SubjectKeyStore>) -> KeyResolver {
        KeyResolver::new(store, &config())
    }

    #[tokio::test]
    async fn test_unknown_subject() {
        let resolver = resolver(Arc::new(MemorySubjectKeyStore::new()));
        let result = resolver.resolve(SubjectId::from(99), Utc::now()).await;
        assert_auth_error!(result, UnknownSubject);
    }

    #[tokio::test]
    async fn test_active_key_resolves() {
        let store = MemorySubjectKeyStore::new();
        store.register_key(&make_entry(42, "42-a")).await.unwrap();
        let resolver = resolver(Arc::new(store));

        let entry = resolver.resolve(SubjectId::from(42), Utc::now()).await.unwrap();
        assert_eq!(entry.kid, "42-a");
    }

    #[tokio::test]
    async fn test_revoked_key() {
        let store = MemorySubjectKeyStore::new();
        store.register_key(&make_entry(42, "42-a")).await.unwrap();
        store.revoke_key(SubjectId::from(42), "42-a", Some("lost device")).await.unwrap();
        let resolver = resolver(Arc::new(store));

        let result = resolver.resolve(SubjectId::from(42), Utc::now()).await;
        assert!(matches!(result, Err(AuthError::RevokedKey { ref kid, .. }) if kid == "42-a"));
    }

    #[tokio::test]
    async fn test_expired_key() {
        let now = Utc::now();
        let store = MemorySubjectKeyStore::new();
        store
            .register_key(&make_entry_with_window(
                42,
                "42-a",
                now - ChronoDuration::days(2),
                Some(now - ChronoDuration::days(1)),
            ))
            .await
            .unwrap();
        let resolver = resolver(Arc::new(store));

        assert_auth_error!(resolver.resolve(SubjectId::from(42), now).await, ExpiredKey);
    }

    #[tokio::test]
    async fn test_not_yet_valid_key_reports_expired() {
        let now = Utc::now();
        let store = MemorySubjectKeyStore::new();
        store
            .register_key(&make_entry_with_window(42, "42-a", now + ChronoDuration::hours(1), None))
            .await
            .unwrap();
        let resolver = resolver(Arc::new(store));

        assert_auth_error!(resolver.resolve(SubjectId::from(42), now).await, ExpiredKey);
    }

    #[tokio::test]
    async fn test_rotated_history_resolves_newest() {
        let store = MemorySubjectKeyStore::new();
        store.register_key(&make_entry(42, "42-a")).await.unwrap();
        store.rotate_key(&make_entry(42, "42-b")).await.unwrap();
        let resolver = resolver(Arc::new(store));

        let entry = resolver.resolve(SubjectId::from(42), Utc::now()).await.unwrap();
        assert_eq!(entry.kid, "42-b");
    }

    #[tokio::test]
    async fn test_cache_hit_skips_store() {
        let store = FlakyKeyStore::default();
        store.inner().register_key(&make_entry(42, "42-a")).await.unwrap();
        let resolver = resolver(Arc::new(store.clone()));

        resolver.resolve(SubjectId::from(42), Utc::now()).await.unwrap();
        resolver.resolve(SubjectId::from(42), Utc::now()).await.unwrap();
        assert_eq!(store.get_count(), 1);

        resolver.sync().await;
        assert_eq!(resolver.entry_count(), 1);
    }

    #[tokio::test]
    async fn test_validity_is_rechecked_on_cache_hit() {
        let now = Utc::now();
        let store = MemorySubjectKeyStore::new();
        store
            .register_key(&make_entry_with_window(
                42,
                "42-a",
                now - ChronoDuration::hours(1),
                Some(now + ChronoDuration::minutes(1)),
            ))
            .await
            .unwrap();
        let resolver = resolver(Arc::new(store));

        resolver.resolve(SubjectId::from(42), now).await.unwrap();
        let later = now + ChronoDuration::minutes(2);
        assert_auth_error!(resolver.resolve(SubjectId::from(42), later).await, ExpiredKey);
    }

    #[tokio::test]
    async fn test_unknown_subject_is_not_cached() {
        let store = FlakyKeyStore::default();
        let resolver = resolver(Arc::new(store.clone()));

        assert!(resolver.resolve(SubjectId::from(42), Utc::now()).await.is_err());
        store.inner().register_key(&make_entry(42, "42-a")).await.unwrap();
        assert!(resolver.resolve(SubjectId::from(42), Utc::now()).await.is_ok());
    }

    #[tokio::test]
    async fn test_invalidate_picks_up_revocation() {
        let store = MemorySubjectKeyStore::new();
        store.register_key(&make_entry(42, "42-a")).await.unwrap();
        let resolver = resolver(Arc::new(store.clone()));

        resolver.resolve(SubjectId::from(42), Utc::now()).await.unwrap();
        store.revoke_key(SubjectId::from(42), "42-a", None).await.unwrap();

        // Still served from cache until invalidated.
        assert!(resolver.resolve(SubjectId::from(42), Utc::now()).await.is_ok());

        resolver.invalidate(SubjectId::from(42)).await;
        assert_auth_error!(resolver.resolve(SubjectId::from(42), Utc::now()).await, RevokedKey);
    }

    #[tokio::test]
    async fn test_clear_all() {
        let store = MemorySubjectKeyStore::new();
        store.register_key(&make_entry(1, "1-a")).await.unwrap();
        store.register_key(&make_entry(2, "2-a")).await.unwrap();
        let resolver = resolver(Arc::new(store));

        resolver.resolve(SubjectId::from(1), Utc::now()).await.unwrap();
        resolver.resolve(SubjectId::from(2), Utc::now()).await.unwrap();
        resolver.sync().await;
        assert_eq!(resolver.entry_count(), 2);

        resolver.clear_all().await;
        resolver.sync().await;
        assert_eq!(resolver.entry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_retried() {
        let store = FlakyKeyStore::default();
        store.inner().register_key(&make_entry(42, "42-a")).await.unwrap();
        store.fail_next(2, || StorageError::connection("refused"));
        let resolver = resolver(Arc::new(store.clone()));

        assert!(resolver.resolve(SubjectId::from(42), Utc::now()).await.is_ok());
        assert_eq!(store.get_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_store_times_out() {
        let store = FlakyKeyStore::default();
        store.inner().register_key(&make_entry(42, "42-a")).await.unwrap();
        store.set_delay(Duration::from_secs(30));
        let resolver = resolver(Arc::new(store.clone()));

        assert_auth_error!(resolver.resolve(SubjectId::from(42), Utc::now()).await, StoreTimeout);
        assert_eq!(store.get_count(), 3, "one attempt plus two retries");
    }

    #[tokio::test(start_paused = true)]
    async fn test_definitive_store_failure_is_not_retried() {
        let store = FlakyKeyStore::default();
        store.fail_next(1, || StorageError::serialization("bad row"));
        let resolver = resolver(Arc::new(store.clone()));

        let result = resolver.resolve(SubjectId::from(42), Utc::now()).await;
        assert_auth_error!(result, StoreUnavailable);
        assert_eq!(store.get_count(), 1);
    }

    #[test]
    fn test_select_prefers_newest_when_store_broke_invariant() {
        let now = Utc::now();
        let older = make_entry_with_window(1, "1-old", now - ChronoDuration::days(3), None);
        let newer = make_entry_with_window(1, "1-new", now - ChronoDuration::days(1), None);
        let chosen = select_entry(SubjectId::from(1), &[older, newer], now).unwrap();
        assert_eq!(chosen.kid, "1-new");
    }

    #[test]
    fn test_select_expired_wins_over_revoked() {
        let now = Utc::now();
        let mut revoked = make_entry(1, "1-a");
        revoked.revoked_at = Some(now);
        let expired = make_entry_with_window(
            1,
            "1-b",
            now - ChronoDuration::days(2),
            Some(now - ChronoDuration::days(1)),
        );
        let result = select_entry(SubjectId::from(1), &[revoked, expired], now);
        assert!(matches!(result, Err(AuthError::ExpiredKey { ref kid, .. }) if kid == "1-b"));
    }

    #[test]
    fn test_select_empty_history_is_unknown() {
        assert_auth_error!(select_entry(SubjectId::from(5), &[], Utc::now()), UnknownSubject);
    }
}
