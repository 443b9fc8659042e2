//! Nonce issuance and single-use consumption.
//!
//! The server hands out challenges ([`NonceChallenge`]) and the client signs
//! one into its [`TokenRequest`](crate::TokenRequest). The ledger makes each
//! `(subject, nonce)` pair consumable exactly once, and only while fresh.
//!
//! # Lifecycle
//!
//! ```text
//! register ──► outstanding ──try_consume (fresh)──► consumed ──purge / evict──► gone
//!                   │
//!                   └──try_consume (stale) / purge──► gone
//! ```
//!
//! A pair that is absent from the ledger never consumes. Purging or evicting
//! a consumed record therefore cannot reopen a replay: the pair simply reads
//! as expired.
//!
//! # Design
//!
//! - **Linearizable**: outcome selection and the state change happen under one mutex, so
//!   concurrent consumers of the same pair see exactly one [`ConsumeOutcome::Consumed`].
//! - **Bounded**: entries are indexed by expiry into time buckets one eighth of the window wide,
//!   and the index never holds more keys than the ledger holds entries. When the ledger is full,
//!   expired entries are purged first, then consumed records go oldest bucket first.
//! - **Outstanding challenges are never evicted**: a subject at its outstanding cap, or a ledger
//!   full of live challenges, refuses new registrations with
//!   [`StorageError::RateLimitExceeded`] until the oldest challenge expires.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokengate_storage::{StorageError, StorageResult, SubjectId};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{clock::Clock, config::AuthConfig};

/// Number of time buckets spanning one freshness window.
const BUCKETS_PER_WINDOW: i64 = 8;

/// An outstanding nonce handed to a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceChallenge {
    /// Subject the nonce was issued to.
    pub subject_id: SubjectId,
    /// The nonce text the subject must sign.
    pub nonce: String,
    /// When the nonce was issued.
    pub issued_at: DateTime<Utc>,
    /// Last instant at which the nonce may be consumed.
    pub expires_at: DateTime<Utc>,
}

/// Proof that a nonce was consumed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceRecord {
    /// Subject that consumed the nonce.
    pub subject_id: SubjectId,
    /// The consumed nonce.
    pub nonce: String,
    /// When consumption happened.
    pub consumed_at: DateTime<Utc>,
    /// When the record may be garbage-collected.
    pub expires_at: DateTime<Utc>,
}

/// Result of [`NonceLedger::try_consume`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// First, in-window use. The pair is now spent.
    Consumed(NonceRecord),
    /// The pair was already consumed within its window.
    AlreadyUsed,
    /// The pair is stale, was never issued, or has been dropped.
    Expired,
}

/// Storage of issued and consumed nonces.
///
/// Implementations must make [`try_consume`](Self::try_consume) a single
/// atomic check-and-set per `(subject, nonce)` pair.
#[async_trait]
pub trait NonceLedger: Send + Sync {
    /// Records a newly issued challenge.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if the pair is already present and
    /// [`StorageError::RateLimitExceeded`] if the subject or the ledger has
    /// no room for another outstanding challenge.
    async fn register(
        &self,
        subject_id: SubjectId,
        nonce: String,
        issued_at: DateTime<Utc>,
    ) -> StorageResult<NonceChallenge>;

    /// Consumes the pair if it is outstanding and fresh at `now`.
    ///
    /// # Errors
    ///
    /// Returns a [`StorageError`] only if the backing storage fails. The
    /// in-memory ledger never fails.
    async fn try_consume(
        &self,
        subject_id: SubjectId,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ConsumeOutcome>;

    /// Removes every entry whose expiry is strictly before `now`. Returns the
    /// number of entries removed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> usize;
}

type LedgerKey = (SubjectId, String);

#[derive(Debug)]
enum LedgerEntry {
    Outstanding(NonceChallenge),
    Consumed(NonceRecord),
}

impl LedgerEntry {
    fn expires_at(&self) -> DateTime<Utc> {
        match self {
            Self::Outstanding(challenge) => challenge.expires_at,
            Self::Consumed(record) => record.expires_at,
        }
    }
}

#[derive(Debug)]
struct LedgerState {
    entries: HashMap<LedgerKey, LedgerEntry>,
    /// Bucket index (by expiry) to the keys filed under it. Holds exactly
    /// the keys of `entries`.
    buckets: BTreeMap<i64, HashSet<LedgerKey>>,
    /// Outstanding nonces per subject, oldest first.
    outstanding: HashMap<SubjectId, VecDeque<String>>,
    bucket_width_ms: i64,
}

impl LedgerState {
    fn new(bucket_width_ms: i64) -> Self {
        Self {
            entries: HashMap::new(),
            buckets: BTreeMap::new(),
            outstanding: HashMap::new(),
            bucket_width_ms,
        }
    }

    fn bucket_of(&self, instant: DateTime<Utc>) -> i64 {
        instant.timestamp_millis().div_euclid(self.bucket_width_ms)
    }

    fn insert(&mut self, key: LedgerKey, entry: LedgerEntry) {
        let index = self.bucket_of(entry.expires_at());
        self.buckets.entry(index).or_default().insert(key.clone());
        self.entries.insert(key, entry);
    }

    fn remove(&mut self, key: &LedgerKey) -> Option<LedgerEntry> {
        let entry = self.entries.remove(key)?;
        let index = self.bucket_of(entry.expires_at());
        if let Some(bucket) = self.buckets.get_mut(&index) {
            bucket.remove(key);
            if bucket.is_empty() {
                self.buckets.remove(&index);
            }
        }
        if matches!(entry, LedgerEntry::Outstanding(_)) {
            self.forget_outstanding(key);
        }
        Some(entry)
    }

    fn forget_outstanding(&mut self, (subject_id, nonce): &LedgerKey) {
        if let Some(queue) = self.outstanding.get_mut(subject_id) {
            queue.retain(|n| n != nonce);
            if queue.is_empty() {
                self.outstanding.remove(subject_id);
            }
        }
    }

    /// Earliest expiry among the entries of the oldest bucket.
    fn earliest_expiry(&self) -> Option<DateTime<Utc>> {
        let (_, keys) = self.buckets.first_key_value()?;
        keys.iter().filter_map(|key| self.entries.get(key)).map(LedgerEntry::expires_at).min()
    }
}

/// Time from `now` until an entry expiring at `expires_at` is purgeable.
fn retry_after(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (expires_at - now + TimeDelta::milliseconds(1)).to_std().unwrap_or(Duration::ZERO)
}

/// Process-local [`NonceLedger`].
///
/// # Thread Safety
///
/// `InMemoryNonceLedger` is `Send + Sync`. All operations take one
/// `parking_lot` mutex and never await while holding it.
pub struct InMemoryNonceLedger {
    state: Mutex<LedgerState>,
    window: TimeDelta,
    capacity: usize,
    max_outstanding_per_subject: usize,
}

impl InMemoryNonceLedger {
    /// Creates a ledger.
    ///
    /// # Arguments
    ///
    /// * `window` - How long an issued nonce stays consumable.
    /// * `capacity` - Maximum entries, outstanding and consumed combined.
    /// * `max_outstanding_per_subject` - Outstanding challenges allowed per subject.
    #[must_use]
    pub fn new(window: Duration, capacity: usize, max_outstanding_per_subject: usize) -> Self {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        let bucket_width_ms = (window.num_milliseconds() / BUCKETS_PER_WINDOW).max(1);
        Self {
            state: Mutex::new(LedgerState::new(bucket_width_ms)),
            window,
            capacity: capacity.max(1),
            max_outstanding_per_subject: max_outstanding_per_subject.max(1),
        }
    }

    /// Creates a ledger using the window and limits of `config`.
    #[must_use]
    pub fn from_config(config: &AuthConfig) -> Self {
        Self::new(
            config.nonce_window(),
            config.ledger_capacity(),
            config.max_outstanding_per_subject(),
        )
    }

    /// Number of entries, outstanding and consumed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Returns `true` if the ledger holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().entries.is_empty()
    }

    /// Number of outstanding challenges held for `subject_id`.
    #[must_use]
    pub fn outstanding_for(&self, subject_id: SubjectId) -> usize {
        self.state.lock().outstanding.get(&subject_id).map_or(0, VecDeque::len)
    }

    fn purge_locked(&self, state: &mut LedgerState, now: DateTime<Utc>) -> usize {
        let current = state.bucket_of(now);
        let mut due = Vec::new();
        for (_, keys) in state.buckets.range(..=current) {
            due.extend(
                keys.iter()
                    .filter(|key| state.entries.get(*key).is_some_and(|e| e.expires_at() < now))
                    .cloned(),
            );
        }
        due.iter().filter_map(|key| state.remove(key)).count()
    }

    /// Drops consumed records, oldest bucket first, until there is room for
    /// one more entry. Outstanding challenges are never evicted.
    fn evict_consumed_locked(&self, state: &mut LedgerState) -> usize {
        let excess = (state.entries.len() + 1).saturating_sub(self.capacity);
        let victims: Vec<LedgerKey> = state
            .buckets
            .values()
            .flat_map(|keys| keys.iter())
            .filter(|key| matches!(state.entries.get(*key), Some(LedgerEntry::Consumed(_))))
            .take(excess)
            .cloned()
            .collect();
        victims.iter().filter_map(|key| state.remove(key)).count()
    }

    /// Drops the subject's outstanding challenges that are stale at `now`.
    fn prune_subject_locked(
        &self,
        state: &mut LedgerState,
        subject_id: SubjectId,
        now: DateTime<Utc>,
    ) {
        let stale: Vec<LedgerKey> = state
            .outstanding
            .get(&subject_id)
            .into_iter()
            .flatten()
            .map(|nonce| (subject_id, nonce.clone()))
            .filter(|key| state.entries.get(key).is_some_and(|e| e.expires_at() < now))
            .collect();
        for key in &stale {
            state.remove(key);
        }
    }
}

impl Default for InMemoryNonceLedger {
    fn default() -> Self {
        Self::from_config(&AuthConfig::default())
    }
}

#[async_trait]
impl NonceLedger for InMemoryNonceLedger {
    #[tracing::instrument(skip(self, nonce, issued_at), fields(subject_id = %subject_id))]
    async fn register(
        &self,
        subject_id: SubjectId,
        nonce: String,
        issued_at: DateTime<Utc>,
    ) -> StorageResult<NonceChallenge> {
        let expires_at = issued_at.checked_add_signed(self.window).unwrap_or(DateTime::<Utc>::MAX_UTC);
        let key = (subject_id, nonce);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.entries.contains_key(&key) {
            return Err(StorageError::conflict("nonce already registered for subject"));
        }

        let at_cap = |q: &VecDeque<String>| q.len() >= self.max_outstanding_per_subject;
        if state.outstanding.get(&subject_id).is_some_and(at_cap) {
            self.prune_subject_locked(state, subject_id, issued_at);
            let oldest_expiry = state
                .outstanding
                .get(&subject_id)
                .filter(|q| at_cap(q))
                .and_then(|q| q.front())
                .and_then(|nonce| state.entries.get(&(subject_id, nonce.clone())))
                .map(LedgerEntry::expires_at);
            if let Some(expires_at) = oldest_expiry {
                tracing::warn!(
                    limit = self.max_outstanding_per_subject,
                    "outstanding challenge limit reached for subject"
                );
                return Err(StorageError::rate_limit_exceeded(retry_after(expires_at, issued_at)));
            }
        }

        if state.entries.len() >= self.capacity {
            let purged = self.purge_locked(state, issued_at);
            if purged > 0 {
                tracing::debug!(purged, "purged expired nonces to make room");
            }
        }
        if state.entries.len() >= self.capacity {
            let evicted = self.evict_consumed_locked(state);
            if evicted > 0 {
                tracing::debug!(evicted, "evicted consumed nonce records to make room");
            }
        }
        if state.entries.len() >= self.capacity {
            let wait = state
                .earliest_expiry()
                .map_or(Duration::ZERO, |expires_at| retry_after(expires_at, issued_at));
            tracing::warn!(
                capacity = self.capacity,
                "nonce ledger full of outstanding challenges"
            );
            return Err(StorageError::rate_limit_exceeded(wait));
        }

        let challenge = NonceChallenge {
            subject_id,
            nonce: key.1.clone(),
            issued_at,
            expires_at,
        };
        state.outstanding.entry(subject_id).or_default().push_back(key.1.clone());
        state.insert(key, LedgerEntry::Outstanding(challenge.clone()));
        Ok(challenge)
    }

    #[tracing::instrument(skip(self, nonce, now), fields(subject_id = %subject_id))]
    async fn try_consume(
        &self,
        subject_id: SubjectId,
        nonce: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<ConsumeOutcome> {
        let key = (subject_id, nonce.to_owned());
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let outcome = match state.entries.get(&key) {
            None => ConsumeOutcome::Expired,
            Some(LedgerEntry::Consumed(record)) if now <= record.expires_at => {
                ConsumeOutcome::AlreadyUsed
            },
            Some(LedgerEntry::Consumed(_)) => ConsumeOutcome::Expired,
            Some(LedgerEntry::Outstanding(challenge)) if now <= challenge.expires_at => {
                let record = NonceRecord {
                    subject_id,
                    nonce: key.1.clone(),
                    consumed_at: now,
                    expires_at: challenge.expires_at,
                };
                state.forget_outstanding(&key);
                state.entries.insert(key, LedgerEntry::Consumed(record.clone()));
                ConsumeOutcome::Consumed(record)
            },
            Some(LedgerEntry::Outstanding(_)) => {
                state.remove(&key);
                ConsumeOutcome::Expired
            },
        };
        Ok(outcome)
    }

    #[tracing::instrument(skip(self))]
    async fn purge_expired(&self, now: DateTime<Utc>) -> usize {
        let mut guard = self.state.lock();
        self.purge_locked(&mut guard, now)
    }
}

/// Spawns a task that purges `ledger` every `interval` until `cancel` fires.
///
/// # Panics
///
/// Must be called within a Tokio runtime context.
pub fn spawn_purge_task(
    ledger: Arc<dyn NonceLedger>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; consume it so we start
        // with a full interval wait.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("nonce purge task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    let purged = ledger.purge_expired(clock.now()).await;
                    if purged > 0 {
                        tracing::debug!(purged, "purged expired nonces");
                    }
                }
            }
        }
    })
}
