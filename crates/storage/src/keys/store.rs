//! Storage trait for subject public key lifecycle operations.
//!
//! # Key Lifecycle
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │ Registered  │────►│   Active    │────►│   Revoked   │
//! │ (valid_from │     │             │     │ (permanent) │
//! │  in future) │     │             │     │             │
//! └─────────────┘     └──────┬──────┘     └─────────────┘
//!                            │ valid_until passes
//!                            ▼
//!                     ┌─────────────┐
//!                     │   Expired   │
//!                     └─────────────┘
//! ```
//!
//! A subject keeps its whole key history. The store refuses any write that
//! would leave two unrevoked entries with overlapping validity windows, so
//! at most one entry can be active at a time.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use crate::{
    error::{StorageError, StorageResult},
    keys::PublicKeyEntry,
    types::SubjectId,
};

/// Revocation reason recorded by [`SubjectKeyStore::rotate_key`].
pub const ROTATION_REASON: &str = "key rotation";

/// Persistence layer for subject public keys.
///
/// Production deployments back this with the account database; tests use
/// [`MemorySubjectKeyStore`].
///
/// # Error Handling
///
/// Implementations report unreachable backends as [`StorageError::Connection`]
/// or [`StorageError::Timeout`] so callers can tell transient failures apart
/// from definitive answers.
#[async_trait]
pub trait SubjectKeyStore: Send + Sync {
    /// Stores a new key entry for `entry.subject_id`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if:
    /// - the subject already has an entry with the same `kid`
    /// - the entry's validity window overlaps an unrevoked entry of the subject
    async fn register_key(&self, entry: &PublicKeyEntry) -> StorageResult<()>;

    /// Returns every entry (revoked or not) registered for a subject, oldest
    /// first. An unknown subject yields an empty list.
    async fn get_keys(&self, subject_id: SubjectId) -> StorageResult<Vec<PublicKeyEntry>>;

    /// Revokes one entry permanently.
    ///
    /// Idempotent: revoking an already-revoked entry succeeds and keeps the
    /// original timestamp and reason.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the subject has no such entry.
    async fn revoke_key(
        &self,
        subject_id: SubjectId,
        kid: &str,
        reason: Option<&str>,
    ) -> StorageResult<()>;

    /// Revokes every unrevoked entry of the subject and stores `new_entry`.
    ///
    /// The default implementation performs the steps sequentially; backends
    /// with transactions should override it to make the swap atomic.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if `new_entry.kid` already exists
    /// for the subject.
    async fn rotate_key(&self, new_entry: &PublicKeyEntry) -> StorageResult<()> {
        let existing = self.get_keys(new_entry.subject_id).await?;
        if existing.iter().any(|entry| entry.kid == new_entry.kid) {
            return Err(StorageError::conflict(format!("Key already exists: {}", new_entry.kid)));
        }
        for entry in existing.iter().filter(|entry| !entry.is_revoked()) {
            self.revoke_key(entry.subject_id, &entry.kid, Some(ROTATION_REASON)).await?;
        }
        self.register_key(new_entry).await
    }

    /// Deletes a subject and all of its entries, returning how many entries
    /// were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the subject has no entries.
    async fn remove_subject(&self, subject_id: SubjectId) -> StorageResult<usize>;
}

/// In-memory implementation of [`SubjectKeyStore`].
///
/// Cloning shares the underlying map.
///
/// # Examples
///
/// ```
/// use tokengate_storage::{
///     SubjectId,
///     keys::{MemorySubjectKeyStore, PublicKeyEntry, SubjectKeyStore},
/// };
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemorySubjectKeyStore::new();
///     let entry = PublicKeyEntry::builder()
///         .subject_id(42)
///         .kid("42-a")
///         .public_key("11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo".to_owned())
///         .build();
///
///     store.register_key(&entry).await?;
///     assert_eq!(store.get_keys(SubjectId::from(42)).await?.len(), 1);
///     Ok(())
/// }
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemorySubjectKeyStore {
    keys: Arc<RwLock<HashMap<SubjectId, Vec<PublicKeyEntry>>>>,
}

impl MemorySubjectKeyStore {
    /// Creates a new empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of subjects with at least one entry.
    #[must_use]
    pub fn subject_count(&self) -> usize {
        self.keys.read().len()
    }
}

fn check_insertable(history: &[PublicKeyEntry], entry: &PublicKeyEntry) -> StorageResult<()> {
    if history.iter().any(|existing| existing.kid == entry.kid) {
        return Err(StorageError::conflict(format!("Key already exists: {}", entry.kid)));
    }
    if !entry.is_revoked()
        && let Some(active) =
            history.iter().find(|existing| !existing.is_revoked() && existing.window_overlaps(entry))
    {
        return Err(StorageError::conflict(format!(
            "Key {} overlaps the validity window of unrevoked key {}",
            entry.kid, active.kid
        )));
    }
    Ok(())
}

#[async_trait]
impl SubjectKeyStore for MemorySubjectKeyStore {
    #[tracing::instrument(skip(self, entry), fields(subject_id = %entry.subject_id, kid = %entry.kid))]
    async fn register_key(&self, entry: &PublicKeyEntry) -> StorageResult<()> {
        let mut keys = self.keys.write();
        let history = keys.entry(entry.subject_id).or_default();
        check_insertable(history, entry)?;
        history.push(entry.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn get_keys(&self, subject_id: SubjectId) -> StorageResult<Vec<PublicKeyEntry>> {
        Ok(self.keys.read().get(&subject_id).cloned().unwrap_or_default())
    }

    #[tracing::instrument(skip(self))]
    async fn revoke_key(
        &self,
        subject_id: SubjectId,
        kid: &str,
        reason: Option<&str>,
    ) -> StorageResult<()> {
        let mut keys = self.keys.write();
        let entry = keys
            .get_mut(&subject_id)
            .and_then(|history| history.iter_mut().find(|entry| entry.kid == kid))
            .ok_or_else(|| StorageError::not_found(format!("{subject_id}/{kid}")))?;

        if entry.revoked_at.is_none() {
            entry.revoked_at = Some(Utc::now());
            entry.revocation_reason = reason.map(String::from);
        }
        Ok(())
    }

    /// Atomic rotate: revocation and insertion happen under one write lock.
    #[tracing::instrument(skip(self, new_entry), fields(subject_id = %new_entry.subject_id, kid = %new_entry.kid))]
    async fn rotate_key(&self, new_entry: &PublicKeyEntry) -> StorageResult<()> {
        let mut keys = self.keys.write();
        let history = keys.entry(new_entry.subject_id).or_default();

        if history.iter().any(|existing| existing.kid == new_entry.kid) {
            return Err(StorageError::conflict(format!("Key already exists: {}", new_entry.kid)));
        }

        let now = Utc::now();
        for existing in history.iter_mut().filter(|existing| existing.revoked_at.is_none()) {
            existing.revoked_at = Some(now);
            existing.revocation_reason = Some(ROTATION_REASON.to_owned());
        }
        history.push(new_entry.clone());
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    async fn remove_subject(&self, subject_id: SubjectId) -> StorageResult<usize> {
        self.keys
            .write()
            .remove(&subject_id)
            .map(|history| history.len())
            .ok_or_else(|| StorageError::not_found(subject_id.to_string()))
    }
}
