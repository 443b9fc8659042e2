//! Shared test utilities for key store testing.
//!
//! This module provides helpers for building key entries, counting a
//! subject's unrevoked keys, and asserting on [`StorageResult`](crate::StorageResult) values. It is
//! feature-gated behind `testutil` to prevent leaking into production builds.
//!
//! # Usage
//!
//! In integration tests, enable the feature in `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! tokengate-storage = { path = "../storage", features = ["testutil"] }
//! ```
//!
//! Then import helpers:
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use tokengate_storage::testutil::{make_entry, unrevoked_count};
//! ```

use chrono::{DateTime, Duration, Utc};

use crate::{
    keys::{PublicKeyEntry, SubjectKeyStore},
    types::SubjectId,
};

/// Placeholder key material for entries whose bytes are never verified.
pub const PLACEHOLDER_PUBLIC_KEY: &str = "11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo";

/// Create an open-ended Ed25519 entry that became valid one hour ago.
#[must_use]
pub fn make_entry(subject: i64, kid: &str) -> PublicKeyEntry {
    make_entry_with_window(subject, kid, Utc::now() - Duration::hours(1), None)
}

/// Create an Ed25519 entry with an explicit validity window.
#[must_use]
pub fn make_entry_with_window(
    subject: i64,
    kid: &str,
    valid_from: DateTime<Utc>,
    valid_until: Option<DateTime<Utc>>,
) -> PublicKeyEntry {
    PublicKeyEntry::builder()
        .subject_id(subject)
        .kid(kid)
        .public_key(PLACEHOLDER_PUBLIC_KEY.to_owned())
        .valid_from(valid_from)
        .maybe_valid_until(valid_until)
        .build()
}

/// Assert that a [`StorageResult`](crate::StorageResult) is a
/// [`StorageError::Conflict`](crate::StorageError::Conflict).
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use tokengate_storage::assert_conflict;
/// use tokengate_storage::error::{StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::conflict("kid exists"));
/// assert_conflict!(result);
/// ```
#[macro_export]
macro_rules! assert_conflict {
    ($result:expr) => {
        $crate::assert_conflict!($result, "assertion failed")
    };
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::Conflict { .. })),
            "{}: expected StorageError::Conflict, got: {:?}",
            $msg,
            result,
        );
    }};
}

/// Assert that a [`StorageResult`](crate::StorageResult) is a
/// [`StorageError::NotFound`](crate::StorageError::NotFound).
///
/// # Examples
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use tokengate_storage::assert_not_found;
/// use tokengate_storage::error::{StorageError, StorageResult};
///
/// let result: StorageResult<()> = Err(StorageError::not_found("42/kid"));
/// assert_not_found!(result);
/// ```
#[macro_export]
macro_rules! assert_not_found {
    ($result:expr) => {
        $crate::assert_not_found!($result, "assertion failed")
    };
    ($result:expr, $msg:expr) => {{
        let result = $result;
        assert!(
            matches!(result, Err($crate::error::StorageError::NotFound { .. })),
            "{}: expected StorageError::NotFound, got: {:?}",
            $msg,
            result,
        );
    }};
}

/// Returns the number of unrevoked entries a subject holds.
///
/// # Panics
///
/// Panics if the store read fails.
pub async fn unrevoked_count(store: &impl SubjectKeyStore, subject: i64) -> usize {
    store
        .get_keys(SubjectId::from(subject))
        .await
        .expect("get_keys failed")
        .iter()
        .filter(|entry| !entry.is_revoked())
        .count()
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{StorageError, StorageResult};

    #[test]
    fn test_make_entry_is_active_now() {
        let entry = make_entry(3, "3-a");
        assert!(entry.is_active_at(Utc::now()));
        assert_eq!(entry.subject_id, SubjectId::from(3));
    }

    #[test]
    fn test_make_entry_with_window_keeps_bounds() {
        let from = Utc::now() + Duration::minutes(5);
        let until = from + Duration::minutes(5);
        let entry = make_entry_with_window(3, "3-b", from, Some(until));
        assert_eq!(entry.valid_from, from);
        assert_eq!(entry.valid_until, Some(until));
    }

    #[test]
    fn test_assert_conflict_macro() {
        let result: StorageResult<()> = Err(StorageError::conflict("dup"));
        assert_conflict!(result);
    }

    #[test]
    fn test_assert_not_found_macro() {
        let result: StorageResult<()> = Err(StorageError::not_found("missing"));
        assert_not_found!(result, "lookup");
    }
}
