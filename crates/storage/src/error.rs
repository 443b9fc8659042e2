//! Storage error types and result alias.
//!
//! Every [`SubjectKeyStore`](crate::keys::SubjectKeyStore) implementation maps
//! its backend failures onto [`StorageError`]. The authentication core only
//! cares about one distinction: whether a failure is transient (worth a retry
//! with backoff) or definitive.
//!
//! # Error Types
//!
//! - [`StorageError::NotFound`] - The subject or key does not exist
//! - [`StorageError::Conflict`] - The write would violate a store invariant
//! - [`StorageError::Connection`] - The backend could not be reached
//! - [`StorageError::Serialization`] - Stored data could not be decoded
//! - [`StorageError::Internal`] - Backend-specific internal errors
//! - [`StorageError::Timeout`] - The operation exceeded its time limit
//! - [`StorageError::RateLimitExceeded`] - The backend refused new work until capacity frees up
//!
//! # Example
//!
//! ```
//! use tokengate_storage::{StorageError, StorageResult};
//!
//! fn lookup(subject: i64) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(format!("subject {subject}")))
//! }
//!
//! assert!(lookup(7).is_err());
//! ```

use std::{sync::Arc, time::Duration};

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during key store operations.
///
/// Errors preserve their source chain via `#[source]` so diagnostics can
/// render the full context.
///
/// # Non-exhaustive
///
/// New variants may be added in minor releases. Downstream match expressions
/// must include a wildcard arm.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested subject or key does not exist.
    #[error("Not found: {key}")]
    NotFound {
        /// Identifier of the missing item.
        key: String,
    },

    /// The write conflicts with existing state (duplicate key id, overlapping
    /// validity window, reactivating a revoked key).
    #[error("Conflict: {message}")]
    Conflict {
        /// Description of the conflicting state.
        message: String,
    },

    /// The backend could not be reached.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// Stored data could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Backend-specific failure that fits no other category.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation exceeded its configured time limit.
    #[error("Operation timeout")]
    Timeout,

    /// The backend is at a limit and refuses new work until capacity frees
    /// up.
    #[error("Rate limit exceeded, retry after {}ms", retry_after.as_millis())]
    RateLimitExceeded {
        /// Earliest time after which a retry may succeed.
        retry_after: Duration,
    },
}

impl StorageError {
    /// Creates a new `NotFound` error for the given identifier.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error with the given message.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict { message: message.into() }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Creates a new `RateLimitExceeded` error with a retry hint.
    #[must_use]
    pub fn rate_limit_exceeded(retry_after: Duration) -> Self {
        Self::RateLimitExceeded { retry_after }
    }

    /// Returns `true` if the failure may clear up on its own.
    ///
    /// Connection failures, timeouts and rate limiting are transient;
    /// everything else is a definitive answer from the backend and retrying
    /// it cannot help.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout | Self::RateLimitExceeded { .. })
    }
}
