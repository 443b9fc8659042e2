//! Subject key storage for the tokengate authentication core.
//!
//! This crate owns the persistent half of authentication: which public keys a
//! subject has registered, and their lifecycle (validity windows, revocation,
//! rotation). Verification and token issuance live in `tokengate-authn`,
//! which consumes the [`SubjectKeyStore`](keys::SubjectKeyStore) trait.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  tokengate-authn                            │
//! │   AuthenticationCore → KeyResolver (cached, bounded)        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                  tokengate-storage                          │
//! │        SubjectKeyStore trait, PublicKeyEntry                │
//! ├──────────────────────┬──────────────────────────────────────┤
//! │ MemorySubjectKeyStore│   account database adapter           │
//! │   (testing)          │   (deployment specific)              │
//! └──────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! # Error Handling
//!
//! All operations return [`StorageResult<T>`]. Backends map their internal
//! errors onto [`StorageError`] and must report unreachable or slow backends
//! as transient ([`StorageError::is_transient`]).
//!
//! # Feature Flags
//!
//! - **`testutil`**: Enables the `testutil` module with entry builders, a pre-populated store and
//!   assertion macros. Enable this in `[dev-dependencies]` for integration tests.

#![deny(unsafe_code)]

pub mod error;
pub mod keys;
#[cfg(any(test, feature = "testutil"))]
#[allow(clippy::expect_used)]
pub mod testutil;
pub mod types;

pub use error::{BoxError, StorageError, StorageResult};
pub use types::SubjectId;
pub use zeroize::Zeroizing;
