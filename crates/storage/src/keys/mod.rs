//! Subject public keys and their storage.
//!
//! Subjects authenticate by signing a challenge with a private key they hold.
//! The matching public half is registered here, one history per subject.
//! The authentication core reads these histories through
//! [`SubjectKeyStore::get_keys`] and decides which entry (if any) is usable.
//!
//! # Examples
//!
//! ```
//! use tokengate_storage::{
//!     SubjectId,
//!     keys::{MemorySubjectKeyStore, PublicKeyEntry, SubjectKeyStore},
//! };
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let store = MemorySubjectKeyStore::new();
//!
//! let first = PublicKeyEntry::builder()
//!     .subject_id(100)
//!     .kid("100-a")
//!     .public_key("11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo".to_owned())
//!     .build();
//! store.register_key(&first).await.unwrap();
//!
//! let second = PublicKeyEntry::builder()
//!     .subject_id(100)
//!     .kid("100-b")
//!     .public_key("O2onvM62pC1io6jQKm8Nc2UyFXcd4kOmOsBIoYtZ2ik".to_owned())
//!     .build();
//! store.rotate_key(&second).await.unwrap();
//!
//! let history = store.get_keys(SubjectId::from(100)).await.unwrap();
//! assert!(history[0].is_revoked());
//! assert!(!history[1].is_revoked());
//! # });
//! ```

mod public_key;
mod store;

pub use public_key::{KeyState, PublicKeyEntry, SignatureAlgorithm};
pub use store::{MemorySubjectKeyStore, ROTATION_REASON, SubjectKeyStore};
