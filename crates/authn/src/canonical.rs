//! Canonical byte encoding of the message a subject signs.
//!
//! ```text
//! ┌──────────────┬──────────────┬───────────────┬──────────────┬─────────┐
//! │ u32 BE len   │ domain tag   │ i64 BE        │ u32 BE len   │ nonce   │
//! │ (domain)     │              │ subject id    │ (nonce)      │ bytes   │
//! └──────────────┴──────────────┴───────────────┴──────────────┴─────────┘
//! ```
//!
//! Every variable-length field is length-prefixed, so two different
//! `(subject, nonce)` pairs never encode to the same bytes. The domain tag
//! keeps a signature made for this protocol from being valid for any other
//! message the same key might sign.

use tokengate_storage::SubjectId;

/// Domain separation tag, versioned so the layout can change later without
/// ambiguity.
pub const DOMAIN_TAG: &[u8] = b"tokengate/token-request/v1";

/// Encodes `(subject_id, nonce)` into the bytes covered by the request
/// signature.
///
/// ```
/// use tokengate_authn::canonical::{DOMAIN_TAG, canonical_message};
/// use tokengate_storage::SubjectId;
///
/// let message = canonical_message(SubjectId::from(42), "n1");
/// assert_eq!(message.len(), 4 + DOMAIN_TAG.len() + 8 + 4 + 2);
/// ```
#[must_use]
pub fn canonical_message(subject_id: SubjectId, nonce: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(4 + DOMAIN_TAG.len() + 8 + 4 + nonce.len());
    push_length_prefixed(&mut message, DOMAIN_TAG);
    message.extend_from_slice(&i64::from(subject_id).to_be_bytes());
    push_length_prefixed(&mut message, nonce.as_bytes());
    message
}

fn push_length_prefixed(buf: &mut Vec<u8>, field: &[u8]) {
    // Request validation caps nonces far below u32::MAX.
    let len = u32::try_from(field.len()).unwrap_or(u32::MAX);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(field);
}
