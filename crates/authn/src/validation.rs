//! Request shape and key algorithm checks.
//!
//! Shape validation runs before any store lookup, so garbage input is
//! rejected without touching the key store or the nonce ledger.
//!
//! # Security
//!
//! - Only algorithms with a full verification path are accepted
//! - Oversized fields are refused before decoding

use tokengate_storage::keys::SignatureAlgorithm;

use crate::{
    error::{AuthError, Result},
    request::TokenRequest,
};

/// Maximum nonce length in bytes.
pub const MAX_NONCE_LEN: usize = 256;

/// Maximum length of the base64url signature text. A 64-byte Ed25519
/// signature needs 88 characters; the slack leaves room for other schemes.
pub const MAX_SIGNATURE_LEN: usize = 512;

/// Key algorithms with a complete verification path.
///
/// Entries tagged with any other [`SignatureAlgorithm`] still resolve, but
/// never verify. Per RFC 8725 Section 3.1, validators must reject algorithms
/// they do not fully implement.
pub const ACCEPTED_ALGORITHMS: &[SignatureAlgorithm] = &[SignatureAlgorithm::Ed25519];

/// Returns `true` if signatures made with `algorithm` can be verified.
///
/// ```
/// use tokengate_authn::validation::is_accepted_algorithm;
/// use tokengate_storage::keys::SignatureAlgorithm;
///
/// assert!(is_accepted_algorithm(SignatureAlgorithm::Ed25519));
/// assert!(!is_accepted_algorithm(SignatureAlgorithm::RsaPkcs1Sha256));
/// ```
#[must_use]
pub fn is_accepted_algorithm(algorithm: SignatureAlgorithm) -> bool {
    ACCEPTED_ALGORITHMS.contains(&algorithm)
}

/// Validates the shape of a [`TokenRequest`].
///
/// # Errors
///
/// Returns [`AuthError::MalformedRequest`] if:
/// - the subject id is not positive
/// - the nonce is empty, longer than [`MAX_NONCE_LEN`], or contains anything other than visible
///   ASCII (`0x21..=0x7E`)
/// - the signature is empty or longer than [`MAX_SIGNATURE_LEN`]
pub fn validate_request(request: &TokenRequest) -> Result<()> {
    if !request.subject_id().is_valid() {
        return Err(AuthError::malformed_request("subject id must be positive"));
    }

    let nonce = request.nonce();
    if nonce.is_empty() {
        return Err(AuthError::malformed_request("nonce is empty"));
    }
    if nonce.len() > MAX_NONCE_LEN {
        return Err(AuthError::malformed_request(format!(
            "nonce exceeds {MAX_NONCE_LEN} bytes"
        )));
    }
    if !nonce.bytes().all(|b| b.is_ascii_graphic()) {
        return Err(AuthError::malformed_request("nonce contains non-printable characters"));
    }

    let signature = request.signature();
    if signature.is_empty() {
        return Err(AuthError::malformed_request("signature is empty"));
    }
    if signature.len() > MAX_SIGNATURE_LEN {
        return Err(AuthError::malformed_request(format!(
            "signature exceeds {MAX_SIGNATURE_LEN} bytes"
        )));
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_valid_request() {
        let request = TokenRequest::new(42, "n1", "c2lnbmF0dXJl");
        assert!(validate_request(&request).is_ok());
    }

    #[rstest]
    #[case::zero_subject(TokenRequest::new(0, "n1", "sig"), "positive")]
    #[case::negative_subject(TokenRequest::new(-3, "n1", "sig"), "positive")]
    #[case::empty_nonce(TokenRequest::new(1, "", "sig"), "nonce is empty")]
    #[case::long_nonce(TokenRequest::new(1, "a".repeat(MAX_NONCE_LEN + 1), "sig"), "exceeds")]
    #[case::space_in_nonce(TokenRequest::new(1, "n 1", "sig"), "non-printable")]
    #[case::newline_in_nonce(TokenRequest::new(1, "n1\n", "sig"), "non-printable")]
    #[case::unicode_nonce(TokenRequest::new(1, "nönce", "sig"), "non-printable")]
    #[case::empty_signature(TokenRequest::new(1, "n1", ""), "signature is empty")]
    #[case::long_signature(TokenRequest::new(1, "n1", "A".repeat(MAX_SIGNATURE_LEN + 1)), "exceeds")]
    fn test_malformed_requests(#[case] request: TokenRequest, #[case] needle: &str) {
        let result = validate_request(&request);
        assert!(
            matches!(result, Err(AuthError::MalformedRequest(ref msg)) if msg.contains(needle)),
            "expected MalformedRequest containing {needle:?}, got {result:?}"
        );
    }

    #[test]
    fn test_nonce_at_max_length_accepted() {
        let request = TokenRequest::new(1, "a".repeat(MAX_NONCE_LEN), "sig");
        assert!(validate_request(&request).is_ok());
    }

    #[test]
    fn test_accepted_algorithms_constant() {
        assert_eq!(ACCEPTED_ALGORITHMS, &[SignatureAlgorithm::Ed25519]);
        assert!(!is_accepted_algorithm(SignatureAlgorithm::EcdsaP256Sha256));
        assert!(!is_accepted_algorithm(SignatureAlgorithm::RsaPkcs1Sha256));
    }
}
