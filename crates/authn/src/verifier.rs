//! Signature verification over the canonical request message.
//!
//! [`SignatureVerifier::verify`] answers a single yes/no question and fails
//! closed: undecodable signatures, malformed keys and unsupported algorithms
//! all yield `false`, never a panic or an error.

use base64::{
    Engine,
    engine::general_purpose::{URL_SAFE, URL_SAFE_NO_PAD},
};
use ed25519_dalek::{PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH, Signature, VerifyingKey};
use tokengate_storage::{
    Zeroizing,
    keys::{PublicKeyEntry, SignatureAlgorithm},
};

use crate::validation::is_accepted_algorithm;

/// Verifies subject signatures against registered public keys.
///
/// Ed25519 verification uses [`VerifyingKey::verify_strict`], which also
/// rejects small-order keys and non-canonical signature encodings. The
/// underlying arithmetic is constant-time with respect to the signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct SignatureVerifier;

impl SignatureVerifier {
    /// Creates a verifier.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    /// Returns `true` only if `signature` (base64url text) is a valid
    /// signature over `message` by `key`.
    #[must_use]
    pub fn verify(&self, message: &[u8], signature: &str, key: &PublicKeyEntry) -> bool {
        if !is_accepted_algorithm(key.algorithm) {
            tracing::debug!(algorithm = %key.algorithm, kid = %key.kid, "unsupported key algorithm");
            return false;
        }

        let Some(signature) = decode_signature(signature) else {
            tracing::debug!(kid = %key.kid, "undecodable signature");
            return false;
        };

        match key.algorithm {
            SignatureAlgorithm::Ed25519 => {
                let Some(verifying_key) = decode_ed25519_key(&key.public_key) else {
                    tracing::warn!(kid = %key.kid, "stored Ed25519 public key is malformed");
                    return false;
                };
                verifying_key.verify_strict(message, &signature).is_ok()
            },
            _ => false,
        }
    }
}

/// Decodes base64url signature text, unpadded first, then padded.
///
/// Returns `None` unless the text decodes to exactly [`SIGNATURE_LENGTH`]
/// bytes.
pub(crate) fn decode_signature(text: &str) -> Option<Signature> {
    let bytes = URL_SAFE_NO_PAD.decode(text).or_else(|_| URL_SAFE.decode(text)).ok()?;
    let bytes: [u8; SIGNATURE_LENGTH] = bytes.as_slice().try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

/// Parses a base64url (no padding) Ed25519 public key.
fn decode_ed25519_key(encoded: &str) -> Option<VerifyingKey> {
    // Scrub the decoded copy on drop.
    let bytes: Zeroizing<Vec<u8>> = Zeroizing::new(URL_SAFE_NO_PAD.decode(encoded).ok()?);
    let key_bytes: Zeroizing<[u8; PUBLIC_KEY_LENGTH]> =
        Zeroizing::new(bytes.as_slice().try_into().ok()?);
    VerifyingKey::from_bytes(&key_bytes).ok()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use rstest::rstest;

    use super::*;
    use crate::{
        canonical::canonical_message,
        testutil::{TestKeyPair, entry_for},
    };

    fn setup() -> (TestKeyPair, PublicKeyEntry, Vec<u8>) {
        let pair = TestKeyPair::generate();
        let entry = entry_for(42, "42-a", &pair);
        let message = canonical_message(42.into(), "n1");
        (pair, entry, message)
    }

    #[test]
    fn test_genuine_signature_verifies() {
        let (pair, entry, message) = setup();
        let signature = pair.sign(&message);
        assert!(SignatureVerifier::new().verify(&message, &signature, &entry));
    }

    #[test]
    fn test_padded_signature_accepted() {
        let (pair, entry, message) = setup();
        let raw = URL_SAFE_NO_PAD.decode(pair.sign(&message)).unwrap();
        let padded = URL_SAFE.encode(raw);
        assert!(padded.ends_with('='));
        assert!(SignatureVerifier::new().verify(&message, &padded, &entry));
    }

    #[test]
    fn test_other_message_rejected() {
        let (pair, entry, message) = setup();
        let signature = pair.sign(&message);
        let other = canonical_message(42.into(), "n2");
        assert!(!SignatureVerifier::new().verify(&other, &signature, &entry));
    }

    #[test]
    fn test_other_key_rejected() {
        let (_, entry, message) = setup();
        let stranger = TestKeyPair::generate();
        let signature = stranger.sign(&message);
        assert!(!SignatureVerifier::new().verify(&message, &signature, &entry));
    }

    #[test]
    fn test_every_single_bit_flip_rejected() {
        let (pair, entry, message) = setup();
        let raw = URL_SAFE_NO_PAD.decode(pair.sign(&message)).unwrap();
        let verifier = SignatureVerifier::new();

        for byte in 0..raw.len() {
            for bit in 0..8 {
                let mut flipped = raw.clone();
                flipped[byte] ^= 1 << bit;
                let text = URL_SAFE_NO_PAD.encode(&flipped);
                assert!(!verifier.verify(&message, &text, &entry), "flip at byte {byte} bit {bit}");
            }
        }
    }

    #[rstest]
    #[case::not_base64("!!!not base64!!!")]
    #[case::too_short("AAAA")]
    #[case::too_long(&"A".repeat(100))]
    #[case::empty("")]
    fn test_malformed_signature_rejected(#[case] text: &str) {
        let (_, entry, message) = setup();
        assert!(!SignatureVerifier::new().verify(&message, text, &entry));
    }

    #[rstest]
    #[case::ecdsa(SignatureAlgorithm::EcdsaP256Sha256)]
    #[case::rsa(SignatureAlgorithm::RsaPkcs1Sha256)]
    fn test_unsupported_algorithm_fails_closed(#[case] algorithm: SignatureAlgorithm) {
        let (pair, mut entry, message) = setup();
        entry.algorithm = algorithm;
        let signature = pair.sign(&message);
        assert!(!SignatureVerifier::new().verify(&message, &signature, &entry));
    }

    #[rstest]
    #[case::garbage("not-a-key")]
    #[case::short("AAAA")]
    #[case::padded("11qYAYKxCrfVS_7TyWQHOg7hcvPapiMlrwIaaPcHURo=")]
    fn test_malformed_public_key_fails_closed(#[case] public_key: &str) {
        let (pair, mut entry, message) = setup();
        entry.public_key = public_key.to_owned().into();
        let signature = pair.sign(&message);
        assert!(!SignatureVerifier::new().verify(&message, &signature, &entry));
    }

    #[test]
    fn test_small_order_key_rejected() {
        // The identity point: every "signature" with R = identity, s = 0 would
        // satisfy the cofactored equation. verify_strict must refuse it.
        let mut identity = [0u8; 32];
        identity[0] = 1;
        let (_, mut entry, message) = setup();
        entry.public_key = URL_SAFE_NO_PAD.encode(identity).into();

        let mut forged = [0u8; 64];
        forged[0] = 1;
        let text = URL_SAFE_NO_PAD.encode(forged);
        assert!(!SignatureVerifier::new().verify(&message, &text, &entry));
    }
}
