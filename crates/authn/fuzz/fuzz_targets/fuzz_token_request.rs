//! Fuzz target for token request intake.
//!
//! Feeds arbitrary bytes as a JSON token request through validation,
//! canonical encoding and signature verification. Every input must end in a
//! clean accept or reject without panicking.

#![no_main]

use chrono::{TimeDelta, Utc};
use libfuzzer_sys::fuzz_target;
use tokengate_authn::{
    SignatureVerifier, TokenRequest, canonical::canonical_message, validation::validate_request,
};
use tokengate_storage::keys::PublicKeyEntry;

// Ed25519 public key of an all-zero seed.
const FIXED_PUBLIC_KEY: &str = "O2onvM62pC1io6jQKm8Nc2UyFXcd4kOmOsBIoYtZ2ik";

fuzz_target!(|data: &[u8]| {
    let Ok(request) = serde_json::from_slice::<TokenRequest>(data) else {
        return;
    };

    let accepted = validate_request(&request).is_ok();
    let message = canonical_message(request.subject_id(), request.nonce());

    let key = PublicKeyEntry::builder()
        .subject_id(request.subject_id())
        .kid("fuzz")
        .public_key(FIXED_PUBLIC_KEY.to_owned())
        .valid_from(Utc::now() - TimeDelta::hours(1))
        .build();

    // Nothing the fuzzer produces can carry a valid signature for this key.
    let verified = SignatureVerifier::new().verify(&message, request.signature(), &key);
    assert!(!(accepted && verified));
});
