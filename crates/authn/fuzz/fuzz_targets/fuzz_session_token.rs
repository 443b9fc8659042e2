//! Fuzz target for session token validation.
//!
//! Feeds arbitrary strings as session credentials. Validation must reject
//! each one with an `AuthError` and never panic.

#![no_main]

use std::sync::OnceLock;

use chrono::Utc;
use libfuzzer_sys::fuzz_target;
use tokengate_authn::{AuthConfig, ServerSigningKey, TokenIssuer};

fn issuer() -> &'static TokenIssuer {
    static ISSUER: OnceLock<TokenIssuer> = OnceLock::new();
    ISSUER.get_or_init(|| {
        TokenIssuer::new(ServerSigningKey::generate("fuzz-server"), &AuthConfig::default())
    })
}

fuzz_target!(|data: &[u8]| {
    let Ok(credential) = std::str::from_utf8(data) else {
        return;
    };
    assert!(issuer().validate(credential, Utc::now()).is_err());
});
