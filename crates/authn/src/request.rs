//! The signed authentication request.

use serde::{Deserialize, Serialize};
use tokengate_storage::SubjectId;

/// A subject's request for a session token.
///
/// Carries the subject identifier, a nonce previously handed out by
/// [`AuthenticationCore::issue_challenge`](crate::AuthenticationCore::issue_challenge),
/// and the subject's signature over
/// [`canonical_message`](crate::canonical::canonical_message)`(subject_id, nonce)`
/// as base64url text.
///
/// The request is immutable once built. On the wire it uses camelCase field
/// names; `userId` is accepted for `subjectId`.
///
/// ```
/// use tokengate_authn::TokenRequest;
///
/// let request: TokenRequest =
///     serde_json::from_str(r#"{"userId": 42, "nonce": "n1", "signature": "c2ln"}"#).unwrap();
/// assert_eq!(i64::from(request.subject_id()), 42);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TokenRequest {
    #[serde(alias = "userId")]
    subject_id: SubjectId,
    nonce: String,
    signature: String,
}

impl TokenRequest {
    /// Builds a request from its three parts.
    #[must_use]
    pub fn new(
        subject_id: impl Into<SubjectId>,
        nonce: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self { subject_id: subject_id.into(), nonce: nonce.into(), signature: signature.into() }
    }

    /// Subject claiming to have signed the request.
    #[must_use]
    pub fn subject_id(&self) -> SubjectId {
        self.subject_id
    }

    /// Server-issued nonce the signature covers.
    #[must_use]
    pub fn nonce(&self) -> &str {
        &self.nonce
    }

    /// Base64url-encoded signature.
    #[must_use]
    pub fn signature(&self) -> &str {
        &self.signature
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_is_camel_case() {
        let request = TokenRequest::new(42, "n1", "sig");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json, serde_json::json!({"subjectId": 42, "nonce": "n1", "signature": "sig"}));
    }

    #[test]
    fn test_user_id_alias() {
        let request: TokenRequest =
            serde_json::from_str(r#"{"userId": 7, "nonce": "x", "signature": "y"}"#).unwrap();
        assert_eq!(request.subject_id(), SubjectId::from(7));
    }

    #[test]
    fn test_missing_field_rejected() {
        let result = serde_json::from_str::<TokenRequest>(r#"{"subjectId": 7, "nonce": "x"}"#);
        assert!(result.is_err());
    }
}
