//! Common identifier types.

use serde::{Deserialize, Serialize};

/// Identifier of an authenticating subject (a registered user or client).
///
/// Wraps a raw `i64` so a subject id cannot be confused with other integers
/// that travel next to it (timestamps, counters). Only positive values name a
/// real subject; see [`SubjectId::is_valid`].
///
/// # Examples
///
/// ```
/// use tokengate_storage::SubjectId;
///
/// let subject = SubjectId::from(42);
/// assert_eq!(i64::from(subject), 42);
/// assert_eq!(subject.to_string(), "42");
/// assert!(subject.is_valid());
/// assert!(!SubjectId::from(0).is_valid());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub i64);

impl SubjectId {
    /// Returns `true` if this id can refer to a registered subject.
    #[must_use]
    pub fn is_valid(self) -> bool {
        self.0 > 0
    }
}

impl From<i64> for SubjectId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<SubjectId> for i64 {
    fn from(id: SubjectId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
