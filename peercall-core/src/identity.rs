//! Participant identity
//!
//! The call core never authenticates anyone. It only needs the stable id of
//! the local user, which it obtains from an [`IdentityProvider`] supplied by
//! the embedding application.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

/// Stable identity of a call participant
///
/// Ordered so that simultaneous offers can be tie-broken deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    /// Create a new user id
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for UserId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UserId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Source of the current user's identity
///
/// Implement this over whatever authentication layer the application uses.
pub trait IdentityProvider: Send + Sync {
    /// Stable id of the signed-in user
    fn current_user_id(&self) -> UserId;
}

/// Identity provider returning a fixed user id
#[derive(Debug, Clone)]
pub struct StaticIdentity(UserId);

impl StaticIdentity {
    /// Create a provider that always yields `id`
    pub fn new(id: impl Into<UserId>) -> Self {
        Self(id.into())
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> UserId {
        self.0.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_display() {
        let id = UserId::new("alice");
        assert_eq!(id.to_string(), "alice");
        assert_eq!(id.as_str(), "alice");
    }

    #[test]
    fn test_user_id_ordering() {
        assert!(UserId::from("alice") < UserId::from("bob"));
        assert!(UserId::from("bob") > UserId::from("alice"));
    }

    #[test]
    fn test_user_id_serializes_as_plain_string() {
        let id = UserId::new("alice");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"alice\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_static_identity() {
        let provider = StaticIdentity::new("carol");
        assert_eq!(provider.current_user_id(), UserId::from("carol"));
    }
}
