//! Common types used throughout Deferq.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a queued action.
///
/// Serialized transparently as a plain string so persisted queues stay
/// readable and tolerant of ids written by other producers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionId(String);

impl ActionId {
    /// Create an ActionId from a caller-supplied string.
    ///
    /// # Errors
    /// - Returns error if id is empty or only whitespace
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(crate::Error::InvalidInput(
                "ActionId cannot be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// Generate a fresh id from the current millisecond timestamp and a
    /// random component, e.g. `1760781234567-3f9a0c21d4e8`.
    pub fn generate() -> Self {
        let random = Uuid::new_v4().simple().to_string();
        Self(format!("{}-{}", Utc::now().timestamp_millis(), &random[..12]))
    }

    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ActionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    #[test]
    fn test_action_id_creation() {
        let id = ActionId::new("enroll-42").unwrap();
        assert_eq!(id.as_str(), "enroll-42");
    }

    #[test]
    fn test_action_id_empty_fails() {
        assert!(ActionId::new("").is_err());
        assert!(ActionId::new("   ").is_err());
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let ids: HashSet<ActionId> = (0..1000).map(|_| ActionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_generated_id_shape() {
        let id = ActionId::generate();
        let (millis, random) = id.as_str().split_once('-').unwrap();
        assert!(millis.parse::<i64>().is_ok());
        assert_eq!(random.len(), 12);
    }

    #[test]
    fn test_serializes_as_plain_string() {
        let id = ActionId::new("a1").unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"a1\"");
        let back: ActionId = serde_json::from_str("\"a1\"").unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn prop_non_blank_ids_are_accepted(s in "[a-zA-Z0-9_-]{1,40}") {
            let id = ActionId::new(s.clone()).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }
    }
}
