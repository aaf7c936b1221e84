//! Queued reconciliation triggers.

use super::CustomerId;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Kind of identity change that queued a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionType {
    /// Identity created.
    Create,
    /// Identity attributes updated.
    Update,
    /// Identity deleted.
    Delete,
    /// Identity absorbed another identity.
    Merge,
    /// A previous merge was cancelled.
    MergeCancelled,
}

impl ActionType {
    /// Returns the stored name of the action type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Merge => "MERGE",
            Self::MergeCancelled => "MERGE_CANCELLED",
        }
    }

    /// Parses an action type name (case-insensitive, `-` or `_`).
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::InvalidInput`] for unknown names.
    pub fn parse(s: &str) -> crate::Result<Self> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            "MERGE" => Ok(Self::Merge),
            "MERGE_CANCELLED" => Ok(Self::MergeCancelled),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown action type: {other}"
            ))),
        }
    }

    /// Returns true if the rule set for this action is the creation one.
    #[must_use]
    pub const fn uses_creation_rules(self) -> bool {
        matches!(self, Self::Create)
    }
}

/// A pending reconciliation for one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspicionAction {
    /// Queue identifier.
    pub id: i64,
    /// Changed identity.
    pub customer_id: CustomerId,
    /// Kind of change.
    pub action_type: ActionType,
    /// When the change happened.
    pub date: DateTime<Utc>,
}

impl SuspicionAction {
    /// Returns true once `delay` has elapsed since the action date.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>, delay: Duration) -> bool {
        now - self.date >= delay
    }
}
