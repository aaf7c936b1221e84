//! Rule catalog and action queue traits.

use crate::Result;
use crate::models::{ActionType, CustomerId, DuplicateRule, SuspicionAction};
use chrono::{DateTime, Utc};

/// Priority-ranked catalog of duplicate detection rules.
pub trait RuleCatalog: Send + Sync {
    /// Lists every rule, ascending priority then code.
    fn list_rules(&self) -> Result<Vec<DuplicateRule>>;

    /// Gets a rule by code.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if no rule has this code.
    fn get(&self, code: &str) -> Result<DuplicateRule>;

    /// Replaces an existing rule.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if no rule has this code.
    fn update(&self, rule: &DuplicateRule) -> Result<()>;

    /// Inserts a rule or replaces the one with the same code.
    fn upsert(&self, rule: &DuplicateRule) -> Result<()>;

    /// Lists active daemon rules in execution order.
    fn scannable_rules(&self) -> Result<Vec<DuplicateRule>> {
        Ok(self
            .list_rules()?
            .into_iter()
            .filter(DuplicateRule::is_scannable)
            .collect())
    }
}

/// FIFO queue of reconciliation actions.
pub trait ActionQueue: Send + Sync {
    /// Appends an action.
    fn enqueue(
        &self,
        customer_id: &CustomerId,
        action_type: ActionType,
        date: DateTime<Utc>,
    ) -> Result<SuspicionAction>;

    /// Returns up to `limit` actions, oldest first.
    fn fetch_batch(&self, limit: usize) -> Result<Vec<SuspicionAction>>;

    /// Deletes processed actions and returns how many were removed.
    fn delete_batch(&self, ids: &[i64]) -> Result<usize>;

    /// Number of queued actions.
    fn count(&self) -> Result<usize>;
}
