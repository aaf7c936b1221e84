//! Suspicion storage trait.

use crate::Result;
use crate::models::{
    CustomerId, Exclusion, RequestAuthor, SuspicionId, SuspiciousIdentity,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashSet};

/// Persistent, lockable store of suspicions and exclusions.
///
/// Every mutation is atomic: it either applies completely or leaves the
/// previous state untouched. Implementations must be thread-safe
/// (`Send + Sync`).
pub trait SuspicionBackend: Send + Sync {
    /// Inserts a suspicion.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Conflict`] if a suspicion with the same
    /// `(customer_id, duplicate_customer_id, rule_code)` already exists.
    fn insert(&self, suspicion: &SuspiciousIdentity) -> Result<()>;

    /// Gets a suspicion by ID.
    fn get(&self, id: &SuspicionId) -> Result<Option<SuspiciousIdentity>>;

    /// Returns true if the `(customer_id, duplicate_customer_id, rule_code)`
    /// triple is already stored.
    fn exists(
        &self,
        customer_id: &CustomerId,
        duplicate_customer_id: Option<&CustomerId>,
        rule_code: &str,
    ) -> Result<bool>;

    /// Finds the suspicion of `rule_code` whose member set is exactly `members`.
    fn find_by_members(
        &self,
        rule_code: &str,
        members: &BTreeSet<CustomerId>,
    ) -> Result<Option<SuspiciousIdentity>>;

    /// Finds every suspicion that has `customer_id` among its members.
    fn find_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<SuspiciousIdentity>>;

    /// Lists the suspicions of a rule, oldest first.
    fn find_by_rule(
        &self,
        rule_code: &str,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<SuspiciousIdentity>>;

    /// Lists suspicions of every rule, oldest first.
    fn list(&self, offset: usize, limit: usize) -> Result<Vec<SuspiciousIdentity>>;

    /// Counts the suspicions of a rule.
    fn count_by_rule(&self, rule_code: &str) -> Result<usize>;

    /// Returns every customer id covered by a suspicion of `rule_code`.
    fn suspicious_customer_ids(&self, rule_code: &str) -> Result<HashSet<CustomerId>>;

    /// Deletes a suspicion. Returns false if it did not exist.
    fn delete(&self, id: &SuspicionId) -> Result<bool>;

    /// Deletes every suspicion involving `customer_id` and returns them.
    fn delete_by_customer(&self, customer_id: &CustomerId) -> Result<Vec<SuspiciousIdentity>>;

    /// Deletes every suspicion involving both identities.
    fn delete_linking(&self, first: &CustomerId, second: &CustomerId) -> Result<usize>;

    /// Acquires the lock if it is free, expired, or already held by `author`.
    ///
    /// Returns false when another author holds an active lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if the suspicion does not exist.
    fn try_lock(
        &self,
        id: &SuspicionId,
        author: &RequestAuthor,
        lock_end_date: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    /// Releases the lock if it is free, expired, or held by `author`.
    ///
    /// Returns false when another author holds an active lock.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if the suspicion does not exist.
    fn unlock(&self, id: &SuspicionId, author: &RequestAuthor, now: DateTime<Utc>)
    -> Result<bool>;

    /// Records an exclusion. Returns false if the pair was already excluded.
    fn insert_exclusion(&self, exclusion: &Exclusion) -> Result<bool>;

    /// Removes an exclusion. Returns false if the pair was not excluded.
    fn delete_exclusion(&self, first: &CustomerId, second: &CustomerId) -> Result<bool>;

    /// Returns true if the pair is excluded, in either order.
    fn is_excluded(&self, first: &CustomerId, second: &CustomerId) -> Result<bool>;

    /// Lists the exclusions involving `customer_id`.
    fn exclusions_for(&self, customer_id: &CustomerId) -> Result<Vec<Exclusion>>;
}
