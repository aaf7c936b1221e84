//! Traits for the external identity store and indexing side-channel.

use crate::Result;
use crate::models::{ActionType, CustomerId, Identity, MergeOutcome, MergeRequest};

/// Source of identity records.
pub trait IdentityStore: Send + Sync {
    /// Gets an identity by customer id.
    fn find_by_customer_id(&self, customer_id: &CustomerId) -> Result<Option<Identity>>;

    /// Pages through the ids of live identities that carry every key.
    ///
    /// Ids are returned in a stable order so that successive pages do not
    /// overlap.
    fn find_ids_with_attributes(
        &self,
        keys: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CustomerId>>;

    /// Fetches several identities, restricted to `attribute_filter`.
    ///
    /// Unknown ids are skipped. An empty filter returns every attribute.
    fn search_batch(
        &self,
        customer_ids: &[CustomerId],
        attribute_filter: &[String],
    ) -> Result<Vec<Identity>>;

    /// Absorbs `request.secondary` into `request.primary`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::NotFound`] if either identity is missing.
    fn merge(&self, request: &MergeRequest) -> Result<MergeOutcome>;
}

/// Indexing side-channel, consulted before reconciling an identity.
pub trait IndexActionChannel: Send + Sync {
    /// Returns true if an index action for this identity is still pending.
    fn has_pending_action(&self, customer_id: &CustomerId, action_type: ActionType)
    -> Result<bool>;
}
