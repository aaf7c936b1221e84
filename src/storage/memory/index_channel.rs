//! In-memory indexing side-channel.

use crate::Result;
use crate::models::{ActionType, CustomerId};
use crate::storage::traits::IndexActionChannel;
use std::collections::HashSet;
use std::sync::Mutex;

/// [`IndexActionChannel`] backed by a set of pending `(customer, type)` pairs.
///
/// With nothing registered, no action is ever pending.
#[derive(Default)]
pub struct InMemoryIndexActionChannel {
    pending: Mutex<HashSet<(CustomerId, ActionType)>>,
}

impl InMemoryIndexActionChannel {
    /// Creates a channel with no pending action.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a pending index action.
    pub fn mark_pending(&self, customer_id: CustomerId, action_type: ActionType) {
        self.lock().insert((customer_id, action_type));
    }

    /// Marks an index action as completed.
    pub fn complete(&self, customer_id: &CustomerId, action_type: ActionType) {
        self.lock().remove(&(customer_id.clone(), action_type));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<(CustomerId, ActionType)>> {
        crate::storage::sqlite::acquire_lock(&self.pending)
    }
}

impl IndexActionChannel for InMemoryIndexActionChannel {
    fn has_pending_action(
        &self,
        customer_id: &CustomerId,
        action_type: ActionType,
    ) -> Result<bool> {
        Ok(self.lock().contains(&(customer_id.clone(), action_type)))
    }
}
