//! Suspicion lifecycle: create, lock, exclude, delete.
//!
//! Every mutation goes through the backend in a single transaction and emits
//! the matching [`IdentityChangeEvent`] on success.

use crate::models::{
    CustomerId, EventMeta, Exclusion, IdentityChangeEvent, NewSuspicion, RequestAuthor,
    SuspicionId, SuspicionPage, SuspiciousIdentity,
};
use crate::observability::EventBus;
use crate::storage::SuspicionBackend;
use crate::{Error, Result};
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

const EVENT_SOURCE: &str = "suspicion_service";

/// Settings for [`SuspicionService`].
#[derive(Debug, Clone)]
pub struct SuspicionSettings {
    /// How long a lock lasts before it lapses.
    pub lock_duration: Duration,
    /// Client code attached to emitted events.
    pub client_code: String,
}

impl Default for SuspicionSettings {
    fn default() -> Self {
        Self {
            lock_duration: Duration::seconds(600),
            client_code: "identity-dedup".to_string(),
        }
    }
}

/// Service over the suspicion store.
pub struct SuspicionService {
    backend: Arc<dyn SuspicionBackend>,
    events: EventBus,
    settings: SuspicionSettings,
}

impl SuspicionService {
    /// Creates the service.
    #[must_use]
    pub fn new(
        backend: Arc<dyn SuspicionBackend>,
        events: EventBus,
        settings: SuspicionSettings,
    ) -> Self {
        Self {
            backend,
            events,
            settings,
        }
    }

    /// Returns the underlying store.
    #[must_use]
    pub fn backend(&self) -> &dyn SuspicionBackend {
        self.backend.as_ref()
    }

    /// Returns the event bus.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }

    /// Creates a suspicion unless an equivalent one exists.
    ///
    /// A suspicion is equivalent when it has the same
    /// `(customer_id, duplicate_customer_id, rule_code)` triple or the same
    /// member set under the same rule. Returns `None` in that case.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a blank rule code, or a storage
    /// error.
    #[instrument(
        name = "identity_dedup.suspicion.create",
        skip(self, suspicion, author),
        fields(customer_id = %suspicion.customer_id, rule_code = %suspicion.rule_code)
    )]
    pub fn create(
        &self,
        suspicion: NewSuspicion,
        author: &RequestAuthor,
    ) -> Result<Option<SuspiciousIdentity>> {
        if suspicion.rule_code.trim().is_empty() {
            return Err(Error::InvalidInput("rule code must not be blank".to_string()));
        }
        if self.backend.exists(
            &suspicion.customer_id,
            suspicion.duplicate_customer_id.as_ref(),
            &suspicion.rule_code,
        )? || self
            .backend
            .find_by_members(&suspicion.rule_code, &suspicion.members)?
            .is_some()
        {
            debug!("Equivalent suspicion already stored");
            return Ok(None);
        }

        let created = suspicion.into_suspicion(Utc::now());
        match self.backend.insert(&created) {
            Ok(()) => {},
            // Lost a race with another writer for the same triple.
            Err(Error::Conflict(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        metrics::counter!("dedup_suspicions_created_total", "rule_code" => created.rule_code.clone())
            .increment(1);
        self.events.publish(IdentityChangeEvent::MarkedSuspicious {
            meta: EventMeta::new(EVENT_SOURCE),
            customer_id: created.customer_id.clone(),
            rule_code: created.rule_code.clone(),
            author: author.clone(),
            client_code: self.settings.client_code.clone(),
            metadata: created.metadata.clone(),
        });
        Ok(Some(created))
    }

    /// Gets a suspicion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it does not exist.
    pub fn get(&self, id: &SuspicionId) -> Result<SuspiciousIdentity> {
        self.backend
            .get(id)?
            .ok_or_else(|| Error::not_found("suspicion", id.as_str()))
    }

    /// Locks a suspicion for `author` until `now + lock_duration`.
    ///
    /// Re-locking by the current holder extends the lock.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the suspicion does not exist.
    /// - [`Error::Conflict`] if another author holds an active lock.
    pub fn lock(&self, id: &SuspicionId, author: &RequestAuthor) -> Result<()> {
        let now = Utc::now();
        if self
            .backend
            .try_lock(
                id,
                author,
                now.checked_add_signed(self.settings.lock_duration)
                    .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC),
                now,
            )?
        {
            Ok(())
        } else {
            Err(Error::Conflict(format!(
                "suspicion {id} is locked by another author"
            )))
        }
    }

    /// Unlocks a suspicion held by `author` (or already free).
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the suspicion does not exist.
    /// - [`Error::Conflict`] if another author holds an active lock.
    pub fn unlock(&self, id: &SuspicionId, author: &RequestAuthor) -> Result<()> {
        if self.backend.unlock(id, author, Utc::now())? {
            Ok(())
        } else {
            Err(Error::Conflict(format!(
                "suspicion {id} is locked by another author"
            )))
        }
    }

    /// Locks a suspicion and returns a guard that unlocks it when released
    /// or dropped.
    ///
    /// # Errors
    ///
    /// Same as [`Self::lock`].
    pub fn lock_guard(
        &self,
        id: &SuspicionId,
        author: &RequestAuthor,
    ) -> Result<SuspicionLockGuard<'_>> {
        self.lock(id, author)?;
        Ok(SuspicionLockGuard {
            service: self,
            id: id.clone(),
            author: author.clone(),
            released: false,
        })
    }

    /// Deletes a suspicion.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if it does not exist.
    pub fn delete(&self, id: &SuspicionId) -> Result<()> {
        if self.backend.delete(id)? {
            Ok(())
        } else {
            Err(Error::not_found("suspicion", id.as_str()))
        }
    }

    /// Deletes every suspicion referencing `customer_id`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn delete_for_customer(&self, customer_id: &CustomerId) -> Result<Vec<SuspiciousIdentity>> {
        self.backend.delete_by_customer(customer_id)
    }

    /// Declares two identities as distinct.
    ///
    /// Deletes the suspicions linking them and emits `EXCLUDED` for both.
    /// Returns the number of deleted suspicions.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if both ids are the same.
    /// - [`Error::Conflict`] if the pair is already excluded.
    #[instrument(
        name = "identity_dedup.suspicion.exclude",
        skip(self, author, metadata),
        fields(customer_id = %first, excluded_customer_id = %second)
    )]
    pub fn exclude(
        &self,
        first: &CustomerId,
        second: &CustomerId,
        author: &RequestAuthor,
        metadata: &BTreeMap<String, String>,
    ) -> Result<usize> {
        if first == second {
            return Err(Error::InvalidInput(
                "an identity cannot be excluded from itself".to_string(),
            ));
        }
        let (low, high) = Exclusion::ordered(first, second);
        let exclusion = Exclusion {
            first: low,
            second: high,
            author: author.clone(),
            date: Utc::now(),
        };
        if !self.backend.insert_exclusion(&exclusion)? {
            return Err(Error::Conflict(format!(
                "{first} and {second} are already excluded"
            )));
        }
        let removed = self.backend.delete_linking(first, second)?;

        for (subject, other) in [(first, second), (second, first)] {
            self.events.publish(IdentityChangeEvent::Excluded {
                meta: EventMeta::new(EVENT_SOURCE),
                customer_id: subject.clone(),
                excluded_customer_id: other.clone(),
                author: author.clone(),
                client_code: self.settings.client_code.clone(),
                metadata: metadata.clone(),
            });
        }
        Ok(removed)
    }

    /// Withdraws an exclusion and emits `EXCLUSION_CANCELLED` for both ids.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the pair was not excluded.
    pub fn cancel_exclusion(
        &self,
        first: &CustomerId,
        second: &CustomerId,
        author: &RequestAuthor,
        metadata: &BTreeMap<String, String>,
    ) -> Result<()> {
        if !self.backend.delete_exclusion(first, second)? {
            return Err(Error::not_found("exclusion", format!("{first}/{second}")));
        }
        for (subject, other) in [(first, second), (second, first)] {
            self.events.publish(IdentityChangeEvent::ExclusionCancelled {
                meta: EventMeta::new(EVENT_SOURCE),
                customer_id: subject.clone(),
                excluded_customer_id: other.clone(),
                author: author.clone(),
                client_code: self.settings.client_code.clone(),
                metadata: metadata.clone(),
            });
        }
        Ok(())
    }

    /// Returns true if the pair is excluded.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn is_excluded(&self, first: &CustomerId, second: &CustomerId) -> Result<bool> {
        self.backend.is_excluded(first, second)
    }

    /// Returns a zero-based page of the suspicions of a rule.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if `page_size` is 0.
    /// - [`Error::Conflict`] if `page` is past the last page.
    pub fn page(&self, rule_code: &str, page: usize, page_size: usize) -> Result<SuspicionPage> {
        if page_size == 0 {
            return Err(Error::InvalidInput("page size must be positive".to_string()));
        }
        let total = self.backend.count_by_rule(rule_code)?;
        let offset = page.saturating_mul(page_size);
        if page > 0 && offset >= total {
            return Err(Error::Conflict(format!(
                "page {page} is out of range ({total} suspicions)"
            )));
        }
        Ok(SuspicionPage {
            items: self.backend.find_by_rule(rule_code, offset, page_size)?,
            page,
            page_size,
            total,
        })
    }
}

/// Scoped suspicion lock.
///
/// The lock is released by [`Self::release`] or, on any other path
/// (early return, `?`, panic unwinding), when the guard is dropped.
pub struct SuspicionLockGuard<'a> {
    service: &'a SuspicionService,
    id: SuspicionId,
    author: RequestAuthor,
    released: bool,
}

impl SuspicionLockGuard<'_> {
    /// Id of the locked suspicion.
    #[must_use]
    pub const fn id(&self) -> &SuspicionId {
        &self.id
    }

    /// Releases the lock, reporting failures.
    ///
    /// # Errors
    ///
    /// Returns the unlock error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.service.unlock(&self.id, &self.author)
    }
}

impl Drop for SuspicionLockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.service.unlock(&self.id, &self.author) {
            warn!(suspicion_id = %self.id, error = %e, "Failed to release suspicion lock");
        }
    }
}
