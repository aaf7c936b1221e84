//! Suspicions of duplication and their advisory lock.

use super::CustomerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use uuid::Uuid;

/// Metadata key recording the rule that produced a suspicion.
pub const METADATA_RULE_CODE: &str = "rule_code";

/// Unique identifier for a suspicion.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SuspicionId(String);

impl SuspicionId {
    /// Creates a suspicion ID from an existing value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh random ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SuspicionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of author behind a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorType {
    /// The identity owner.
    Owner,
    /// A front office agent.
    Agent,
    /// A back office administrator.
    Admin,
    /// An application, such as one of the daemons.
    Application,
}

impl AuthorType {
    /// Returns the stored name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Agent => "agent",
            Self::Admin => "admin",
            Self::Application => "application",
        }
    }

    /// Parses a type name (case-insensitive).
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "owner" => Some(Self::Owner),
            "agent" => Some(Self::Agent),
            "admin" => Some(Self::Admin),
            "application" => Some(Self::Application),
            _ => None,
        }
    }
}

/// Author of a mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestAuthor {
    /// Author name.
    pub name: String,
    /// Author type.
    pub author_type: AuthorType,
}

impl RequestAuthor {
    /// Creates an author.
    #[must_use]
    pub fn new(name: impl Into<String>, author_type: AuthorType) -> Self {
        Self {
            name: name.into(),
            author_type,
        }
    }

    /// Creates an application author, as used by the daemons.
    #[must_use]
    pub fn application(name: impl Into<String>) -> Self {
        Self::new(name, AuthorType::Application)
    }
}

impl fmt::Display for RequestAuthor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.author_type.as_str(), self.name)
    }
}

/// Advisory lock carried by a suspicion.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SuspicionLock {
    /// Lock flag.
    pub locked: bool,
    /// When the lock lapses.
    pub lock_end_date: Option<DateTime<Utc>>,
    /// Holder name.
    pub author_name: Option<String>,
    /// Holder type.
    pub author_type: Option<AuthorType>,
}

impl SuspicionLock {
    /// Returns true if the lock is set and not yet expired at `now`.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.locked && self.lock_end_date.is_none_or(|end| end > now)
    }

    /// Returns true if `author` holds the lock.
    #[must_use]
    pub fn is_held_by(&self, author: &RequestAuthor) -> bool {
        self.author_name.as_deref() == Some(author.name.as_str())
            && self.author_type == Some(author.author_type)
    }

    /// Returns true if an active lock is held by someone other than `author`.
    #[must_use]
    pub fn is_held_by_other(&self, author: &RequestAuthor, now: DateTime<Utc>) -> bool {
        self.is_active(now) && !self.is_held_by(author)
    }
}

/// A stored suspicion of duplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspiciousIdentity {
    /// Suspicion identifier.
    pub id: SuspicionId,
    /// Subject of the suspicion.
    pub customer_id: CustomerId,
    /// The paired identity, absent in the legacy unpaired form.
    pub duplicate_customer_id: Option<CustomerId>,
    /// Every identity covered by the suspicion, subject included.
    pub members: BTreeSet<CustomerId>,
    /// Code of the rule that raised the suspicion.
    pub rule_code: String,
    /// Creation date.
    pub creation_date: DateTime<Utc>,
    /// Last modification date.
    pub last_update_date: DateTime<Utc>,
    /// Provenance metadata.
    pub metadata: BTreeMap<String, String>,
    /// Advisory lock.
    pub lock: SuspicionLock,
}

impl SuspiciousIdentity {
    /// Returns true if `customer_id` is covered by this suspicion.
    #[must_use]
    pub fn involves(&self, customer_id: &CustomerId) -> bool {
        self.members.contains(customer_id)
    }

    /// Returns the members other than the subject.
    pub fn others(&self) -> impl Iterator<Item = &CustomerId> {
        self.members.iter().filter(|id| **id != self.customer_id)
    }
}

/// Data for a suspicion to be created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSuspicion {
    /// Subject of the suspicion.
    pub customer_id: CustomerId,
    /// Paired identity.
    pub duplicate_customer_id: Option<CustomerId>,
    /// Members, subject included.
    pub members: BTreeSet<CustomerId>,
    /// Rule code.
    pub rule_code: String,
    /// Provenance metadata.
    pub metadata: BTreeMap<String, String>,
}

impl NewSuspicion {
    /// A suspicion pairing `customer_id` with one duplicate.
    #[must_use]
    pub fn paired(
        customer_id: CustomerId,
        duplicate_customer_id: CustomerId,
        rule_code: impl Into<String>,
    ) -> Self {
        let members = [customer_id.clone(), duplicate_customer_id.clone()]
            .into_iter()
            .collect();
        Self::build(customer_id, Some(duplicate_customer_id), members, rule_code)
    }

    /// A suspicion covering a whole group of duplicates.
    ///
    /// The first candidate becomes the paired identity.
    #[must_use]
    pub fn group(
        customer_id: CustomerId,
        candidates: &[CustomerId],
        rule_code: impl Into<String>,
    ) -> Self {
        let mut members: BTreeSet<CustomerId> = candidates.iter().cloned().collect();
        members.insert(customer_id.clone());
        let duplicate = candidates.first().cloned();
        Self::build(customer_id, duplicate, members, rule_code)
    }

    fn build(
        customer_id: CustomerId,
        duplicate_customer_id: Option<CustomerId>,
        members: BTreeSet<CustomerId>,
        rule_code: impl Into<String>,
    ) -> Self {
        let rule_code = rule_code.into();
        let mut metadata = BTreeMap::new();
        metadata.insert(METADATA_RULE_CODE.to_string(), rule_code.clone());
        Self {
            customer_id,
            duplicate_customer_id,
            members,
            rule_code,
            metadata,
        }
    }

    /// Adds provenance metadata.
    #[must_use]
    pub fn with_metadata(mut self, metadata: &BTreeMap<String, String>) -> Self {
        self.metadata
            .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Materializes the suspicion with a fresh id.
    #[must_use]
    pub fn into_suspicion(self, now: DateTime<Utc>) -> SuspiciousIdentity {
        SuspiciousIdentity {
            id: SuspicionId::generate(),
            customer_id: self.customer_id,
            duplicate_customer_id: self.duplicate_customer_id,
            members: self.members,
            rule_code: self.rule_code,
            creation_date: now,
            last_update_date: now,
            metadata: self.metadata,
            lock: SuspicionLock::default(),
        }
    }
}

/// A declaration that two identities are not duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exclusion {
    /// Lower of the two customer ids.
    pub first: CustomerId,
    /// Higher of the two customer ids.
    pub second: CustomerId,
    /// Who declared the exclusion.
    pub author: RequestAuthor,
    /// When it was declared.
    pub date: DateTime<Utc>,
}

impl Exclusion {
    /// Orders a pair so that `(a, b)` and `(b, a)` are stored identically.
    #[must_use]
    pub fn ordered(a: &CustomerId, b: &CustomerId) -> (CustomerId, CustomerId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }
}

/// A page of suspicions.
#[derive(Debug, Clone)]
pub struct SuspicionPage {
    /// Suspicions on this page.
    pub items: Vec<SuspiciousIdentity>,
    /// Zero-based page index.
    pub page: usize,
    /// Page size.
    pub page_size: usize,
    /// Total number of suspicions across pages.
    pub total: usize,
}
