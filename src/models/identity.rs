//! Identity records as seen by the deduplication pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Customer identifier of an identity.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CustomerId(String);

impl CustomerId {
    /// Creates a new customer ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CustomerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for CustomerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CustomerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single attribute value carried by an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityAttribute {
    /// Attribute value.
    pub value: String,
    /// Certification level of the value (higher is more trusted).
    #[serde(default)]
    pub certification_level: u32,
    /// Code of the process that certified the value.
    #[serde(default)]
    pub certifier: Option<String>,
}

impl IdentityAttribute {
    /// Creates an attribute value with the given certification level.
    #[must_use]
    pub fn new(value: impl Into<String>, certification_level: u32) -> Self {
        Self {
            value: value.into(),
            certification_level,
            certifier: None,
        }
    }

    /// Sets the certifier code.
    #[must_use]
    pub fn with_certifier(mut self, certifier: impl Into<String>) -> Self {
        self.certifier = Some(certifier.into());
        self
    }
}

/// An identity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Customer identifier.
    pub customer_id: CustomerId,
    /// External account link; an identity with one is *connected*.
    #[serde(default)]
    pub connection_id: Option<String>,
    /// Quality score used to rank identities when choosing a merge primary.
    #[serde(default)]
    pub quality: f64,
    /// Attributes keyed by attribute key.
    #[serde(default)]
    pub attributes: BTreeMap<String, IdentityAttribute>,
    /// Set when this identity was absorbed by a merge.
    #[serde(default)]
    pub merged_into: Option<CustomerId>,
    /// Last modification date.
    #[serde(default = "Utc::now")]
    pub last_update_date: DateTime<Utc>,
}

impl Identity {
    /// Creates an unconnected identity without attributes.
    #[must_use]
    pub fn new(customer_id: impl Into<CustomerId>) -> Self {
        Self {
            customer_id: customer_id.into(),
            connection_id: None,
            quality: 0.0,
            attributes: BTreeMap::new(),
            merged_into: None,
            last_update_date: Utc::now(),
        }
    }

    /// Adds or replaces an attribute.
    #[must_use]
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<String>,
        certification_level: u32,
    ) -> Self {
        self.attributes.insert(
            key.into(),
            IdentityAttribute::new(value, certification_level),
        );
        self
    }

    /// Marks the identity as connected to an external account.
    #[must_use]
    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    /// Sets the quality score.
    #[must_use]
    pub const fn with_quality(mut self, quality: f64) -> Self {
        self.quality = quality;
        self
    }

    /// Returns true if the identity has an active external account link.
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        self.connection_id.is_some()
    }

    /// Returns true if the identity was merged into another one.
    #[must_use]
    pub const fn is_merged(&self) -> bool {
        self.merged_into.is_some()
    }

    /// Returns true if every key has a non-blank value on this identity.
    #[must_use]
    pub fn has_all_attributes(&self, keys: &[String]) -> bool {
        keys.iter().all(|key| {
            self.attributes
                .get(key)
                .is_some_and(|attr| !attr.value.trim().is_empty())
        })
    }

    /// Returns the non-blank values of the requested keys.
    ///
    /// An empty key list selects every attribute.
    #[must_use]
    pub fn attribute_values(&self, keys: &[String]) -> BTreeMap<String, String> {
        self.attributes
            .iter()
            .filter(|(key, _)| keys.is_empty() || keys.contains(key))
            .filter(|(_, attr)| !attr.value.trim().is_empty())
            .map(|(key, attr)| (key.clone(), attr.value.clone()))
            .collect()
    }

    /// Returns a copy restricted to the given attribute keys.
    ///
    /// An empty filter keeps every attribute.
    #[must_use]
    pub fn filtered(&self, filter: &[String]) -> Self {
        if filter.is_empty() {
            return self.clone();
        }
        let mut copy = self.clone();
        copy.attributes.retain(|key, _| filter.contains(key));
        copy
    }

    /// Lowest certification level among the pivot attributes.
    ///
    /// A missing pivot attribute counts as level 0.
    #[must_use]
    pub fn lowest_pivot_certification(&self, pivot_keys: &[String]) -> u32 {
        pivot_keys
            .iter()
            .map(|key| {
                self.attributes
                    .get(key)
                    .map_or(0, |attr| attr.certification_level)
            })
            .min()
            .unwrap_or(0)
    }
}

/// Request to absorb `secondary` into `primary`.
#[derive(Debug, Clone)]
pub struct MergeRequest {
    /// Identity that survives the merge.
    pub primary: CustomerId,
    /// Identity that is absorbed.
    pub secondary: CustomerId,
    /// Attributes to copy onto the primary, keyed by attribute key.
    pub attribute_overrides: BTreeMap<String, IdentityAttribute>,
    /// Rule that justified the merge.
    pub rule_code: String,
    /// Who performs the merge.
    pub author: super::RequestAuthor,
    /// Client application code.
    pub client_code: String,
}

/// Outcome of applying one attribute during a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeChangeStatus {
    /// The attribute did not exist on the primary and was created.
    Created,
    /// The attribute was replaced on the primary.
    Updated,
    /// The primary already held an equal or better value.
    NotUpdated,
    /// The attribute could not be applied.
    Failed,
}

impl AttributeChangeStatus {
    /// Returns true if the change was applied.
    #[must_use]
    pub const fn is_applied(self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// Per-attribute status reported by the identity store after a merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeMergeStatus {
    /// Attribute key.
    pub key: String,
    /// What happened to it.
    pub status: AttributeChangeStatus,
}

/// Overall merge status. Informational only, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStatus {
    /// Every attribute change applied cleanly.
    Success,
    /// At least one attribute change did not apply.
    PartialSuccess,
}

impl MergeStatus {
    /// Returns the status name used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
        }
    }
}

/// Result of a merge as returned by the identity store.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    /// The primary identity after the merge.
    pub identity: Identity,
    /// Per-attribute statuses.
    pub statuses: Vec<AttributeMergeStatus>,
}

impl MergeOutcome {
    /// Derives the overall status from the per-attribute statuses.
    #[must_use]
    pub fn status(&self) -> MergeStatus {
        if self.statuses.iter().all(|s| s.status.is_applied()) {
            MergeStatus::Success
        } else {
            MergeStatus::PartialSuccess
        }
    }
}
