//! Merge eligibility rules.

use crate::models::{Identity, IdentityAttribute};
use std::collections::BTreeMap;
use std::fmt;

/// Why a candidate cannot be merged into a primary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeRejection {
    /// The candidate has an external account link and cannot be absorbed.
    CandidateConnected,
    /// The connected primary's weakest pivot attribute is under the minimum.
    PrimaryCertificationTooLow {
        /// Lowest pivot certification of the primary.
        lowest: u32,
        /// Required minimum.
        required: u32,
    },
    /// Both identities hold different values for the same attribute.
    AttributeConflict {
        /// Conflicting attribute key.
        key: String,
    },
    /// An operator declared the pair distinct.
    Excluded,
}

impl MergeRejection {
    /// Short reason used in logs and metrics.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::CandidateConnected => "candidate_connected",
            Self::PrimaryCertificationTooLow { .. } => "certification_too_low",
            Self::AttributeConflict { .. } => "attribute_conflict",
            Self::Excluded => "excluded",
        }
    }
}

impl fmt::Display for MergeRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CandidateConnected => write!(f, "candidate is connected"),
            Self::PrimaryCertificationTooLow { lowest, required } => write!(
                f,
                "primary pivot certification {lowest} is below {required}"
            ),
            Self::AttributeConflict { key } => write!(f, "conflicting values for '{key}'"),
            Self::Excluded => write!(f, "pair is excluded"),
        }
    }
}

fn normalized(attribute: &IdentityAttribute) -> Option<String> {
    let value = attribute.value.trim();
    (!value.is_empty()).then(|| value.to_lowercase())
}

/// Returns the first attribute key both identities hold with different
/// values, compared case-insensitively. Blank values count as absent.
#[must_use]
pub fn first_conflict(a: &Identity, b: &Identity) -> Option<String> {
    a.attributes.iter().find_map(|(key, left)| {
        let right = b.attributes.get(key)?;
        match (normalized(left), normalized(right)) {
            (Some(l), Some(r)) if l != r => Some(key.clone()),
            _ => None,
        }
    })
}

/// Returns true if no shared attribute carries conflicting values.
#[must_use]
pub fn is_strict_duplicate(a: &Identity, b: &Identity) -> bool {
    first_conflict(a, b).is_none()
}

/// Checks whether `candidate` may be absorbed into `primary`.
///
/// # Errors
///
/// Returns the first rule the pair breaks, checked in this order: connected
/// candidate, insufficient pivot certification of a connected primary,
/// conflicting attribute.
pub fn can_merge(
    primary: &Identity,
    candidate: &Identity,
    min_pivot_certification: u32,
    pivot_attributes: &[String],
) -> Result<(), MergeRejection> {
    if candidate.is_connected() {
        return Err(MergeRejection::CandidateConnected);
    }
    if primary.is_connected() {
        let lowest = primary.lowest_pivot_certification(pivot_attributes);
        if lowest < min_pivot_certification {
            return Err(MergeRejection::PrimaryCertificationTooLow {
                lowest,
                required: min_pivot_certification,
            });
        }
    }
    match first_conflict(primary, candidate) {
        Some(key) => Err(MergeRejection::AttributeConflict { key }),
        None => Ok(()),
    }
}

/// Attributes of `candidate` worth carrying over to `primary`: those the
/// primary lacks, and those the candidate certifies strictly higher.
#[must_use]
pub fn attribute_deltas(
    primary: &Identity,
    candidate: &Identity,
) -> BTreeMap<String, IdentityAttribute> {
    candidate
        .attributes
        .iter()
        .filter(|(_, attribute)| !attribute.value.trim().is_empty())
        .filter(|(key, attribute)| {
            primary.attributes.get(*key).is_none_or(|existing| {
                existing.value.trim().is_empty()
                    || attribute.certification_level > existing.certification_level
            })
        })
        .map(|(key, attribute)| (key.clone(), attribute.clone()))
        .collect()
}

/// Orders merge candidates: connected first, then by quality descending.
///
/// Ties are broken on customer id so the primary is deterministic.
pub fn rank_for_merge(identities: &mut [Identity]) {
    identities.sort_by(|a, b| {
        b.is_connected()
            .cmp(&a.is_connected())
            .then_with(|| b.quality.total_cmp(&a.quality))
            .then_with(|| a.customer_id.cmp(&b.customer_id))
    });
}
