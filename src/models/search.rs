//! Duplicate search requests and results.

use super::{CustomerId, DuplicateRule, Identity};
use std::collections::{BTreeMap, BTreeSet};

/// Candidates returned for one rule, plus provider metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualifiedIdentitySearchResult {
    /// Candidate identities, in provider order.
    pub identities: Vec<Identity>,
    /// Provider metadata, propagated into created suspicions.
    pub metadata: BTreeMap<String, String>,
}

impl QualifiedIdentitySearchResult {
    /// Creates a result from candidates.
    #[must_use]
    pub const fn new(identities: Vec<Identity>) -> Self {
        Self {
            identities,
            metadata: BTreeMap::new(),
        }
    }

    /// Returns true if there is no candidate.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    /// Returns the candidates without duplicates and without `subject`.
    ///
    /// Provider order is preserved; the first occurrence wins.
    #[must_use]
    pub fn distinct_candidates(&self, subject: Option<&CustomerId>) -> Vec<Identity> {
        let mut seen = BTreeSet::new();
        self.identities
            .iter()
            .filter(|identity| Some(&identity.customer_id) != subject)
            .filter(|identity| seen.insert(identity.customer_id.clone()))
            .cloned()
            .collect()
    }
}

/// Results keyed by rule code.
pub type RuleResults = BTreeMap<String, QualifiedIdentitySearchResult>;

/// Outcome of a duplicate search after retries.
///
/// Keeps "no match" distinct from "could not ask".
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateSearchOutcome {
    /// At least one rule returned a candidate.
    Found(RuleResults),
    /// Every rule answered with no candidate.
    Empty,
    /// The provider stayed unavailable after every retry.
    Unavailable,
}

impl DuplicateSearchOutcome {
    /// Returns the candidates of one rule, if any were found.
    #[must_use]
    pub fn for_rule(&self, rule_code: &str) -> Option<&QualifiedIdentitySearchResult> {
        match self {
            Self::Found(results) => results.get(rule_code),
            Self::Empty | Self::Unavailable => None,
        }
    }

    /// Returns true if the provider could not be reached.
    #[must_use]
    pub const fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable)
    }
}

/// Parameters of a duplicate search.
#[derive(Debug, Clone)]
pub struct DuplicateSearchRequest {
    /// Attribute values to match on (blank values are dropped by the gateway).
    pub attributes: BTreeMap<String, String>,
    /// Identity the search is about; excluded from its own results.
    pub subject: Option<CustomerId>,
    /// Rules to evaluate.
    pub rules: Vec<DuplicateRule>,
    /// Attribute keys to return on candidates; empty returns all.
    pub attribute_filter: Vec<String>,
    /// Whether an all-empty answer is acceptable.
    pub allow_empty: bool,
}

impl DuplicateSearchRequest {
    /// Builds a request for `identity` using the attributes checked by `rules`.
    #[must_use]
    pub fn for_identity(identity: &Identity, rules: Vec<DuplicateRule>) -> Self {
        let keys: Vec<String> = rules
            .iter()
            .flat_map(|rule| rule.checked_attributes.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self {
            attributes: identity.attribute_values(&keys),
            subject: Some(identity.customer_id.clone()),
            rules,
            attribute_filter: Vec::new(),
            allow_empty: false,
        }
    }

    /// Accepts an all-empty answer instead of failing with `NotFound`.
    #[must_use]
    pub const fn allow_empty(mut self, allow_empty: bool) -> Self {
        self.allow_empty = allow_empty;
        self
    }

    /// Restricts the attributes returned on candidates.
    #[must_use]
    pub fn with_attribute_filter(mut self, filter: Vec<String>) -> Self {
        self.attribute_filter = filter;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distinct_candidates_drops_subject_and_repeats() {
        let result = QualifiedIdentitySearchResult::new(vec![
            Identity::new("B"),
            Identity::new("A"),
            Identity::new("C"),
            Identity::new("B"),
        ]);
        let subject = CustomerId::new("A");
        let ids: Vec<_> = result
            .distinct_candidates(Some(&subject))
            .into_iter()
            .map(|i| i.customer_id)
            .collect();
        assert_eq!(ids, vec![CustomerId::new("B"), CustomerId::new("C")]);
    }

    #[test]
    fn test_request_for_identity_uses_checked_attributes() {
        let identity = Identity::new("A")
            .with_attribute("email", "a@example.com", 100)
            .with_attribute("phone", "0102030405", 100);
        let rule = DuplicateRule::new("R", 1, &["email"]);

        let request = DuplicateSearchRequest::for_identity(&identity, vec![rule]);
        assert_eq!(request.attributes.len(), 1);
        assert_eq!(request.subject, Some(CustomerId::new("A")));
        assert!(!request.allow_empty);
    }

    #[test]
    fn test_outcome_for_rule() {
        let mut results = RuleResults::new();
        results.insert(
            "R".to_string(),
            QualifiedIdentitySearchResult::new(vec![Identity::new("B")]),
        );
        let outcome = DuplicateSearchOutcome::Found(results);
        assert!(outcome.for_rule("R").is_some());
        assert!(outcome.for_rule("other").is_none());
        assert!(DuplicateSearchOutcome::Empty.for_rule("R").is_none());
        assert!(DuplicateSearchOutcome::Unavailable.is_unavailable());
    }
}
