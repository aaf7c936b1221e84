//! Reference provider matching on exact attribute values.

use super::DuplicateSearchProvider;
use crate::Result;
use crate::models::{
    CustomerId, DuplicateRule, Identity, QualifiedIdentitySearchResult, RuleResults,
};
use crate::storage::IdentityStore;
use std::collections::BTreeMap;
use std::sync::Arc;

const PAGE_SIZE: usize = 500;

/// Metadata key carrying the name of the matching provider.
pub const METADATA_PROVIDER: &str = "provider";

/// Finds identities whose values for every checked attribute of a rule are
/// equal to the searched ones, ignoring case and surrounding whitespace.
///
/// A rule whose checked attributes are not all present in the search yields
/// no candidate. Merged identities are never returned.
pub struct ExactAttributeMatcher {
    identities: Arc<dyn IdentityStore>,
}

impl ExactAttributeMatcher {
    /// Creates a matcher over `identities`.
    #[must_use]
    pub fn new(identities: Arc<dyn IdentityStore>) -> Self {
        Self { identities }
    }

    fn matches(identity: &Identity, expected: &[(&String, String)]) -> bool {
        expected.iter().all(|(key, value)| {
            identity
                .attributes
                .get(*key)
                .is_some_and(|attr| normalize(&attr.value) == *value)
        })
    }

    fn search_rule(
        &self,
        attributes: &BTreeMap<String, String>,
        subject: Option<&CustomerId>,
        rule: &DuplicateRule,
        attribute_filter: &[String],
    ) -> Result<QualifiedIdentitySearchResult> {
        if rule.checked_attributes.is_empty() {
            return Ok(QualifiedIdentitySearchResult::default());
        }
        let mut expected = Vec::with_capacity(rule.checked_attributes.len());
        for key in &rule.checked_attributes {
            match attributes.get(key) {
                Some(value) if !value.trim().is_empty() => expected.push((key, normalize(value))),
                _ => return Ok(QualifiedIdentitySearchResult::default()),
            }
        }

        let mut matched = Vec::new();
        let mut offset = 0;
        loop {
            let ids = self.identities.find_ids_with_attributes(
                &rule.checked_attributes,
                offset,
                PAGE_SIZE,
            )?;
            if ids.is_empty() {
                break;
            }
            offset += ids.len();
            let page = self
                .identities
                .search_batch(&ids, &rule.checked_attributes)?;
            matched.extend(
                page.iter()
                    .filter(|identity| Some(&identity.customer_id) != subject)
                    .filter(|identity| Self::matches(identity, &expected))
                    .map(|identity| identity.customer_id.clone()),
            );
        }

        let mut result =
            QualifiedIdentitySearchResult::new(self.identities.search_batch(&matched, attribute_filter)?);
        if !result.is_empty() {
            result
                .metadata
                .insert(METADATA_PROVIDER.to_string(), self.name().to_string());
        }
        Ok(result)
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}

impl DuplicateSearchProvider for ExactAttributeMatcher {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn find_duplicates(
        &self,
        attributes: &BTreeMap<String, String>,
        subject: Option<&CustomerId>,
        rules: &[DuplicateRule],
        attribute_filter: &[String],
    ) -> Result<RuleResults> {
        rules
            .iter()
            .map(|rule| {
                self.search_rule(attributes, subject, rule, attribute_filter)
                    .map(|result| (rule.code.clone(), result))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryIdentityStore;

    fn matcher() -> ExactAttributeMatcher {
        let store = InMemoryIdentityStore::with_identities([
            Identity::new("A")
                .with_attribute("email", "Jane@Example.com", 100)
                .with_attribute("family_name", "DOE", 100),
            Identity::new("B")
                .with_attribute("email", " jane@example.com", 100)
                .with_attribute("family_name", "Doe", 100),
            Identity::new("C")
                .with_attribute("email", "jane@example.com", 100)
                .with_attribute("family_name", "SMITH", 100),
        ]);
        ExactAttributeMatcher::new(Arc::new(store))
    }

    fn attributes(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_matches_every_checked_attribute_case_insensitively() {
        let rules = [
            DuplicateRule::new("EMAIL", 1, &["email"]),
            DuplicateRule::new("EMAIL_NAME", 2, &["email", "family_name"]),
        ];
        let results = matcher()
            .find_duplicates(
                &attributes(&[("email", "jane@example.com"), ("family_name", "doe")]),
                Some(&CustomerId::new("A")),
                &rules,
                &[],
            )
            .expect("search");

        let ids = |code: &str| -> Vec<String> {
            results[code]
                .identities
                .iter()
                .map(|i| i.customer_id.to_string())
                .collect()
        };
        assert_eq!(ids("EMAIL"), ["B", "C"]);
        assert_eq!(ids("EMAIL_NAME"), ["B"]);
        assert_eq!(
            results["EMAIL"].metadata.get(METADATA_PROVIDER).map(String::as_str),
            Some("exact")
        );
    }

    #[test]
    fn test_missing_checked_attribute_yields_nothing() {
        let rules = [DuplicateRule::new("EMAIL_NAME", 1, &["email", "family_name"])];
        let results = matcher()
            .find_duplicates(&attributes(&[("email", "jane@example.com")]), None, &rules, &[])
            .expect("search");
        assert!(results["EMAIL_NAME"].is_empty());
    }
}
