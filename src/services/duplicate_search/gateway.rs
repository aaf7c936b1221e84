//! Non-retrying client over the duplicate search provider.

use crate::models::{
    CustomerId, DuplicateRule, DuplicateSearchRequest, QualifiedIdentitySearchResult, RuleResults,
};
use crate::{Error, Result};
use std::collections::BTreeMap;
use std::sync::Arc;

/// External match-finding capability.
///
/// Implementations signal a transient fault with
/// [`Error::ProviderUnavailable`]; any other error is treated as permanent.
pub trait DuplicateSearchProvider: Send + Sync {
    /// Provider name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Returns candidate duplicates, keyed by rule code.
    ///
    /// Rules without candidates may be omitted from the map.
    fn find_duplicates(
        &self,
        attributes: &BTreeMap<String, String>,
        subject: Option<&CustomerId>,
        rules: &[DuplicateRule],
        attribute_filter: &[String],
    ) -> Result<RuleResults>;
}

/// Validating client over a [`DuplicateSearchProvider`].
///
/// Performs no retry; see [`super::ResilientDuplicateSearch`].
#[derive(Clone)]
pub struct DuplicateSearchGateway {
    provider: Arc<dyn DuplicateSearchProvider>,
}

impl DuplicateSearchGateway {
    /// Creates a gateway over `provider`.
    #[must_use]
    pub fn new(provider: Arc<dyn DuplicateSearchProvider>) -> Self {
        Self { provider }
    }

    /// Name of the underlying provider.
    #[must_use]
    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    /// Finds duplicates for the request.
    ///
    /// The result holds exactly one entry per requested rule, each possibly
    /// without candidate. The subject never appears among its own candidates.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidInput`] if the request has no rule.
    /// - [`Error::NotFound`] if `allow_empty` is false and no rule yields a
    ///   candidate.
    /// - Whatever the provider returns, including
    ///   [`Error::ProviderUnavailable`] for transient faults.
    pub fn find_duplicates(&self, request: &DuplicateSearchRequest) -> Result<RuleResults> {
        if request.rules.is_empty() {
            return Err(Error::InvalidInput(
                "duplicate search requires at least one rule".to_string(),
            ));
        }

        let attributes: BTreeMap<String, String> = request
            .attributes
            .iter()
            .filter(|(_, value)| !value.trim().is_empty())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        let mut found = self.provider.find_duplicates(
            &attributes,
            request.subject.as_ref(),
            &request.rules,
            &request.attribute_filter,
        )?;

        let mut results = RuleResults::new();
        for rule in &request.rules {
            let mut entry = found.remove(&rule.code).unwrap_or_default();
            entry.identities = entry.distinct_candidates(request.subject.as_ref());
            results.insert(rule.code.clone(), entry);
        }

        if !request.allow_empty && results.values().all(QualifiedIdentitySearchResult::is_empty) {
            let subject = request
                .subject
                .as_ref()
                .map_or_else(|| "<anonymous>".to_string(), ToString::to_string);
            return Err(Error::not_found("duplicates", subject));
        }

        Ok(results)
    }
}
