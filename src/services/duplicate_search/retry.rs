//! Bounded-retry wrapper around the duplicate search gateway.

use super::DuplicateSearchGateway;
use crate::config::SearchConfig;
use crate::models::{
    DuplicateSearchOutcome, DuplicateSearchRequest, QualifiedIdentitySearchResult,
};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay multiplied by the backoff factor after each attempt.
    Exponential,
}

/// Retry policy for provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total number of attempts, first call included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub delay: Duration,
    /// How the delay grows.
    pub backoff: Backoff,
    /// Multiplier for [`Backoff::Exponential`].
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(1000),
            backoff: Backoff::Fixed,
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy with a fixed delay between attempts.
    #[must_use]
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            ..Self::default()
        }
    }

    /// Builds the policy from the `[search]` settings.
    #[must_use]
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            max_attempts: config.max_retry.max(1),
            delay: Duration::from_millis(config.tempo_retry_ms),
            backoff: config.backoff,
            backoff_factor: config.backoff_factor.max(1.0),
        }
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, backoff: Backoff, factor: f64) -> Self {
        self.backoff = backoff;
        self.backoff_factor = factor;
        self
    }

    /// Delay to wait after the given failed attempt (1-based).
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.delay,
            Backoff::Exponential => {
                let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
                self.delay
                    .mul_f64(self.backoff_factor.powi(exponent).min(1_000.0))
            },
        }
    }
}

/// Duplicate search with bounded retries and a tagged outcome.
///
/// Only [`Error::ProviderUnavailable`] is retried. A gateway `NotFound`
/// becomes [`DuplicateSearchOutcome::Empty`], and exhausted retries become
/// [`DuplicateSearchOutcome::Unavailable`], which callers must treat as
/// "skip and try later".
#[derive(Clone)]
pub struct ResilientDuplicateSearch {
    gateway: DuplicateSearchGateway,
    policy: RetryPolicy,
}

impl ResilientDuplicateSearch {
    /// Wraps `gateway` with `policy`.
    #[must_use]
    pub const fn new(gateway: DuplicateSearchGateway, policy: RetryPolicy) -> Self {
        Self { gateway, policy }
    }

    /// Returns the retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs the search.
    ///
    /// # Errors
    ///
    /// Returns non-retryable gateway errors such as [`Error::InvalidInput`].
    pub fn search(&self, request: &DuplicateSearchRequest) -> Result<DuplicateSearchOutcome> {
        let provider = self.gateway.provider_name();
        let max_attempts = self.policy.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.gateway.find_duplicates(request) {
                Ok(results) => {
                    if results.values().all(QualifiedIdentitySearchResult::is_empty) {
                        return Ok(DuplicateSearchOutcome::Empty);
                    }
                    return Ok(DuplicateSearchOutcome::Found(results));
                },
                Err(Error::NotFound { .. }) => return Ok(DuplicateSearchOutcome::Empty),
                Err(e) if e.is_retryable() => {
                    warn!(
                        provider,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Duplicate search provider unavailable"
                    );
                    if attempt < max_attempts {
                        metrics::counter!("dedup_search_retries_total", "provider" => provider)
                            .increment(1);
                        let delay = self.policy.delay_after(attempt);
                        if !delay.is_zero() {
                            std::thread::sleep(delay);
                        }
                    }
                },
                Err(e) => return Err(e),
            }
        }

        metrics::counter!("dedup_provider_unavailable_total", "provider" => provider).increment(1);
        Ok(DuplicateSearchOutcome::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CustomerId, DuplicateRule, Identity, RuleResults};
    use crate::services::DuplicateSearchProvider;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `ProviderUnavailable` for the first `failures` calls.
    struct FlakyProvider {
        failures: u32,
        calls: AtomicU32,
        found: bool,
    }

    impl DuplicateSearchProvider for FlakyProvider {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn find_duplicates(
            &self,
            _attributes: &BTreeMap<String, String>,
            _subject: Option<&CustomerId>,
            rules: &[DuplicateRule],
            _attribute_filter: &[String],
        ) -> Result<RuleResults> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::ProviderUnavailable {
                    provider: "flaky".to_string(),
                    cause: "connection reset".to_string(),
                });
            }
            let mut results = RuleResults::new();
            if self.found {
                results.insert(
                    rules[0].code.clone(),
                    QualifiedIdentitySearchResult::new(vec![Identity::new("B")]),
                );
            }
            Ok(results)
        }
    }

    fn search(failures: u32, found: bool) -> (ResilientDuplicateSearch, Arc<FlakyProvider>) {
        let provider = Arc::new(FlakyProvider {
            failures,
            calls: AtomicU32::new(0),
            found,
        });
        let gateway = DuplicateSearchGateway::new(provider.clone());
        (
            ResilientDuplicateSearch::new(gateway, RetryPolicy::fixed(3, Duration::ZERO)),
            provider,
        )
    }

    fn request() -> DuplicateSearchRequest {
        DuplicateSearchRequest::for_identity(
            &Identity::new("A").with_attribute("email", "a@x", 100),
            vec![DuplicateRule::new("R1", 1, &["email"])],
        )
    }

    #[test]
    fn test_recovers_within_bound() {
        let (search, provider) = search(2, true);
        let outcome = search.search(&request()).expect("search");
        assert!(matches!(outcome, DuplicateSearchOutcome::Found(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_exhausted_retries_are_unavailable_not_empty() {
        let (search, provider) = search(10, true);
        let outcome = search.search(&request()).expect("search");
        assert_eq!(outcome, DuplicateSearchOutcome::Unavailable);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_valid_empty_result_is_not_retried() {
        let (search, provider) = search(0, false);
        let outcome = search.search(&request()).expect("search");
        assert_eq!(outcome, DuplicateSearchOutcome::Empty);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_exponential_delay_grows() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(100))
            .with_backoff(Backoff::Exponential, 2.0);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));

        let fixed = RetryPolicy::fixed(5, Duration::from_millis(100));
        assert_eq!(fixed.delay_after(3), Duration::from_millis(100));
    }
}
