//! Automatic merge of strict duplicates.

use super::eligibility::{MergeRejection, attribute_deltas, can_merge, rank_for_merge};
use crate::models::{
    DuplicateRule, DuplicateSearchOutcome, DuplicateSearchRequest, Identity, MergeRequest,
    MergeStatus, RequestAuthor, SuspicionId, SuspiciousIdentity,
};
use crate::services::{ResilientDuplicateSearch, SuspicionService, duration_to_millis, u64_to_f64};
use crate::storage::{IdentityStore, RuleCatalog};
use crate::{Error, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, instrument, warn};

/// Settings for [`ResolutionEngine`].
#[derive(Debug, Clone)]
pub struct ResolutionSettings {
    /// Code of the rule whose suspicions are merged automatically.
    pub strict_rule_code: String,
    /// Minimum pivot certification of a connected primary.
    pub min_pivot_certification: u32,
    /// Attributes that define an identity.
    pub pivot_attributes: Vec<String>,
    /// Suspicions read per page.
    pub batch_size: usize,
    /// Author of locks and merges.
    pub author: RequestAuthor,
    /// Client code sent with merges.
    pub client_code: String,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            strict_rule_code: "STRICT".to_string(),
            min_pivot_certification: 500,
            pivot_attributes: ["family_name", "first_names", "birthdate", "gender"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            batch_size: 100,
            author: RequestAuthor::application("resolution-engine"),
            client_code: "identity-dedup".to_string(),
        }
    }
}

/// Result of a resolution run.
#[derive(Debug, Clone, Default)]
pub struct ResolutionReport {
    /// Suspicions read.
    pub suspicions_examined: usize,
    /// Suspicions locked by another author.
    pub suspicions_locked: usize,
    /// Suspicions deleted because duplicates no longer corroborate.
    pub suspicions_stale: usize,
    /// Suspicions left for later because the provider was unavailable.
    pub suspicions_deferred: usize,
    /// Suspicions deleted after every candidate merged.
    pub suspicions_resolved: usize,
    /// Suspicions whose processing failed.
    pub suspicions_failed: usize,
    /// Identities absorbed.
    pub merges: usize,
    /// Merges where some attribute change did not apply.
    pub partial_merges: usize,
    /// Candidates refused by the eligibility rules.
    pub candidates_rejected: usize,
    /// Duration of the run in milliseconds.
    pub duration_ms: u64,
}

impl ResolutionReport {
    /// Returns a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.suspicions_examined == 0 {
            return format!("No suspicion to resolve ({}ms)", self.duration_ms);
        }
        format!(
            "Examined {} suspicions: {} merges ({} partial), {} rejected, {} resolved, {} stale, {} locked, {} deferred, {} failed in {}ms",
            self.suspicions_examined,
            self.merges,
            self.partial_merges,
            self.candidates_rejected,
            self.suspicions_resolved,
            self.suspicions_stale,
            self.suspicions_locked,
            self.suspicions_deferred,
            self.suspicions_failed,
            self.duration_ms
        )
    }
}

enum SuspicionOutcome {
    Locked,
    Stale,
    Deferred,
    Handled { resolved: bool },
}

/// Merges the strict-rule suspicions that pass the eligibility rules.
pub struct ResolutionEngine {
    rules: Arc<dyn RuleCatalog>,
    identities: Arc<dyn IdentityStore>,
    suspicions: Arc<SuspicionService>,
    search: ResilientDuplicateSearch,
    settings: ResolutionSettings,
}

impl ResolutionEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        rules: Arc<dyn RuleCatalog>,
        identities: Arc<dyn IdentityStore>,
        suspicions: Arc<SuspicionService>,
        search: ResilientDuplicateSearch,
        settings: ResolutionSettings,
    ) -> Self {
        Self {
            rules,
            identities,
            suspicions,
            search,
            settings,
        }
    }

    /// Runs one pass over every suspicion of the strict rule, page by page.
    ///
    /// # Errors
    ///
    /// Returns an error if the strict rule or its suspicions cannot be
    /// loaded. Failures on a single suspicion are logged and counted.
    #[instrument(
        name = "identity_dedup.resolution.run",
        skip(self),
        fields(component = "resolution", rule_code = %self.settings.strict_rule_code)
    )]
    pub fn run(&self) -> Result<ResolutionReport> {
        let start = Instant::now();
        let mut report = ResolutionReport::default();

        let rule = self.rules.get(&self.settings.strict_rule_code)?;
        let batch_size = self.settings.batch_size.max(1);
        let mut seen: HashSet<SuspicionId> = HashSet::new();
        let mut offset = 0;

        // Resolved and stale suspicions are deleted, so the offset only moves
        // past the ones still stored.
        loop {
            let page = self
                .suspicions
                .backend()
                .find_by_rule(&rule.code, offset, batch_size)?;
            let fetched = page.len();
            let mut kept = 0;

            for suspicion in &page {
                if !seen.insert(suspicion.id.clone()) {
                    kept += 1;
                    continue;
                }
                report.suspicions_examined += 1;
                if self.examine(&rule, suspicion, &mut report) {
                    kept += 1;
                }
            }

            if fetched < batch_size {
                break;
            }
            offset += kept;
        }

        report.duration_ms = duration_to_millis(start.elapsed());
        metrics::histogram!("dedup_daemon_run_duration_ms", "daemon" => "resolution")
            .record(u64_to_f64(report.duration_ms));
        info!(
            suspicions_examined = report.suspicions_examined,
            merges = report.merges,
            suspicions_resolved = report.suspicions_resolved,
            duration_ms = report.duration_ms,
            "Resolution completed"
        );
        Ok(report)
    }

    /// Handles one suspicion and returns true if it is still stored.
    fn examine(
        &self,
        rule: &DuplicateRule,
        suspicion: &SuspiciousIdentity,
        report: &mut ResolutionReport,
    ) -> bool {
        let span = info_span!("identity_dedup.resolution.suspicion", suspicion_id = %suspicion.id);
        let _enter = span.enter();
        match self.resolve(rule, suspicion, report) {
            Ok(SuspicionOutcome::Locked) => {
                report.suspicions_locked += 1;
                true
            },
            Ok(SuspicionOutcome::Stale) => {
                report.suspicions_stale += 1;
                false
            },
            Ok(SuspicionOutcome::Deferred) => {
                report.suspicions_deferred += 1;
                true
            },
            Ok(SuspicionOutcome::Handled { resolved }) => {
                if resolved {
                    report.suspicions_resolved += 1;
                }
                !resolved
            },
            Err(e) => {
                report.suspicions_failed += 1;
                warn!(
                    customer_id = %suspicion.customer_id,
                    error = %e,
                    "Failed to resolve suspicion"
                );
                true
            },
        }
    }

    fn resolve(
        &self,
        rule: &DuplicateRule,
        suspicion: &SuspiciousIdentity,
        report: &mut ResolutionReport,
    ) -> Result<SuspicionOutcome> {
        if suspicion
            .lock
            .is_held_by_other(&self.settings.author, Utc::now())
        {
            return Ok(SuspicionOutcome::Locked);
        }

        let Some(mut group) = self.live_group(rule, suspicion)? else {
            return Ok(SuspicionOutcome::Deferred);
        };
        if group.len() < 2 {
            debug!("Duplicates no longer corroborate, deleting suspicion");
            self.suspicions.delete(&suspicion.id)?;
            return Ok(SuspicionOutcome::Stale);
        }

        rank_for_merge(&mut group);
        let mut candidates = group.into_iter();
        let Some(mut primary) = candidates.next() else {
            return Ok(SuspicionOutcome::Stale);
        };

        let mut all_merged = true;
        for candidate in candidates {
            let eligibility = if self
                .suspicions
                .is_excluded(&primary.customer_id, &candidate.customer_id)?
            {
                Err(MergeRejection::Excluded)
            } else {
                can_merge(
                    &primary,
                    &candidate,
                    self.settings.min_pivot_certification,
                    &self.settings.pivot_attributes,
                )
            };
            if let Err(rejection) = eligibility {
                all_merged = false;
                report.candidates_rejected += 1;
                metrics::counter!(
                    "dedup_merge_rejections_total",
                    "reason" => rejection.reason()
                )
                .increment(1);
                debug!(
                    primary = %primary.customer_id,
                    candidate = %candidate.customer_id,
                    reason = %rejection,
                    "Candidate not eligible for merge"
                );
                continue;
            }

            let request = MergeRequest {
                primary: primary.customer_id.clone(),
                secondary: candidate.customer_id.clone(),
                attribute_overrides: attribute_deltas(&primary, &candidate),
                rule_code: rule.code.clone(),
                author: self.settings.author.clone(),
                client_code: self.settings.client_code.clone(),
            };

            let guard = self.suspicions.lock_guard(&suspicion.id, &self.settings.author)?;
            let merged = self.identities.merge(&request);
            match guard.release() {
                Ok(()) => {},
                Err(Error::NotFound { .. }) => {
                    debug!("Suspicion deleted while merging");
                },
                Err(e) => return Err(e),
            }
            let outcome = merged?;

            let status = outcome.status();
            metrics::counter!("dedup_merges_total", "status" => status.as_str()).increment(1);
            info!(
                primary = %request.primary,
                secondary = %request.secondary,
                attributes = request.attribute_overrides.len(),
                status = status.as_str(),
                "Identities merged"
            );
            report.merges += 1;
            if status != MergeStatus::Success {
                report.partial_merges += 1;
            }
            primary = outcome.identity;
        }

        if all_merged {
            self.suspicions.backend().delete(&suspicion.id)?;
        }
        Ok(SuspicionOutcome::Handled {
            resolved: all_merged,
        })
    }

    /// Recomputes the duplicates of the suspicion's subject.
    ///
    /// Returns the subject and its live duplicates with every attribute, an
    /// empty group if the subject is gone, or `None` if the provider could
    /// not be reached.
    fn live_group(
        &self,
        rule: &DuplicateRule,
        suspicion: &SuspiciousIdentity,
    ) -> Result<Option<Vec<Identity>>> {
        let subject = match self.identities.find_by_customer_id(&suspicion.customer_id)? {
            Some(identity) if !identity.is_merged() => identity,
            _ => return Ok(Some(Vec::new())),
        };

        let request =
            DuplicateSearchRequest::for_identity(&subject, vec![rule.clone()]).allow_empty(true);
        let candidates = match self.search.search(&request)? {
            DuplicateSearchOutcome::Unavailable => return Ok(None),
            DuplicateSearchOutcome::Empty => Vec::new(),
            DuplicateSearchOutcome::Found(results) => results
                .get(&rule.code)
                .map(|result| result.distinct_candidates(Some(&subject.customer_id)))
                .unwrap_or_default(),
        };
        if candidates.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let ids: Vec<_> = candidates.into_iter().map(|c| c.customer_id).collect();
        let mut group = vec![subject];
        group.extend(
            self.identities
                .search_batch(&ids, &[])?
                .into_iter()
                .filter(|identity| !identity.is_merged()),
        );
        Ok(Some(group))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CustomerId, NewSuspicion};
    use crate::observability::EventBus;
    use crate::services::{
        DuplicateSearchGateway, ExactAttributeMatcher, RetryPolicy, SuspicionSettings,
    };
    use crate::storage::{InMemoryIdentityStore, SqliteRuleCatalog, SqliteSuspicionBackend};

    struct Fixture {
        engine: ResolutionEngine,
        identities: Arc<InMemoryIdentityStore>,
        suspicions: Arc<SuspicionService>,
    }

    fn fixture(identities: Vec<Identity>) -> Fixture {
        fixture_paged(identities, ResolutionSettings::default().batch_size)
    }

    fn fixture_paged(identities: Vec<Identity>, batch_size: usize) -> Fixture {
        let identities = Arc::new(InMemoryIdentityStore::with_identities(identities));
        let catalog = Arc::new(SqliteRuleCatalog::in_memory().expect("catalog"));
        catalog
            .upsert(&DuplicateRule::new("STRICT", 1, &["family_name", "birthdate"]))
            .expect("rule");
        let suspicions = Arc::new(SuspicionService::new(
            Arc::new(SqliteSuspicionBackend::in_memory().expect("backend")),
            EventBus::new(16),
            SuspicionSettings::default(),
        ));
        let search = ResilientDuplicateSearch::new(
            DuplicateSearchGateway::new(Arc::new(ExactAttributeMatcher::new(identities.clone()))),
            RetryPolicy::fixed(1, std::time::Duration::ZERO),
        );
        let engine = ResolutionEngine::new(
            catalog,
            identities.clone(),
            suspicions.clone(),
            search,
            ResolutionSettings {
                pivot_attributes: vec!["family_name".to_string(), "birthdate".to_string()],
                batch_size,
                ..ResolutionSettings::default()
            },
        );
        Fixture {
            engine,
            identities,
            suspicions,
        }
    }

    fn person(id: &str, cert: u32) -> Identity {
        named(id, "Martin", cert)
    }

    fn named(id: &str, family_name: &str, cert: u32) -> Identity {
        Identity::new(id)
            .with_attribute("family_name", family_name, cert)
            .with_attribute("birthdate", "01/01/1990", cert)
    }

    fn suspect(f: &Fixture, subject: &str, other: &str) -> SuspiciousIdentity {
        f.suspicions
            .create(
                NewSuspicion::paired(CustomerId::new(subject), CustomerId::new(other), "STRICT"),
                &RequestAuthor::application("test"),
            )
            .expect("create")
            .expect("new suspicion")
    }

    #[test]
    fn test_merges_into_best_ranked_identity() {
        let f = fixture(vec![
            person("A", 100).with_quality(0.3),
            person("B", 200)
                .with_quality(0.8)
                .with_attribute("email", "b@x", 100),
        ]);
        suspect(&f, "A", "B");

        let report = f.engine.run().expect("run");
        assert_eq!(report.merges, 1);
        assert_eq!(report.suspicions_resolved, 1);

        let a = f
            .identities
            .find_by_customer_id(&CustomerId::new("A"))
            .expect("find")
            .expect("A");
        assert_eq!(a.merged_into, Some(CustomerId::new("B")));
        assert_eq!(f.suspicions.backend().count_by_rule("STRICT").expect("count"), 0);
    }

    #[test]
    fn test_locked_suspicion_is_untouched() {
        let f = fixture(vec![person("A", 100), person("B", 100)]);
        let suspicion = suspect(&f, "A", "B");
        f.suspicions
            .lock(&suspicion.id, &RequestAuthor::application("operator"))
            .expect("lock");

        let report = f.engine.run().expect("run");
        assert_eq!(report.suspicions_locked, 1);
        assert_eq!(report.merges, 0);
    }

    #[test]
    fn test_stale_suspicion_is_deleted() {
        let f = fixture(vec![
            person("A", 100),
            Identity::new("B")
                .with_attribute("family_name", "Durand", 100)
                .with_attribute("birthdate", "01/01/1990", 100),
        ]);
        suspect(&f, "A", "B");

        let report = f.engine.run().expect("run");
        assert_eq!(report.suspicions_stale, 1);
        assert_eq!(f.suspicions.backend().count_by_rule("STRICT").expect("count"), 0);
    }

    #[test]
    fn test_missing_strict_rule_fails_run() {
        let f = fixture(Vec::new());
        let engine = ResolutionEngine::new(
            Arc::new(SqliteRuleCatalog::in_memory().expect("catalog")),
            f.identities.clone(),
            f.suspicions.clone(),
            f.engine.search.clone(),
            ResolutionSettings::default(),
        );
        assert!(engine.run().is_err());
    }

    #[test]
    fn test_rejected_suspicions_do_not_hide_later_ones() {
        let f = fixture_paged(
            vec![
                person("A", 100).with_attribute("email", "a@x", 100),
                person("B", 100).with_attribute("email", "b@x", 100),
                named("C", "Durand", 100),
                named("D", "Durand", 100),
            ],
            1,
        );
        suspect(&f, "A", "B");
        suspect(&f, "C", "D");

        let report = f.engine.run().expect("run");
        assert_eq!(report.suspicions_examined, 2);
        assert_eq!(report.candidates_rejected, 1);
        assert_eq!(report.merges, 1);
        assert_eq!(report.suspicions_resolved, 1);
        assert_eq!(f.suspicions.backend().count_by_rule("STRICT").expect("count"), 1);

        let again = f.engine.run().expect("second run");
        assert_eq!(again.suspicions_examined, 1);
        assert_eq!(again.merges, 0);
    }

    #[test]
    fn test_every_page_is_resolved_in_one_run() {
        let families = ["Martin", "Durand", "Petit", "Moreau", "Laurent"];
        let mut identities = Vec::new();
        for family in families {
            identities.push(named(&format!("{family}-1"), family, 100));
            identities.push(named(&format!("{family}-2"), family, 100));
        }
        let f = fixture_paged(identities, 2);
        for family in families {
            suspect(&f, &format!("{family}-1"), &format!("{family}-2"));
        }

        let report = f.engine.run().expect("run");
        assert_eq!(report.suspicions_examined, 5);
        assert_eq!(report.merges, 5);
        assert_eq!(f.suspicions.backend().count_by_rule("STRICT").expect("count"), 0);
    }
}
