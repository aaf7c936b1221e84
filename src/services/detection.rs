//! Detection scanner.
//!
//! Walks the scannable rules in priority order, pages through identities
//! carrying each rule's checked attributes, asks the duplicate search about
//! every identity not seen yet, and records one suspicion per duplicate
//! group. A purge pass then drops suspicions that no longer match.
//!
//! # Example
//!
//! ```rust,ignore
//! let report = services.scanner().run()?;
//! println!("{}", report.summary());
//! ```

use super::{SuspicionService, duration_to_millis, u64_to_f64};
use crate::models::{
    CustomerId, DuplicateRule, DuplicateSearchOutcome, DuplicateSearchRequest, LimitationMode,
    NewSuspicion, RequestAuthor, SuspiciousIdentity,
};
use crate::services::ResilientDuplicateSearch;
use crate::storage::{IdentityStore, RuleCatalog};
use crate::Result;
use chrono::Utc;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, info_span, instrument, warn};

/// Settings for [`DetectionScanner`].
#[derive(Debug, Clone)]
pub struct DetectionSettings {
    /// Identities fetched per page.
    pub batch_size: usize,
    /// Maximum number of suspicions re-checked by the purge pass.
    pub purge_size: usize,
    /// Author recorded on created suspicions.
    pub author: RequestAuthor,
}

impl Default for DetectionSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            purge_size: 500,
            author: RequestAuthor::application("detection-scanner"),
        }
    }
}

/// Result of a scanner run.
#[derive(Debug, Clone, Default)]
pub struct DetectionReport {
    /// Rules scanned to the end (or to their limit).
    pub rules_processed: usize,
    /// Rules skipped because their limit was already reached.
    pub rules_skipped: usize,
    /// Rules whose processing failed.
    pub rules_failed: usize,
    /// Identities submitted to the duplicate search.
    pub identities_checked: usize,
    /// Searches skipped because the provider stayed unavailable.
    pub provider_unavailable: usize,
    /// Suspicions created, by rule code.
    pub created_by_rule: BTreeMap<String, usize>,
    /// Suspicions re-checked by the purge pass.
    pub purge_checked: usize,
    /// Suspicions deleted by the purge pass.
    pub suspicions_purged: usize,
    /// Duration of the run in milliseconds.
    pub duration_ms: u64,
}

impl DetectionReport {
    /// Total number of suspicions created.
    #[must_use]
    pub fn suspicions_created(&self) -> usize {
        self.created_by_rule.values().sum()
    }

    /// Returns a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        let mut summary = format!(
            "Scanned {} rules ({} skipped, {} failed), checked {} identities, created {} suspicions",
            self.rules_processed,
            self.rules_skipped,
            self.rules_failed,
            self.identities_checked,
            self.suspicions_created()
        );
        if !self.created_by_rule.is_empty() {
            let breakdown: Vec<String> = self
                .created_by_rule
                .iter()
                .map(|(rule, count)| format!("{rule}: {count}"))
                .collect();
            summary.push_str(&format!(" ({})", breakdown.join(", ")));
        }
        summary.push_str(&format!(
            ", purged {}/{} in {}ms",
            self.suspicions_purged, self.purge_checked, self.duration_ms
        ));
        if self.provider_unavailable > 0 {
            summary.push_str(&format!(
                " [{} searches skipped: provider unavailable]",
                self.provider_unavailable
            ));
        }
        summary
    }
}

/// Periodic duplicate detection over the rule catalog.
pub struct DetectionScanner {
    rules: Arc<dyn RuleCatalog>,
    identities: Arc<dyn IdentityStore>,
    suspicions: Arc<SuspicionService>,
    search: ResilientDuplicateSearch,
    settings: DetectionSettings,
}

impl DetectionScanner {
    /// Creates a scanner.
    #[must_use]
    pub fn new(
        rules: Arc<dyn RuleCatalog>,
        identities: Arc<dyn IdentityStore>,
        suspicions: Arc<SuspicionService>,
        search: ResilientDuplicateSearch,
        settings: DetectionSettings,
    ) -> Self {
        Self {
            rules,
            identities,
            suspicions,
            search,
            settings,
        }
    }

    /// Runs one full pass: every scannable rule, then the purge.
    ///
    /// A failing rule is logged and counted; the run carries on with the
    /// next rule and always attempts the purge.
    ///
    /// # Errors
    ///
    /// Returns an error only if the rule list cannot be loaded.
    #[instrument(
        name = "identity_dedup.detection.run",
        skip(self),
        fields(component = "detection", batch_size = self.settings.batch_size)
    )]
    pub fn run(&self) -> Result<DetectionReport> {
        let start = Instant::now();
        let mut report = DetectionReport::default();

        for rule in self.rules.scannable_rules()? {
            let _span = info_span!("identity_dedup.detection.rule", rule_code = %rule.code).entered();
            match self.process_rule(&rule, &mut report) {
                Ok(Some(created)) => {
                    report.rules_processed += 1;
                    report.created_by_rule.insert(rule.code.clone(), created);
                    self.stamp_rule(&rule);
                },
                Ok(None) => report.rules_skipped += 1,
                Err(e) => {
                    report.rules_failed += 1;
                    warn!(rule_code = %rule.code, error = %e, "Rule scan failed");
                },
            }
        }

        self.purge(&mut report);

        report.duration_ms = duration_to_millis(start.elapsed());
        metrics::histogram!("dedup_daemon_run_duration_ms", "daemon" => "detection")
            .record(u64_to_f64(report.duration_ms));
        info!(
            rules_processed = report.rules_processed,
            suspicions_created = report.suspicions_created(),
            suspicions_purged = report.suspicions_purged,
            duration_ms = report.duration_ms,
            "Detection scan completed"
        );
        Ok(report)
    }

    /// Scans one rule. Returns `None` if the rule was skipped.
    fn process_rule(
        &self,
        rule: &DuplicateRule,
        report: &mut DetectionReport,
    ) -> Result<Option<usize>> {
        let backend = self.suspicions.backend();

        let mut marked = match rule.limitation_mode {
            LimitationMode::Global => backend.count_by_rule(&rule.code)?,
            LimitationMode::Incremental => 0,
        };
        if rule.limitation_mode == LimitationMode::Global && rule.limit_reached(marked) {
            info!(
                rule_code = %rule.code,
                stored = marked,
                limit = rule.detection_limit,
                "Detection limit reached, skipping rule"
            );
            return Ok(None);
        }

        let already_suspicious = backend.suspicious_customer_ids(&rule.code)?;
        let mut skip: HashSet<CustomerId> = HashSet::new();
        let mut created = 0;
        let mut offset = 0;
        let batch_size = self.settings.batch_size.max(1);

        'pages: loop {
            let ids = self.identities.find_ids_with_attributes(
                &rule.checked_attributes,
                offset,
                batch_size,
            )?;
            if ids.is_empty() {
                if offset == 0 {
                    debug!(rule_code = %rule.code, "No candidate identity for rule");
                }
                break;
            }
            offset += ids.len();

            let pending: Vec<CustomerId> = ids
                .into_iter()
                .filter(|id| !already_suspicious.contains(id) && !skip.contains(id))
                .collect();
            if pending.is_empty() {
                continue;
            }

            for identity in self
                .identities
                .search_batch(&pending, &rule.checked_attributes)?
            {
                if skip.contains(&identity.customer_id) {
                    continue;
                }
                report.identities_checked += 1;

                let request = DuplicateSearchRequest::for_identity(&identity, vec![rule.clone()]);
                let result = match self.search.search(&request) {
                    Ok(DuplicateSearchOutcome::Found(mut results)) => {
                        results.remove(&rule.code).unwrap_or_default()
                    },
                    Ok(DuplicateSearchOutcome::Empty) => continue,
                    Ok(DuplicateSearchOutcome::Unavailable) => {
                        report.provider_unavailable += 1;
                        warn!(
                            customer_id = %identity.customer_id,
                            rule_code = %rule.code,
                            "Duplicate search unavailable, skipping identity"
                        );
                        continue;
                    },
                    Err(e) => {
                        warn!(
                            customer_id = %identity.customer_id,
                            rule_code = %rule.code,
                            error = %e,
                            "Duplicate search failed, skipping identity"
                        );
                        continue;
                    },
                };

                let mut matches = Vec::new();
                for candidate in result.distinct_candidates(Some(&identity.customer_id)) {
                    if !backend.is_excluded(&identity.customer_id, &candidate.customer_id)? {
                        matches.push(candidate.customer_id);
                    }
                }
                if matches.is_empty() {
                    continue;
                }

                skip.insert(identity.customer_id.clone());
                skip.extend(matches.iter().cloned());

                let suspicion =
                    NewSuspicion::group(identity.customer_id.clone(), &matches, rule.code.clone())
                        .with_metadata(&result.metadata);
                if self
                    .suspicions
                    .create(suspicion, &self.settings.author)?
                    .is_some()
                {
                    created += 1;
                    marked += 1;
                    if rule.limit_reached(marked) {
                        info!(
                            rule_code = %rule.code,
                            limit = rule.detection_limit,
                            "Detection limit reached, stopping rule"
                        );
                        break 'pages;
                    }
                }
            }
        }

        Ok(Some(created))
    }

    fn stamp_rule(&self, rule: &DuplicateRule) {
        let mut stamped = rule.clone();
        stamped.last_execution_date = Some(Utc::now());
        if let Err(e) = self.rules.update(&stamped) {
            warn!(rule_code = %rule.code, error = %e, "Failed to record rule execution date");
        }
    }

    /// Re-checks the oldest suspicions and deletes those that no longer match.
    fn purge(&self, report: &mut DetectionReport) {
        let _span = info_span!("identity_dedup.detection.purge").entered();
        let suspicions = match self
            .suspicions
            .backend()
            .list(0, self.settings.purge_size)
        {
            Ok(suspicions) => suspicions,
            Err(e) => {
                warn!(error = %e, "Failed to list suspicions for purge");
                return;
            },
        };

        for suspicion in suspicions {
            report.purge_checked += 1;
            match self.is_expired(&suspicion) {
                Ok(true) => match self.suspicions.backend().delete(&suspicion.id) {
                    Ok(_) => {
                        report.suspicions_purged += 1;
                        debug!(suspicion_id = %suspicion.id, "Purged stale suspicion");
                    },
                    Err(e) => {
                        warn!(suspicion_id = %suspicion.id, error = %e, "Failed to purge suspicion");
                    },
                },
                Ok(false) => {},
                Err(e) => {
                    warn!(suspicion_id = %suspicion.id, error = %e, "Failed to re-check suspicion");
                },
            }
        }
    }

    /// Returns true if the suspicion's subject no longer has any duplicate.
    fn is_expired(&self, suspicion: &SuspiciousIdentity) -> Result<bool> {
        if suspicion.lock.is_active(Utc::now()) {
            return Ok(false);
        }
        let rule = self.rules.get(&suspicion.rule_code)?;
        let Some(subject) = self.identities.find_by_customer_id(&suspicion.customer_id)? else {
            return Ok(true);
        };
        if subject.is_merged() {
            return Ok(true);
        }
        let request = DuplicateSearchRequest::for_identity(&subject, vec![rule]);
        Ok(matches!(
            self.search.search(&request)?,
            DuplicateSearchOutcome::Empty
        ))
    }
}
