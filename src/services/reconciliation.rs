//! Reconciliation of suspicions after identity changes.
//!
//! Each queued [`SuspicionAction`] triggers a recomputation of the
//! suspicions touching its identity. Searches run first; only once every
//! search answered are the old suspicions replaced, so a provider outage
//! leaves the store untouched and the action queued.

use super::{SuspicionService, duration_to_millis, u64_to_f64};
use crate::models::{
    ActionType, CustomerId, DuplicateRule, DuplicateSearchOutcome, DuplicateSearchRequest,
    NewSuspicion, RequestAuthor, RuleResults, SuspicionAction,
};
use crate::services::ResilientDuplicateSearch;
use crate::storage::{ActionQueue, IdentityStore, IndexActionChannel, RuleCatalog};
use crate::{Error, Result};
use chrono::{Duration, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Settings for [`ReconciliationProcessor`].
#[derive(Debug, Clone)]
pub struct ReconciliationSettings {
    /// Minimum age of an action before it is processed.
    pub delay: Duration,
    /// Actions fetched per run.
    pub batch_size: usize,
    /// Rules applied to created identities.
    pub creation_rules: Vec<String>,
    /// Rules applied to every other change.
    pub update_rules: Vec<String>,
    /// Author recorded on created suspicions.
    pub author: RequestAuthor,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self {
            delay: Duration::seconds(30),
            batch_size: 100,
            creation_rules: Vec::new(),
            update_rules: Vec::new(),
            author: RequestAuthor::application("reconciliation-processor"),
        }
    }
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Default)]
pub struct ReconciliationReport {
    /// Actions read from the queue.
    pub actions_fetched: usize,
    /// Actions processed and removed from the queue.
    pub actions_processed: usize,
    /// Actions left queued (not due, pending index action, locked
    /// suspicion or unavailable provider).
    pub actions_deferred: usize,
    /// Actions whose processing failed; they stay queued.
    pub actions_failed: usize,
    /// Suspicions deleted.
    pub suspicions_deleted: usize,
    /// Suspicions created.
    pub suspicions_created: usize,
    /// Duration of the run in milliseconds.
    pub duration_ms: u64,
}

impl ReconciliationReport {
    /// Returns a human-readable summary.
    #[must_use]
    pub fn summary(&self) -> String {
        if self.actions_fetched == 0 {
            return format!("No pending action ({}ms)", self.duration_ms);
        }
        format!(
            "Processed {}/{} actions ({} deferred, {} failed): deleted {} and created {} suspicions in {}ms",
            self.actions_processed,
            self.actions_fetched,
            self.actions_deferred,
            self.actions_failed,
            self.suspicions_deleted,
            self.suspicions_created,
            self.duration_ms
        )
    }
}

/// Outcome of one action.
enum ActionOutcome {
    Processed { deleted: usize, created: usize },
    Deferred(&'static str),
}

/// Consumes the action queue and keeps suspicions in line with identities.
pub struct ReconciliationProcessor {
    queue: Arc<dyn ActionQueue>,
    index: Arc<dyn IndexActionChannel>,
    rules: Arc<dyn RuleCatalog>,
    identities: Arc<dyn IdentityStore>,
    suspicions: Arc<SuspicionService>,
    search: ResilientDuplicateSearch,
    settings: ReconciliationSettings,
}

impl ReconciliationProcessor {
    /// Creates a processor.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<dyn ActionQueue>,
        index: Arc<dyn IndexActionChannel>,
        rules: Arc<dyn RuleCatalog>,
        identities: Arc<dyn IdentityStore>,
        suspicions: Arc<SuspicionService>,
        search: ResilientDuplicateSearch,
        settings: ReconciliationSettings,
    ) -> Self {
        Self {
            queue,
            index,
            rules,
            identities,
            suspicions,
            search,
            settings,
        }
    }

    /// Processes one batch of queued actions, oldest first.
    ///
    /// Each action is independent: a failing action is logged and stays
    /// queued for the next run. Processed actions are removed together at
    /// the end of the run.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or cleaned up.
    #[instrument(
        name = "identity_dedup.reconciliation.run",
        skip(self),
        fields(component = "reconciliation", batch_size = self.settings.batch_size)
    )]
    pub fn run(&self) -> Result<ReconciliationReport> {
        let start = Instant::now();
        let now = Utc::now();
        let mut report = ReconciliationReport::default();

        let actions = self.queue.fetch_batch(self.settings.batch_size)?;
        report.actions_fetched = actions.len();

        let mut processed = Vec::new();
        for action in &actions {
            match self.process(action, now) {
                Ok(ActionOutcome::Processed { deleted, created }) => {
                    report.suspicions_deleted += deleted;
                    report.suspicions_created += created;
                    processed.push(action.id);
                },
                Ok(ActionOutcome::Deferred(reason)) => {
                    report.actions_deferred += 1;
                    debug!(
                        action_id = action.id,
                        customer_id = %action.customer_id,
                        reason,
                        "Action deferred"
                    );
                },
                Err(e) => {
                    report.actions_failed += 1;
                    warn!(
                        action_id = action.id,
                        customer_id = %action.customer_id,
                        action_type = action.action_type.as_str(),
                        error = %e,
                        "Failed to reconcile action"
                    );
                },
            }
        }

        report.actions_processed = self.queue.delete_batch(&processed)?;
        report.duration_ms = duration_to_millis(start.elapsed());
        metrics::histogram!("dedup_daemon_run_duration_ms", "daemon" => "reconciliation")
            .record(u64_to_f64(report.duration_ms));
        info!(
            actions_fetched = report.actions_fetched,
            actions_processed = report.actions_processed,
            suspicions_deleted = report.suspicions_deleted,
            suspicions_created = report.suspicions_created,
            duration_ms = report.duration_ms,
            "Reconciliation completed"
        );
        Ok(report)
    }

    fn process(
        &self,
        action: &SuspicionAction,
        now: chrono::DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        if !action.is_due(now, self.settings.delay) {
            return Ok(ActionOutcome::Deferred("not due"));
        }
        if self
            .index
            .has_pending_action(&action.customer_id, action.action_type)?
        {
            return Ok(ActionOutcome::Deferred("index action pending"));
        }

        if action.action_type == ActionType::Delete {
            if self
                .suspicions
                .backend()
                .find_by_customer(&action.customer_id)?
                .iter()
                .any(|s| s.lock.is_active(now))
            {
                return Ok(ActionOutcome::Deferred("suspicion locked"));
            }
            let deleted = self.suspicions.delete_for_customer(&action.customer_id)?;
            return Ok(ActionOutcome::Processed {
                deleted: deleted.len(),
                created: 0,
            });
        }

        self.recompute(action, now)
    }

    /// Replaces the suspicions touching the action's identity.
    fn recompute(
        &self,
        action: &SuspicionAction,
        now: chrono::DateTime<Utc>,
    ) -> Result<ActionOutcome> {
        let subject = &action.customer_id;
        let backend = self.suspicions.backend();
        let gathered = backend.find_by_customer(subject)?;
        if gathered.iter().any(|s| s.lock.is_active(now)) {
            return Ok(ActionOutcome::Deferred("suspicion locked"));
        }

        let defaults = if action.action_type.uses_creation_rules() {
            &self.settings.creation_rules
        } else {
            &self.settings.update_rules
        };

        // Rule codes per identity to recompute: the subject gets every code
        // recorded against it, each paired identity the codes of its pairs.
        let mut targets: BTreeMap<CustomerId, BTreeSet<String>> = BTreeMap::new();
        targets.insert(subject.clone(), defaults.iter().cloned().collect());
        for suspicion in &gathered {
            for member in &suspicion.members {
                targets
                    .entry(member.clone())
                    .or_insert_with(|| defaults.iter().cloned().collect())
                    .insert(suspicion.rule_code.clone());
            }
            if let Some(codes) = targets.get_mut(subject) {
                codes.insert(suspicion.rule_code.clone());
            }
        }

        let mut found: Vec<(CustomerId, RuleResults)> = Vec::new();
        for (customer_id, codes) in &targets {
            let rules = self.resolve_rules(codes);
            if rules.is_empty() {
                continue;
            }
            let Some(identity) = self.identities.find_by_customer_id(customer_id)? else {
                continue;
            };
            if identity.is_merged() {
                continue;
            }
            let request = DuplicateSearchRequest::for_identity(&identity, rules).allow_empty(true);
            match self.search.search(&request)? {
                DuplicateSearchOutcome::Found(results) => found.push((customer_id.clone(), results)),
                DuplicateSearchOutcome::Empty => {},
                DuplicateSearchOutcome::Unavailable => {
                    return Ok(ActionOutcome::Deferred("provider unavailable"));
                },
            }
        }

        let deleted = backend.delete_by_customer(subject)?.len();

        let mut created = 0;
        for (customer_id, results) in found {
            for (rule_code, result) in results {
                for candidate in result.distinct_candidates(Some(&customer_id)) {
                    if backend.is_excluded(&customer_id, &candidate.customer_id)? {
                        continue;
                    }
                    let suspicion = NewSuspicion::paired(
                        customer_id.clone(),
                        candidate.customer_id,
                        rule_code.clone(),
                    )
                    .with_metadata(&result.metadata);
                    if self
                        .suspicions
                        .create(suspicion, &self.settings.author)?
                        .is_some()
                    {
                        created += 1;
                    }
                }
            }
        }

        Ok(ActionOutcome::Processed { deleted, created })
    }

    fn resolve_rules(&self, codes: &BTreeSet<String>) -> Vec<DuplicateRule> {
        let mut rules: Vec<DuplicateRule> = codes
            .iter()
            .filter_map(|code| match self.rules.get(code) {
                Ok(rule) if rule.active => Some(rule),
                Ok(_) => None,
                Err(Error::NotFound { .. }) => {
                    warn!(rule_code = %code, "Unknown rule in reconciliation rule set");
                    None
                },
                Err(e) => {
                    warn!(rule_code = %code, error = %e, "Failed to load rule");
                    None
                },
            })
            .collect();
        rules.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.code.cmp(&b.code)));
        rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Identity;
    use crate::observability::EventBus;
    use crate::services::{
        DuplicateSearchGateway, ExactAttributeMatcher, RetryPolicy, SuspicionSettings,
    };
    use crate::storage::{
        InMemoryIdentityStore, InMemoryIndexActionChannel, SqliteActionQueue, SqliteRuleCatalog,
        SqliteSuspicionBackend,
    };

    struct Fixture {
        processor: ReconciliationProcessor,
        queue: Arc<SqliteActionQueue>,
        index: Arc<InMemoryIndexActionChannel>,
        identities: Arc<InMemoryIdentityStore>,
        suspicions: Arc<SuspicionService>,
    }

    fn fixture(identities: Vec<Identity>) -> Fixture {
        let identities = Arc::new(InMemoryIdentityStore::with_identities(identities));
        let catalog = Arc::new(SqliteRuleCatalog::in_memory().expect("catalog"));
        catalog
            .upsert(&DuplicateRule::new("EMAIL", 1, &["email"]))
            .expect("rule");
        let queue = Arc::new(SqliteActionQueue::in_memory().expect("queue"));
        let index = Arc::new(InMemoryIndexActionChannel::new());
        let suspicions = Arc::new(SuspicionService::new(
            Arc::new(SqliteSuspicionBackend::in_memory().expect("backend")),
            EventBus::new(64),
            SuspicionSettings::default(),
        ));
        let search = ResilientDuplicateSearch::new(
            DuplicateSearchGateway::new(Arc::new(ExactAttributeMatcher::new(identities.clone()))),
            RetryPolicy::fixed(1, std::time::Duration::ZERO),
        );
        let processor = ReconciliationProcessor::new(
            queue.clone(),
            index.clone(),
            catalog,
            identities.clone(),
            suspicions.clone(),
            search,
            ReconciliationSettings {
                creation_rules: vec!["EMAIL".to_string()],
                update_rules: vec!["EMAIL".to_string()],
                ..ReconciliationSettings::default()
            },
        );
        Fixture {
            processor,
            queue,
            index,
            identities,
            suspicions,
        }
    }

    fn due() -> chrono::DateTime<Utc> {
        Utc::now() - Duration::minutes(5)
    }

    fn with_email(id: &str, email: &str) -> Identity {
        Identity::new(id).with_attribute("email", email, 100)
    }

    #[test]
    fn test_action_before_delay_stays_queued() {
        let f = fixture(vec![with_email("A", "a@x"), with_email("B", "a@x")]);
        f.queue
            .enqueue(&CustomerId::new("A"), ActionType::Create, Utc::now())
            .expect("enqueue");

        let report = f.processor.run().expect("run");
        assert_eq!(report.actions_deferred, 1);
        assert_eq!(f.queue.count().expect("count"), 1);
    }

    #[test]
    fn test_pending_index_action_defers() {
        let f = fixture(vec![with_email("A", "a@x"), with_email("B", "a@x")]);
        f.queue
            .enqueue(&CustomerId::new("A"), ActionType::Update, due())
            .expect("enqueue");
        f.index.mark_pending(CustomerId::new("A"), ActionType::Update);

        assert_eq!(f.processor.run().expect("run").actions_deferred, 1);

        f.index.complete(&CustomerId::new("A"), ActionType::Update);
        let report = f.processor.run().expect("run");
        assert_eq!(report.actions_processed, 1);
        assert_eq!(report.suspicions_created, 1);
        assert_eq!(f.queue.count().expect("count"), 0);
    }

    #[test]
    fn test_update_replaces_stale_pair() {
        let f = fixture(vec![
            with_email("A", "a@x"),
            with_email("B", "a@x"),
            with_email("C", "c@x"),
        ]);
        f.suspicions
            .create(
                NewSuspicion::paired(CustomerId::new("A"), CustomerId::new("B"), "EMAIL"),
                &RequestAuthor::application("test"),
            )
            .expect("create");

        f.identities.upsert(with_email("A", "c@x"));
        f.queue
            .enqueue(&CustomerId::new("A"), ActionType::Update, due())
            .expect("enqueue");
        let report = f.processor.run().expect("run");
        assert_eq!(report.suspicions_deleted, 1);

        let touching = f
            .suspicions
            .backend()
            .find_by_customer(&CustomerId::new("A"))
            .expect("find");
        assert_eq!(touching.len(), 1);
        assert!(touching[0].involves(&CustomerId::new("C")));
        assert!(!touching[0].involves(&CustomerId::new("B")));
    }

    #[test]
    fn test_delete_waits_for_locked_suspicion() {
        let f = fixture(Vec::new());
        let suspicion = f
            .suspicions
            .create(
                NewSuspicion::paired(CustomerId::new("A"), CustomerId::new("B"), "EMAIL"),
                &RequestAuthor::application("test"),
            )
            .expect("create")
            .expect("created");
        let resolver = RequestAuthor::application("resolver");
        f.suspicions.lock(&suspicion.id, &resolver).expect("lock");
        f.queue
            .enqueue(&CustomerId::new("B"), ActionType::Delete, due())
            .expect("enqueue");

        let report = f.processor.run().expect("run");
        assert_eq!(report.actions_deferred, 1);
        assert_eq!(report.suspicions_deleted, 0);
        assert!(f.suspicions.get(&suspicion.id).is_ok());
        assert_eq!(f.queue.count().expect("count"), 1);

        f.suspicions.unlock(&suspicion.id, &resolver).expect("unlock");
        let report = f.processor.run().expect("run");
        assert_eq!(report.suspicions_deleted, 1);
        assert_eq!(f.queue.count().expect("count"), 0);
    }
}
