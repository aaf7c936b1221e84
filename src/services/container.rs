//! Service container.
//!
//! Builds the whole service graph once from [`DedupConfig`]. Daemons and CLI
//! commands borrow services from the container; nothing is held in globals.
//!
//! ```text
//! DedupServices
//!   ├── rules ──────────────┐
//!   ├── identities ─────────┼──► ResilientDuplicateSearch ──► provider
//!   ├── suspicions (+ EventBus)
//!   ├── queue, index
//!   ├── scanner / reconciler / resolver
//! ```

use super::{
    DetectionScanner, DetectionSettings, DuplicateSearchGateway, DuplicateSearchProvider,
    ExactAttributeMatcher, ReconciliationProcessor, ReconciliationSettings, ResilientDuplicateSearch,
    ResolutionEngine, ResolutionSettings, RetryPolicy, SuspicionService, SuspicionSettings,
};
use crate::Result;
use crate::config::DedupConfig;
use crate::daemon::{Daemon, DaemonRunner};
use crate::models::RequestAuthor;
use crate::observability::EventBus;
use crate::storage::{
    ActionQueue, IdentityStore, InMemoryIdentityStore, InMemoryIndexActionChannel,
    IndexActionChannel, RuleCatalog, SqliteActionQueue, SqliteRuleCatalog, SqliteSuspicionBackend,
    SuspicionBackend,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Storage backends and provider the services are built on.
pub struct DedupBackends {
    /// Rule catalog.
    pub rules: Arc<dyn RuleCatalog>,
    /// Suspicion store.
    pub suspicions: Arc<dyn SuspicionBackend>,
    /// Reconciliation action queue.
    pub queue: Arc<dyn ActionQueue>,
    /// Identity store.
    pub identities: Arc<dyn IdentityStore>,
    /// Indexing side-channel.
    pub index: Arc<dyn IndexActionChannel>,
    /// Duplicate search provider.
    pub provider: Arc<dyn DuplicateSearchProvider>,
}

impl DedupBackends {
    /// Opens the `SQLite` stores at `config.database_path` and loads the
    /// identity snapshot, if any. Merges are written back to the snapshot.
    /// The search provider is the [`ExactAttributeMatcher`] over that store.
    ///
    /// # Errors
    ///
    /// Returns an error if a store cannot be opened or the snapshot cannot be
    /// read.
    pub fn open(config: &DedupConfig) -> Result<Self> {
        let path = &config.database_path;
        let identities: Arc<dyn IdentityStore> = match &config.identities_path {
            Some(snapshot) => Arc::new(InMemoryIdentityStore::load_json(snapshot)?),
            None => Arc::new(InMemoryIdentityStore::new()),
        };
        Ok(Self {
            rules: Arc::new(SqliteRuleCatalog::new(path)?),
            suspicions: Arc::new(SqliteSuspicionBackend::new(path)?),
            queue: Arc::new(SqliteActionQueue::new(path)?),
            provider: Arc::new(ExactAttributeMatcher::new(identities.clone())),
            identities,
            index: Arc::new(InMemoryIndexActionChannel::new()),
        })
    }

    /// In-memory stores over the given identity store.
    ///
    /// # Errors
    ///
    /// Returns an error if an in-memory database cannot be created.
    pub fn in_memory(identities: Arc<dyn IdentityStore>) -> Result<Self> {
        Ok(Self {
            rules: Arc::new(SqliteRuleCatalog::in_memory()?),
            suspicions: Arc::new(SqliteSuspicionBackend::in_memory()?),
            queue: Arc::new(SqliteActionQueue::in_memory()?),
            provider: Arc::new(ExactAttributeMatcher::new(identities.clone())),
            identities,
            index: Arc::new(InMemoryIndexActionChannel::new()),
        })
    }

    /// Replaces the duplicate search provider.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn DuplicateSearchProvider>) -> Self {
        self.provider = provider;
        self
    }

    /// Replaces the indexing side-channel.
    #[must_use]
    pub fn with_index(mut self, index: Arc<dyn IndexActionChannel>) -> Self {
        self.index = index;
        self
    }
}

/// The service graph.
pub struct DedupServices {
    rules: Arc<dyn RuleCatalog>,
    queue: Arc<dyn ActionQueue>,
    identities: Arc<dyn IdentityStore>,
    suspicions: Arc<SuspicionService>,
    events: EventBus,
    scanner: Arc<DetectionScanner>,
    reconciler: Arc<ReconciliationProcessor>,
    resolver: Arc<ResolutionEngine>,
}

impl DedupServices {
    /// Opens the configured backends and builds the services.
    ///
    /// # Errors
    ///
    /// Returns an error if a backend cannot be opened or a configured rule
    /// cannot be stored.
    pub fn from_config(config: &DedupConfig) -> Result<Self> {
        let services = Self::build(config, DedupBackends::open(config)?)?;
        info!(
            database = %config.database_path.display(),
            rules = config.rules.len(),
            "Services initialized"
        );
        Ok(services)
    }

    /// Builds the services over explicit backends.
    ///
    /// Rules listed in `config.rules` are upserted into the catalog.
    ///
    /// # Errors
    ///
    /// Returns an error if a configured rule cannot be stored.
    pub fn build(config: &DedupConfig, backends: DedupBackends) -> Result<Self> {
        for rule in &config.rules {
            backends.rules.upsert(rule)?;
        }

        let events = EventBus::default();
        let suspicions = Arc::new(SuspicionService::new(
            backends.suspicions,
            events.clone(),
            SuspicionSettings {
                lock_duration: seconds(config.lock.duration_secs),
                client_code: config.client_code.clone(),
            },
        ));
        let search = ResilientDuplicateSearch::new(
            DuplicateSearchGateway::new(backends.provider),
            RetryPolicy::from_config(&config.search),
        );
        let author = |daemon: &str| RequestAuthor::application(format!("{}:{daemon}", config.author_name));

        let scanner = DetectionScanner::new(
            backends.rules.clone(),
            backends.identities.clone(),
            suspicions.clone(),
            search.clone(),
            DetectionSettings {
                batch_size: config.detection.batch_size.max(1),
                purge_size: config.detection.purge_size,
                author: author("detection"),
            },
        );
        let reconciler = ReconciliationProcessor::new(
            backends.queue.clone(),
            backends.index,
            backends.rules.clone(),
            backends.identities.clone(),
            suspicions.clone(),
            search.clone(),
            ReconciliationSettings {
                delay: seconds(config.reconciliation.delay_secs),
                batch_size: config.reconciliation.batch_size.max(1),
                creation_rules: config.reconciliation.creation_rules.clone(),
                update_rules: config.reconciliation.update_rules.clone(),
                author: author("reconciliation"),
            },
        );
        let resolver = ResolutionEngine::new(
            backends.rules.clone(),
            backends.identities.clone(),
            suspicions.clone(),
            search,
            ResolutionSettings {
                strict_rule_code: config.resolution.strict_rule_code.clone(),
                min_pivot_certification: config.resolution.min_pivot_certification,
                pivot_attributes: config.resolution.pivot_attributes.clone(),
                batch_size: config.resolution.batch_size.max(1),
                author: author("resolution"),
                client_code: config.client_code.clone(),
            },
        );

        Ok(Self {
            rules: backends.rules,
            queue: backends.queue,
            identities: backends.identities,
            suspicions,
            events,
            scanner: Arc::new(scanner),
            reconciler: Arc::new(reconciler),
            resolver: Arc::new(resolver),
        })
    }

    /// Detection scanner.
    #[must_use]
    pub fn scanner(&self) -> &DetectionScanner {
        &self.scanner
    }

    /// Reconciliation processor.
    #[must_use]
    pub fn reconciler(&self) -> &ReconciliationProcessor {
        &self.reconciler
    }

    /// Resolution engine.
    #[must_use]
    pub fn resolver(&self) -> &ResolutionEngine {
        &self.resolver
    }

    /// Starts the three daemons on `runner` with their configured intervals.
    ///
    /// # Errors
    ///
    /// Returns an error if a daemon thread cannot be spawned.
    pub fn spawn_daemons(&self, runner: &mut DaemonRunner, config: &DedupConfig) -> Result<()> {
        let daemons: [(Arc<dyn Daemon>, u64); 3] = [
            (self.scanner.clone(), config.detection.interval_secs),
            (self.reconciler.clone(), config.reconciliation.interval_secs),
            (self.resolver.clone(), config.resolution.interval_secs),
        ];
        for (daemon, interval_secs) in daemons {
            runner.spawn(daemon, Duration::from_secs(interval_secs.max(1)))?;
        }
        Ok(())
    }

    /// Suspicion service.
    #[must_use]
    pub fn suspicions(&self) -> Arc<SuspicionService> {
        Arc::clone(&self.suspicions)
    }

    /// Rule catalog.
    #[must_use]
    pub fn rules(&self) -> &dyn RuleCatalog {
        self.rules.as_ref()
    }

    /// Action queue.
    #[must_use]
    pub fn queue(&self) -> &dyn ActionQueue {
        self.queue.as_ref()
    }

    /// Identity store.
    #[must_use]
    pub fn identities(&self) -> &dyn IdentityStore {
        self.identities.as_ref()
    }

    /// Bus of produced identity-change events.
    #[must_use]
    pub const fn events(&self) -> &EventBus {
        &self.events
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CustomerId, DuplicateRule, Identity};

    #[test]
    fn test_build_seeds_configured_rules() {
        let config = DedupConfig {
            rules: vec![DuplicateRule::new("EMAIL", 1, &["email"]).with_daemon(true)],
            ..DedupConfig::default()
        };
        let identities = Arc::new(InMemoryIdentityStore::with_identities([
            Identity::new("A").with_attribute("email", "a@x", 100),
            Identity::new("B").with_attribute("email", "a@x", 100),
        ]));
        let services = DedupServices::build(
            &config,
            DedupBackends::in_memory(identities).expect("backends"),
        )
        .expect("services");

        assert_eq!(services.rules().list_rules().expect("rules").len(), 1);
        let report = services.scanner().run().expect("scan");
        assert_eq!(report.suspicions_created(), 1);
        assert_eq!(
            services
                .suspicions()
                .backend()
                .find_by_customer(&CustomerId::new("B"))
                .expect("find")
                .len(),
            1
        );
    }

    #[test]
    fn test_from_config_opens_file_database() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = DedupConfig::default().with_database_path(dir.path().join("db/dedup.db"));

        let services = DedupServices::from_config(&config).expect("services");
        assert_eq!(services.queue().count().expect("count"), 0);
        assert!(dir.path().join("db/dedup.db").exists());
    }
}
