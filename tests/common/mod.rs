//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use identity_dedup::config::{DedupConfig, SearchConfig};
use identity_dedup::models::{CustomerId, DuplicateRule, Identity, RuleResults};
use identity_dedup::services::{
    DedupBackends, DedupServices, DuplicateSearchProvider, ExactAttributeMatcher,
};
use identity_dedup::storage::{IdentityStore, InMemoryIdentityStore};
use identity_dedup::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A service graph over in-memory backends, with the identity store exposed
/// so tests can change identities between runs.
pub struct Harness {
    pub services: DedupServices,
    pub identities: Arc<InMemoryIdentityStore>,
}

/// Configuration with a single attempt per search and no retry delay.
pub fn config(rules: Vec<DuplicateRule>) -> DedupConfig {
    let mut config = DedupConfig {
        rules,
        search: SearchConfig {
            max_retry: 1,
            tempo_retry_ms: 0,
            ..SearchConfig::default()
        },
        ..DedupConfig::default()
    };
    config.reconciliation.delay_secs = 0;
    config
}

pub fn harness(config: &DedupConfig, identities: Vec<Identity>) -> Harness {
    harness_over(config, identities, |store| store)
}

/// Builds the services with `wrap` applied to the identity store handed to
/// the pipeline.
pub fn harness_over(
    config: &DedupConfig,
    identities: Vec<Identity>,
    wrap: impl FnOnce(Arc<dyn IdentityStore>) -> Arc<dyn IdentityStore>,
) -> Harness {
    let store = Arc::new(InMemoryIdentityStore::with_identities(identities));
    let shared: Arc<dyn IdentityStore> = store.clone();
    let backends = DedupBackends::in_memory(wrap(shared)).expect("backends");
    let services = DedupServices::build(config, backends).expect("services");
    Harness {
        services,
        identities: store,
    }
}

/// Exact-match provider that can be taken down, for every subject or for
/// chosen ones.
pub struct OutageProvider {
    inner: ExactAttributeMatcher,
    down: AtomicBool,
    failing: Mutex<HashSet<CustomerId>>,
}

impl OutageProvider {
    pub fn new(identities: Arc<dyn IdentityStore>) -> Self {
        Self {
            inner: ExactAttributeMatcher::new(identities),
            down: AtomicBool::new(false),
            failing: Mutex::new(HashSet::new()),
        }
    }

    /// Makes every search fail until `set_down(false)`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Makes searches about `customer_id` fail.
    pub fn fail_for(&self, customer_id: &str) {
        self.failing
            .lock()
            .expect("failing set")
            .insert(CustomerId::new(customer_id));
    }

    /// Brings the provider back for every subject.
    pub fn recover(&self) {
        self.set_down(false);
        self.failing.lock().expect("failing set").clear();
    }
}

impl DuplicateSearchProvider for OutageProvider {
    fn name(&self) -> &'static str {
        "outage"
    }

    fn find_duplicates(
        &self,
        attributes: &BTreeMap<String, String>,
        subject: Option<&CustomerId>,
        rules: &[DuplicateRule],
        attribute_filter: &[String],
    ) -> Result<RuleResults> {
        let failing = subject.is_some_and(|id| self.failing.lock().expect("failing set").contains(id));
        if failing || self.down.load(Ordering::SeqCst) {
            return Err(Error::ProviderUnavailable {
                provider: "outage".to_string(),
                cause: "connection refused".to_string(),
            });
        }
        self.inner
            .find_duplicates(attributes, subject, rules, attribute_filter)
    }
}

/// Builds the services over an [`OutageProvider`], returned alongside.
pub fn harness_with_outage(
    config: &DedupConfig,
    identities: Vec<Identity>,
) -> (Harness, Arc<OutageProvider>) {
    harness_with_outage_over(config, identities, |store| store)
}

/// Same as [`harness_with_outage`], with `wrap` applied to the identity
/// store handed to the pipeline.
pub fn harness_with_outage_over(
    config: &DedupConfig,
    identities: Vec<Identity>,
    wrap: impl FnOnce(Arc<dyn IdentityStore>) -> Arc<dyn IdentityStore>,
) -> (Harness, Arc<OutageProvider>) {
    let store = Arc::new(InMemoryIdentityStore::with_identities(identities));
    let shared: Arc<dyn IdentityStore> = store.clone();
    let outage = Arc::new(OutageProvider::new(shared.clone()));
    let backends = DedupBackends::in_memory(wrap(shared))
        .expect("backends")
        .with_provider(outage.clone());
    let services = DedupServices::build(config, backends).expect("services");
    (
        Harness {
            services,
            identities: store,
        },
        outage,
    )
}

pub fn with_email(id: &str, email: &str) -> Identity {
    Identity::new(id).with_attribute("email", email, 100)
}

pub fn person(id: &str, family_name: &str, certification: u32) -> Identity {
    Identity::new(id)
        .with_attribute("family_name", family_name, certification)
        .with_attribute("birthdate", "1990-01-01", certification)
}
