//! In-memory identity store.
//!
//! Stands in for the external identity repository: the CLI loads it from a
//! JSON snapshot and tests populate it directly. A store loaded from a
//! snapshot writes it back after every merge.

use crate::models::{
    AttributeChangeStatus, AttributeMergeStatus, CustomerId, Identity, MergeOutcome, MergeRequest,
};
use crate::storage::traits::IdentityStore;
use crate::{Error, Result};
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

/// [`IdentityStore`] held in a `RwLock<BTreeMap>`, ordered by customer id.
#[derive(Default)]
pub struct InMemoryIdentityStore {
    identities: RwLock<BTreeMap<CustomerId, Identity>>,
    snapshot: Option<PathBuf>,
}

impl InMemoryIdentityStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `identities`.
    #[must_use]
    pub fn with_identities(identities: impl IntoIterator<Item = Identity>) -> Self {
        let store = Self::new();
        for identity in identities {
            store.upsert(identity);
        }
        store
    }

    /// Loads a JSON array of identities.
    ///
    /// The file is rewritten after each merge so merged identities survive
    /// a restart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OperationFailed`] if the file cannot be read or parsed.
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::operation("read_identities", format!("{}: {e}", path.display())))?;
        let identities: Vec<Identity> = serde_json::from_str(&content)
            .map_err(|e| Error::operation("parse_identities", e))?;
        tracing::info!(
            path = %path.display(),
            count = identities.len(),
            "Loaded identity snapshot"
        );
        let mut store = Self::with_identities(identities);
        store.snapshot = Some(path.to_path_buf());
        Ok(store)
    }

    /// Writes every identity to the snapshot file, if any.
    ///
    /// The content goes to a sibling temporary file first, then replaces the
    /// snapshot.
    fn persist(&self, identities: &BTreeMap<CustomerId, Identity>) -> Result<()> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let all: Vec<&Identity> = identities.values().collect();
        let content = serde_json::to_string_pretty(&all)
            .map_err(|e| Error::operation("serialize_identities", e))?;
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, content)
            .map_err(|e| Error::operation("write_identities", format!("{}: {e}", staging.display())))?;
        std::fs::rename(&staging, path)
            .map_err(|e| Error::operation("write_identities", format!("{}: {e}", path.display())))
    }

    /// Inserts or replaces an identity.
    pub fn upsert(&self, identity: Identity) {
        let mut identities = match self.identities.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        identities.insert(identity.customer_id.clone(), identity);
    }

    /// Removes an identity.
    pub fn remove(&self, customer_id: &CustomerId) -> Option<Identity> {
        let mut identities = match self.identities.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        identities.remove(customer_id)
    }

    /// Number of stored identities, merged ones included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Returns true if the store holds no identity.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<CustomerId, Identity>> {
        match self.identities.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn apply_attribute(
    primary: &mut Identity,
    key: &str,
    attribute: &crate::models::IdentityAttribute,
) -> AttributeChangeStatus {
    match primary.attributes.get(key) {
        None => {
            primary.attributes.insert(key.to_string(), attribute.clone());
            AttributeChangeStatus::Created
        },
        Some(current)
            if current.value == attribute.value
                && current.certification_level >= attribute.certification_level =>
        {
            AttributeChangeStatus::NotUpdated
        },
        Some(_) => {
            primary.attributes.insert(key.to_string(), attribute.clone());
            AttributeChangeStatus::Updated
        },
    }
}

impl IdentityStore for InMemoryIdentityStore {
    fn find_by_customer_id(&self, customer_id: &CustomerId) -> Result<Option<Identity>> {
        Ok(self.read().get(customer_id).cloned())
    }

    fn find_ids_with_attributes(
        &self,
        keys: &[String],
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CustomerId>> {
        Ok(self
            .read()
            .values()
            .filter(|identity| !identity.is_merged() && identity.has_all_attributes(keys))
            .skip(offset)
            .take(limit)
            .map(|identity| identity.customer_id.clone())
            .collect())
    }

    fn search_batch(
        &self,
        customer_ids: &[CustomerId],
        attribute_filter: &[String],
    ) -> Result<Vec<Identity>> {
        let identities = self.read();
        Ok(customer_ids
            .iter()
            .filter_map(|id| identities.get(id))
            .map(|identity| identity.filtered(attribute_filter))
            .collect())
    }

    fn merge(&self, request: &MergeRequest) -> Result<MergeOutcome> {
        let mut identities = match self.identities.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if !identities.contains_key(&request.secondary) {
            return Err(Error::not_found("identity", request.secondary.as_str()));
        }
        let Some(primary) = identities.get_mut(&request.primary) else {
            return Err(Error::not_found("identity", request.primary.as_str()));
        };
        if primary.is_merged() {
            return Err(Error::Conflict(format!(
                "identity {} was already merged",
                request.primary
            )));
        }

        let statuses: Vec<_> = request
            .attribute_overrides
            .iter()
            .map(|(key, attribute)| AttributeMergeStatus {
                key: key.clone(),
                status: apply_attribute(primary, key, attribute),
            })
            .collect();
        primary.last_update_date = Utc::now();
        let merged = primary.clone();

        if let Some(secondary) = identities.get_mut(&request.secondary) {
            secondary.merged_into = Some(request.primary.clone());
            secondary.last_update_date = Utc::now();
        }
        self.persist(&identities)?;

        Ok(MergeOutcome {
            identity: merged,
            statuses,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{IdentityAttribute, MergeStatus, RequestAuthor};

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    fn request(primary: &str, secondary: &str) -> MergeRequest {
        MergeRequest {
            primary: CustomerId::new(primary),
            secondary: CustomerId::new(secondary),
            attribute_overrides: BTreeMap::new(),
            rule_code: "R1".to_string(),
            author: RequestAuthor::application("resolver"),
            client_code: "dedup".to_string(),
        }
    }

    #[test]
    fn test_find_ids_with_attributes_skips_merged_and_pages() {
        let mut merged = Identity::new("C").with_attribute("email", "c@x", 100);
        merged.merged_into = Some(CustomerId::new("A"));
        let store = InMemoryIdentityStore::with_identities([
            Identity::new("A").with_attribute("email", "a@x", 100),
            Identity::new("B").with_attribute("phone", "1", 100),
            merged,
            Identity::new("D").with_attribute("email", "d@x", 100),
        ]);

        let all = store
            .find_ids_with_attributes(&keys(&["email"]), 0, 10)
            .expect("ids");
        assert_eq!(all, [CustomerId::new("A"), CustomerId::new("D")]);

        let second_page = store
            .find_ids_with_attributes(&keys(&["email"]), 1, 1)
            .expect("ids");
        assert_eq!(second_page, [CustomerId::new("D")]);
    }

    #[test]
    fn test_search_batch_filters_attributes() {
        let store = InMemoryIdentityStore::with_identities([Identity::new("A")
            .with_attribute("email", "a@x", 100)
            .with_attribute("phone", "1", 100)]);

        let found = store
            .search_batch(
                &[CustomerId::new("A"), CustomerId::new("missing")],
                &keys(&["email"]),
            )
            .expect("batch");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attributes.len(), 1);
    }

    #[test]
    fn test_merge_applies_overrides_and_marks_secondary() {
        let store = InMemoryIdentityStore::with_identities([
            Identity::new("P")
                .with_attribute("email", "p@x", 100)
                .with_attribute("family_name", "DOE", 500),
            Identity::new("S"),
        ]);

        let mut req = request("P", "S");
        req.attribute_overrides
            .insert("email".to_string(), IdentityAttribute::new("s@x", 300));
        req.attribute_overrides
            .insert("phone".to_string(), IdentityAttribute::new("0600", 100));
        req.attribute_overrides
            .insert("family_name".to_string(), IdentityAttribute::new("DOE", 100));

        let outcome = store.merge(&req).expect("merge");
        let status_of = |key: &str| {
            outcome
                .statuses
                .iter()
                .find(|s| s.key == key)
                .map(|s| s.status)
        };
        assert_eq!(status_of("email"), Some(AttributeChangeStatus::Updated));
        assert_eq!(status_of("phone"), Some(AttributeChangeStatus::Created));
        assert_eq!(status_of("family_name"), Some(AttributeChangeStatus::NotUpdated));
        assert_eq!(outcome.status(), MergeStatus::PartialSuccess);

        let secondary = store
            .find_by_customer_id(&CustomerId::new("S"))
            .expect("find")
            .expect("present");
        assert_eq!(secondary.merged_into, Some(CustomerId::new("P")));
    }

    #[test]
    fn test_merge_unknown_identity_is_not_found() {
        let store = InMemoryIdentityStore::with_identities([Identity::new("P")]);
        assert!(matches!(
            store.merge(&request("P", "S")),
            Err(Error::NotFound { .. })
        ));
        assert!(matches!(
            store.merge(&request("X", "P")),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_load_json_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identities.json");
        std::fs::write(
            &path,
            r#"[
                {"customer_id": "A", "quality": 0.8,
                 "attributes": {"email": {"value": "a@x", "certification_level": 500}}},
                {"customer_id": "B", "connection_id": "conn-1"}
            ]"#,
        )
        .expect("write");

        let store = InMemoryIdentityStore::load_json(&path).expect("load");
        assert_eq!(store.len(), 2);
        let b = store
            .find_by_customer_id(&CustomerId::new("B"))
            .expect("find")
            .expect("present");
        assert!(b.is_connected());
    }

    #[test]
    fn test_merge_is_written_back_to_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("identities.json");
        std::fs::write(&path, r#"[{"customer_id": "P"}, {"customer_id": "S"}]"#)
            .expect("write");

        let store = InMemoryIdentityStore::load_json(&path).expect("load");
        store.merge(&request("P", "S")).expect("merge");

        let reloaded = InMemoryIdentityStore::load_json(&path).expect("reload");
        let secondary = reloaded
            .find_by_customer_id(&CustomerId::new("S"))
            .expect("find")
            .expect("present");
        assert_eq!(secondary.merged_into, Some(CustomerId::new("P")));
        assert!(!dir.path().join("identities.json.tmp").exists());
    }
}
