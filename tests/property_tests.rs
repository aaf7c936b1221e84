//! Property-based tests for merge eligibility and rule ordering.
//!
//! - Strict duplication is symmetric and insensitive to case and padding
//! - Any case-insensitive difference on a shared key is a conflict
//! - Ranking puts connected identities first, then the best quality

// Property tests use expect/unwrap for simplicity - panics are acceptable in tests
#![allow(clippy::expect_used, clippy::unwrap_used)]

use identity_dedup::models::Identity;
use identity_dedup::services::{attribute_deltas, first_conflict, is_strict_duplicate, rank_for_merge};
use proptest::collection::btree_map;
use proptest::prelude::*;
use std::collections::BTreeMap;

fn identity(id: &str, attributes: &BTreeMap<String, String>) -> Identity {
    attributes
        .iter()
        .fold(Identity::new(id), |identity, (key, value)| {
            identity.with_attribute(key.as_str(), value.as_str(), 100)
        })
}

fn attributes() -> impl Strategy<Value = BTreeMap<String, String>> {
    btree_map("[a-e]", "[a-cA-C]{1,3}", 0..5)
}

proptest! {
    /// Property: strict duplication does not depend on argument order.
    #[test]
    fn prop_strict_duplicate_is_symmetric(a in attributes(), b in attributes()) {
        let left = identity("A", &a);
        let right = identity("B", &b);
        prop_assert_eq!(is_strict_duplicate(&left, &right), is_strict_duplicate(&right, &left));
    }

    /// Property: a shared key with case-insensitively distinct values is
    /// always rejected, whatever else the identities hold.
    #[test]
    fn prop_distinct_shared_value_rejects(
        a in attributes(),
        b in attributes(),
        key in "[a-e]",
        left_value in "[a-c]{1,3}",
        right_value in "[a-c]{1,3}",
    ) {
        prop_assume!(left_value != right_value);
        let mut a = a;
        let mut b = b;
        a.insert(key.clone(), left_value);
        b.insert(key, right_value.to_uppercase());
        prop_assert!(!is_strict_duplicate(&identity("A", &a), &identity("B", &b)));
        prop_assert!(!is_strict_duplicate(&identity("B", &b), &identity("A", &a)));
    }

    /// Property: changing case or padding never creates a conflict.
    #[test]
    fn prop_case_and_padding_are_ignored(a in attributes()) {
        let shouted: BTreeMap<String, String> = a
            .iter()
            .map(|(k, v)| (k.clone(), format!("  {}  ", v.to_uppercase())))
            .collect();
        prop_assert!(first_conflict(&identity("A", &a), &identity("B", &shouted)).is_none());
    }

    /// Property: deltas never overwrite a primary value with a blank one.
    #[test]
    fn prop_deltas_carry_only_non_blank_values(a in attributes(), b in attributes()) {
        let deltas = attribute_deltas(&identity("A", &a), &identity("B", &b));
        prop_assert!(deltas.values().all(|attribute| !attribute.value.trim().is_empty()));
        prop_assert!(deltas.keys().all(|key| b.contains_key(key)));
    }

    /// Property: ranking is connected first, then quality descending.
    #[test]
    fn prop_rank_orders_connected_then_quality(
        entries in proptest::collection::vec((any::<bool>(), 0.0f64..1.0), 1..8)
    ) {
        let mut identities: Vec<Identity> = entries
            .iter()
            .enumerate()
            .map(|(n, (connected, quality))| {
                let identity = Identity::new(format!("C{n}")).with_quality(*quality);
                if *connected { identity.with_connection("acct") } else { identity }
            })
            .collect();
        rank_for_merge(&mut identities);

        for pair in identities.windows(2) {
            let (first, second) = (&pair[0], &pair[1]);
            prop_assert!(first.is_connected() >= second.is_connected());
            if first.is_connected() == second.is_connected() {
                prop_assert!(first.quality >= second.quality);
            }
        }
    }
}
