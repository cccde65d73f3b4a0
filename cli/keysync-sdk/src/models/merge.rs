use indexmap::IndexMap;
use keysync_core::SecretTree;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum MergeError {
    #[error("merged value exceeds the configured limit of {limit} nodes")]
    BoundExceeded { limit: usize },
}

/// Compose `overlay` over `base`.
///
/// - mappings union: shared keys recurse, base keys keep their original
///   order, overlay-only keys follow in theirs
/// - sequences concatenate, base first, duplicates preserved
/// - sets union, first occurrence wins
/// - scalars and type mismatches: overlay replaces wholesale
/// - an explicit null in the overlay replaces; an absent key does not
///
/// The fold is left-to-right deterministic and not commutative; the
/// empty mapping is a left identity.
pub fn merge(base: &SecretTree, overlay: &SecretTree) -> SecretTree {
    match (base, overlay) {
        (SecretTree::Mapping(base_entries), SecretTree::Mapping(overlay_entries)) => {
            let mut merged = IndexMap::with_capacity(base_entries.len() + overlay_entries.len());
            for (key, base_value) in base_entries {
                let value = match overlay_entries.get(key) {
                    Some(overlay_value) => merge(base_value, overlay_value),
                    None => base_value.clone(),
                };
                merged.insert(key.clone(), value);
            }
            for (key, overlay_value) in overlay_entries {
                if !base_entries.contains_key(key) {
                    merged.insert(key.clone(), overlay_value.clone());
                }
            }
            SecretTree::Mapping(merged)
        },
        (SecretTree::Sequence(base_items), SecretTree::Sequence(overlay_items)) => {
            let mut items = base_items.clone();
            items.extend(overlay_items.iter().cloned());
            SecretTree::Sequence(items)
        },
        (SecretTree::Set(base_items), SecretTree::Set(overlay_items)) => {
            let mut items = base_items.clone();
            for item in overlay_items {
                if !items.contains(item) {
                    items.push(item.clone());
                }
            }
            SecretTree::Set(items)
        },
        (_, overlay) => overlay.clone(),
    }
}

/// [`merge`] with a defensive node limit. The default configuration
/// leaves the limit unset.
pub fn merge_bounded(
    base: &SecretTree,
    overlay: &SecretTree,
    max_nodes: Option<usize>,
) -> Result<SecretTree, MergeError> {
    let merged = merge(base, overlay);
    if let Some(limit) = max_nodes {
        if merged.node_count() > limit {
            return Err(MergeError::BoundExceeded { limit });
        }
    }
    Ok(merged)
}

/// Fold a series of trees left-to-right, starting from the empty
/// mapping.
pub fn merge_all<'a>(trees: impl IntoIterator<Item = &'a SecretTree>) -> SecretTree {
    trees
        .into_iter()
        .fold(SecretTree::empty(), |acc, tree| merge(&acc, tree))
}

#[cfg(test)]
mod tests {
    use keysync_core::test_helpers::{arb_mapping, arb_tree};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    use super::*;

    fn tree(json: &str) -> SecretTree {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn shared_keys_recurse_and_overlay_scalar_wins() {
        let base = tree(r#"{"app": {"timeout": 30, "retries": 3}}"#);
        let overlay = tree(r#"{"app": {"timeout": 60, "debug": true}}"#);
        assert_eq!(
            merge(&base, &overlay),
            tree(r#"{"app": {"timeout": 60, "retries": 3, "debug": true}}"#)
        );
    }

    #[test]
    fn result_key_order_is_base_then_overlay() {
        let base = tree(r#"{"b": 1, "a": 2}"#);
        let overlay = tree(r#"{"z": 3, "a": 4, "c": 5}"#);
        let SecretTree::Mapping(entries) = merge(&base, &overlay) else {
            panic!("expected mapping");
        };
        let keys: Vec<_> = entries.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["b", "a", "z", "c"]);
    }

    #[test]
    fn sequences_concatenate_with_duplicates() {
        let base = tree(r#"{"keys": ["k1", "k2"]}"#);
        let overlay = tree(r#"{"keys": ["k3", "k1"]}"#);
        assert_eq!(
            merge(&base, &overlay),
            tree(r#"{"keys": ["k1", "k2", "k3", "k1"]}"#)
        );
    }

    #[test]
    fn sets_union() {
        let base = SecretTree::set([SecretTree::from("a"), SecretTree::from("b")]);
        let overlay = SecretTree::set([SecretTree::from("b"), SecretTree::from("c")]);
        assert_eq!(
            merge(&base, &overlay),
            SecretTree::set([
                SecretTree::from("a"),
                SecretTree::from("b"),
                SecretTree::from("c"),
            ])
        );
    }

    #[test]
    fn type_mismatch_replaces_wholesale() {
        let base = tree(r#"{"value": {"nested": 1}}"#);
        let overlay = tree(r#"{"value": [1, 2]}"#);
        assert_eq!(merge(&base, &overlay), tree(r#"{"value": [1, 2]}"#));
    }

    #[test]
    fn explicit_null_replaces_but_absent_key_does_not() {
        let base = tree(r#"{"keep": 1, "drop": 2}"#);
        let overlay = tree(r#"{"drop": null}"#);
        assert_eq!(merge(&base, &overlay), tree(r#"{"keep": 1, "drop": null}"#));
    }

    #[test]
    fn merge_all_folds_in_order() {
        let first = tree(r#"{"app": {"timeout": 30}}"#);
        let second = tree(r#"{"app": {"timeout": 60}}"#);
        let third = tree(r#"{"app": {"debug": true}}"#);
        assert_eq!(
            merge_all([&first, &second, &third]),
            tree(r#"{"app": {"timeout": 60, "debug": true}}"#)
        );
    }

    #[test]
    fn bound_is_enforced_when_configured() {
        let base = tree(r#"{"a": [1, 2, 3]}"#);
        let overlay = tree(r#"{"b": [4, 5, 6]}"#);
        assert_eq!(
            merge_bounded(&base, &overlay, Some(3)),
            Err(MergeError::BoundExceeded { limit: 3 })
        );
        assert!(merge_bounded(&base, &overlay, None).is_ok());
    }

    proptest! {
        #[test]
        fn empty_mapping_is_left_identity(value in arb_mapping()) {
            prop_assert_eq!(merge(&SecretTree::empty(), &value), value);
        }

        #[test]
        fn empty_overlay_is_right_identity_for_mappings(value in arb_mapping()) {
            prop_assert_eq!(merge(&value, &SecretTree::empty()), value);
        }

        #[test]
        fn overlay_wins_for_scalars(base in arb_tree(), scalar in "[a-z]{1,8}") {
            let overlay = SecretTree::from(scalar.as_str());
            prop_assert_eq!(merge(&base, &overlay), overlay);
        }

        #[test]
        fn merge_is_deterministic(base in arb_tree(), overlay in arb_tree()) {
            prop_assert_eq!(merge(&base, &overlay), merge(&base, &overlay));
        }

        #[test]
        fn mapping_union_contains_all_keys(base in arb_mapping(), overlay in arb_mapping()) {
            let merged = merge(&base, &overlay);
            let (SecretTree::Mapping(base_entries),
                 SecretTree::Mapping(overlay_entries),
                 SecretTree::Mapping(merged_entries)) = (&base, &overlay, &merged)
            else {
                return Err(TestCaseError::fail("expected mappings"));
            };
            for key in base_entries.keys().chain(overlay_entries.keys()) {
                prop_assert!(merged_entries.contains_key(key));
            }
        }
    }
}
