//! Proptest strategies shared with downstream crates via the `tests` feature.

use indexmap::IndexMap;
use proptest::prelude::*;

use crate::tree::SecretTree;

/// Strategy producing scalar leaves.
pub fn arb_scalar() -> impl Strategy<Value = SecretTree> {
    prop_oneof![
        Just(SecretTree::Null),
        any::<bool>().prop_map(SecretTree::Bool),
        any::<i64>().prop_map(|n| SecretTree::Number(n.into())),
        "[a-z0-9]{0,12}".prop_map(SecretTree::String),
    ]
}

/// Strategy producing bounded-depth secret trees.
pub fn arb_tree() -> impl Strategy<Value = SecretTree> {
    arb_scalar().prop_recursive(3, 24, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(SecretTree::Sequence),
            prop::collection::vec(("[a-z]{1,6}", inner), 0..4).prop_map(|entries| {
                SecretTree::Mapping(entries.into_iter().collect::<IndexMap<_, _>>())
            }),
        ]
    })
}

/// Strategy producing mappings only, the shape most secrets take.
pub fn arb_mapping() -> impl Strategy<Value = SecretTree> {
    prop::collection::vec(("[a-z]{1,6}", arb_tree()), 0..4)
        .prop_map(|entries| SecretTree::Mapping(entries.into_iter().collect::<IndexMap<_, _>>()))
}
