//! Proptest strategies over status trees and edit scripts.

use proptest::prelude::*;
use serde_json::Value;

use pulsemesh_core::{diff_trees, EditOp};

/// A status tree the way node agents actually shape them: a map at
/// the root, scalars and nested maps below.
pub fn arb_status_tree() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        (0u32..10_000u32).prop_map(Value::from),
        "[a-z]{1,8}".prop_map(Value::from),
    ];
    leaf.prop_recursive(3, 32, 5, |inner| {
        proptest::collection::btree_map("[a-z]{1,6}", inner, 0..5)
            .prop_map(|map| Value::Object(map.into_iter().collect()))
    })
    .prop_map(|tree| match tree {
        Value::Object(_) => tree,
        other => serde_json::json!({ "value": other }),
    })
}

/// An edit script between two generated trees, paired with both
/// endpoints so convergence can be asserted.
pub fn arb_edit_script() -> impl Strategy<Value = (Value, Value, Vec<EditOp>)> {
    (arb_status_tree(), arb_status_tree())
        .prop_map(|(old, new)| {
            let script = diff_trees(&old, &new);
            (old, new, script)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsemesh_core::apply_edits;

    proptest! {
        #[test]
        fn generated_scripts_converge((old, new, script) in arb_edit_script()) {
            let mut tree = old;
            apply_edits(&mut tree, &script).unwrap();
            prop_assert_eq!(tree, new);
        }

        #[test]
        fn generated_trees_are_maps(tree in arb_status_tree()) {
            prop_assert!(tree.is_object());
        }
    }
}
