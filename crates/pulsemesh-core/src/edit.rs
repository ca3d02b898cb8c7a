//! Path-level edit operations over status trees.
//!
//! A patch is an ordered sequence of [`EditOp`]s taking a node's
//! sub-tree from generation N-1 to N. Application is order-preserving
//! and not commutative, which is why the protocol engine must detect
//! generation gaps before applying anything.
//!
//! Wire form (inside a patch message): `[path]` deletes the node at
//! `path`, `[path, value]` sets or creates it.

use serde::de::Error as DeError;
use serde::ser::SerializeSeq;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::EditError;

/// One set-or-delete operation addressed by a key path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOp {
    /// Key path from the sub-tree root, outermost first.
    pub path: Vec<String>,
    /// `Some` sets or creates the value at `path`; `None` deletes it.
    pub value: Option<Value>,
}

impl EditOp {
    /// A set-or-create operation.
    pub fn set(path: Vec<String>, value: Value) -> Self {
        Self {
            path,
            value: Some(value),
        }
    }

    /// A delete operation.
    pub fn delete(path: Vec<String>) -> Self {
        Self { path, value: None }
    }
}

impl Serialize for EditOp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let len = if self.value.is_some() { 2 } else { 1 };
        let mut seq = serializer.serialize_seq(Some(len))?;
        seq.serialize_element(&self.path)?;
        if let Some(value) = &self.value {
            seq.serialize_element(value)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for EditOp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let parts: Vec<Value> = Vec::deserialize(deserializer)?;
        if parts.is_empty() || parts.len() > 2 {
            return Err(D::Error::custom(format!(
                "edit op must have 1 or 2 elements, got {}",
                parts.len()
            )));
        }
        let mut parts = parts.into_iter();
        let path: Vec<String> =
            serde_json::from_value(parts.next().expect("len checked")).map_err(D::Error::custom)?;
        Ok(EditOp {
            path,
            value: parts.next(),
        })
    }
}

/// Apply one edit operation to a tree.
pub fn apply_edit(root: &mut Value, op: &EditOp) -> Result<(), EditError> {
    match &op.value {
        Some(value) => set_at(root, &op.path, value.clone()),
        None => delete_at(root, &op.path),
    }
}

/// Apply edits in order, stopping at the first failure.
///
/// On error the tree is left as the already-applied prefix produced
/// it; the caller is expected to discard it and resync.
pub fn apply_edits(root: &mut Value, ops: &[EditOp]) -> Result<(), EditError> {
    for op in ops {
        apply_edit(root, op)?;
    }
    Ok(())
}

fn set_at(root: &mut Value, path: &[String], value: Value) -> Result<(), EditError> {
    let Some((last, parents)) = path.split_last() else {
        *root = value;
        return Ok(());
    };

    let mut cursor = root;
    for key in parents {
        if cursor.is_null() {
            *cursor = Value::Object(Map::new());
        }
        cursor = cursor
            .as_object_mut()
            .ok_or_else(|| EditError::NotAMap(key.clone()))?
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()));
    }

    if cursor.is_null() {
        *cursor = Value::Object(Map::new());
    }
    cursor
        .as_object_mut()
        .ok_or_else(|| EditError::NotAMap(last.clone()))?
        .insert(last.clone(), value);
    Ok(())
}

fn delete_at(root: &mut Value, path: &[String]) -> Result<(), EditError> {
    let (last, parents) = path.split_last().ok_or(EditError::EmptyPath)?;

    let mut cursor = root;
    for key in parents {
        cursor = cursor
            .as_object_mut()
            .ok_or_else(|| EditError::NotAMap(key.clone()))?
            .get_mut(key)
            .ok_or_else(|| EditError::MissingPath(key.clone()))?;
    }

    cursor
        .as_object_mut()
        .ok_or_else(|| EditError::NotAMap(last.clone()))?
        .remove(last)
        .ok_or_else(|| EditError::MissingPath(last.clone()))?;
    Ok(())
}

/// Compute the edits that take `old` to `new`.
///
/// Recurses into maps on both sides; anything else that differs is
/// replaced wholesale. Key order is deterministic, so the same pair of
/// trees always yields the same script.
pub fn diff_trees(old: &Value, new: &Value) -> Vec<EditOp> {
    let mut ops = Vec::new();
    diff_into(&mut ops, &mut Vec::new(), old, new);
    ops
}

fn diff_into(ops: &mut Vec<EditOp>, path: &mut Vec<String>, old: &Value, new: &Value) {
    match (old.as_object(), new.as_object()) {
        (Some(old_map), Some(new_map)) => {
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    let mut deleted = path.clone();
                    deleted.push(key.clone());
                    ops.push(EditOp::delete(deleted));
                }
            }
            for (key, new_value) in new_map {
                match old_map.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => {
                        path.push(key.clone());
                        diff_into(ops, path, old_value, new_value);
                        path.pop();
                    }
                    None => {
                        let mut added = path.clone();
                        added.push(key.clone());
                        ops.push(EditOp::set(added, new_value.clone()));
                    }
                }
            }
        }
        _ => {
            if old != new {
                ops.push(EditOp::set(path.clone(), new.clone()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_edit_op_wire_forms() {
        let set = EditOp::set(vec!["services".into(), "web".into()], json!("up"));
        assert_eq!(
            serde_json::to_value(&set).unwrap(),
            json!([["services", "web"], "up"])
        );

        let delete = EditOp::delete(vec!["frozen".into()]);
        assert_eq!(serde_json::to_value(&delete).unwrap(), json!([["frozen"]]));

        let back: EditOp = serde_json::from_value(json!([["services", "web"], "up"])).unwrap();
        assert_eq!(back, set);
        let back: EditOp = serde_json::from_value(json!([["frozen"]])).unwrap();
        assert_eq!(back, delete);
    }

    #[test]
    fn test_edit_op_rejects_bad_arity() {
        assert!(serde_json::from_value::<EditOp>(json!([])).is_err());
        assert!(serde_json::from_value::<EditOp>(json!([["a"], 1, 2])).is_err());
    }

    #[test]
    fn test_set_creates_intermediate_maps() {
        let mut tree = json!({});
        let op = EditOp::set(vec!["a".into(), "b".into(), "c".into()], json!(1));
        apply_edit(&mut tree, &op).unwrap();
        assert_eq!(tree, json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut tree = json!({"a": 5});
        let op = EditOp::set(vec!["a".into(), "b".into()], json!(1));
        assert!(matches!(
            apply_edit(&mut tree, &op),
            Err(EditError::NotAMap(_))
        ));
    }

    #[test]
    fn test_delete_missing_fails() {
        let mut tree = json!({"a": 1});
        let op = EditOp::delete(vec!["b".into()]);
        assert!(matches!(
            apply_edit(&mut tree, &op),
            Err(EditError::MissingPath(_))
        ));
    }

    #[test]
    fn test_delete_root_fails() {
        let mut tree = json!({"a": 1});
        assert!(matches!(
            apply_edit(&mut tree, &EditOp::delete(vec![])),
            Err(EditError::EmptyPath)
        ));
    }

    #[test]
    fn test_set_empty_path_replaces_root() {
        let mut tree = json!({"old": true});
        apply_edit(&mut tree, &EditOp::set(vec![], json!({"new": true}))).unwrap();
        assert_eq!(tree, json!({"new": true}));
    }

    #[test]
    fn test_diff_then_apply_converges() {
        let old = json!({
            "state": "up",
            "services": {"web": {"status": "up"}, "db": {"status": "up"}},
            "frozen": false,
        });
        let new = json!({
            "state": "up",
            "services": {"web": {"status": "down"}, "cache": {"status": "up"}},
        });

        let ops = diff_trees(&old, &new);
        let mut tree = old.clone();
        apply_edits(&mut tree, &ops).unwrap();
        assert_eq!(tree, new);
    }

    #[test]
    fn test_diff_equal_trees_is_empty() {
        let tree = json!({"a": {"b": 1}});
        assert!(diff_trees(&tree, &tree).is_empty());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn arb_tree() -> impl Strategy<Value = Value> {
            let leaf = prop_oneof![
                Just(Value::Null),
                any::<bool>().prop_map(Value::from),
                any::<i32>().prop_map(Value::from),
                "[a-z]{0,6}".prop_map(Value::from),
            ];
            leaf.prop_recursive(3, 24, 4, |inner| {
                proptest::collection::btree_map("[a-z]{1,4}", inner, 0..4).prop_map(|m| {
                    Value::Object(m.into_iter().collect())
                })
            })
        }

        proptest! {
            #[test]
            fn diff_apply_roundtrip(old in arb_tree(), new in arb_tree()) {
                let ops = diff_trees(&old, &new);
                let mut tree = old.clone();
                apply_edits(&mut tree, &ops).unwrap();
                prop_assert_eq!(tree, new);
            }
        }
    }
}
