//! The merged cluster dataset.

use std::collections::BTreeMap;

use serde_json::Value;

use pulsemesh_core::{apply_edits, EditError, EditOp, NodeName};

/// One status sub-tree per node, keyed by node name.
///
/// Ownership is split: the local committer writes only this node's
/// key; every other key is written exclusively by the protocol engine
/// as peer data arrives. Readers take the shared lock for a
/// consistent snapshot.
#[derive(Debug, Default)]
pub struct ClusterDataset {
    nodes: BTreeMap<NodeName, Value>,
}

impl ClusterDataset {
    /// Empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// A node's sub-tree, if we hold one.
    pub fn get(&self, node: &NodeName) -> Option<&Value> {
        self.nodes.get(node)
    }

    /// Whether we hold any data for `node`.
    pub fn contains(&self, node: &NodeName) -> bool {
        self.nodes.contains_key(node)
    }

    /// Replace a node's sub-tree wholesale.
    pub fn set(&mut self, node: NodeName, tree: Value) {
        self.nodes.insert(node, tree);
    }

    /// Apply an edit script to a node's sub-tree in order.
    ///
    /// The sub-tree is created as an empty map on first touch. On
    /// failure the partially-edited tree is left in place; the caller
    /// resets the peer, and the next full replaces it.
    pub fn apply_ops(&mut self, node: &NodeName, ops: &[EditOp]) -> Result<(), EditError> {
        let tree = self
            .nodes
            .entry(node.clone())
            .or_insert_with(|| Value::Object(Default::default()));
        apply_edits(tree, ops)
    }

    /// Names of every node we hold data for.
    pub fn names(&self) -> impl Iterator<Item = &NodeName> {
        self.nodes.keys()
    }

    /// Deep copy of the whole dataset for external readers.
    pub fn snapshot(&self) -> BTreeMap<NodeName, Value> {
        self.nodes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_apply_ops_creates_subtree() {
        let mut dataset = ClusterDataset::new();
        let peer = NodeName::new("n2");

        dataset
            .apply_ops(&peer, &[EditOp::set(vec!["frozen".into()], json!(true))])
            .unwrap();

        assert_eq!(dataset.get(&peer).unwrap()["frozen"], json!(true));
    }

    #[test]
    fn test_set_replaces_wholesale() {
        let mut dataset = ClusterDataset::new();
        let peer = NodeName::new("n2");

        dataset.set(peer.clone(), json!({"a": 1}));
        dataset.set(peer.clone(), json!({"b": 2}));

        assert_eq!(dataset.get(&peer).unwrap(), &json!({"b": 2}));
    }

    #[test]
    fn test_failed_ops_error_out() {
        let mut dataset = ClusterDataset::new();
        let peer = NodeName::new("n2");
        dataset.set(peer.clone(), json!({"scalar": 5}));

        let bad = EditOp::set(vec!["scalar".into(), "inner".into()], json!(1));
        assert!(dataset.apply_ops(&peer, &[bad]).is_err());
    }
}
