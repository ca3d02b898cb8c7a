//! Ready-made clusters for tests.

use std::sync::Arc;

use pulsemesh::{ClusterConfig, CoreConfig, NodeName, NullPurge, NullWake, ReplicationCore, Target};

/// A set of replication cores sharing one cluster identity and
/// secret, with no transport attached. Tests shuttle messages with
/// [`pump`] and [`pump_all`].
pub struct TestCluster {
    pub cores: Vec<ReplicationCore>,
}

impl TestCluster {
    /// Build `count` cores named `n0..n{count-1}`.
    pub fn new(count: usize) -> Self {
        let names: Vec<NodeName> = (0..count).map(|i| NodeName::new(format!("n{i}"))).collect();

        let cores = names
            .iter()
            .map(|name| {
                let cluster = ClusterConfig {
                    cluster_name: "testkit".into(),
                    node_name: name.clone(),
                    nodes: names.clone(),
                };
                ReplicationCore::new(
                    CoreConfig::new(cluster, b"testkit secret".to_vec()),
                    Arc::new(NullWake),
                    Arc::new(NullPurge),
                )
            })
            .collect();

        Self { cores }
    }

    pub fn core(&self, index: usize) -> &ReplicationCore {
        &self.cores[index]
    }

    pub fn name(&self, index: usize) -> NodeName {
        NodeName::new(format!("n{index}"))
    }
}

/// Deliver one heartbeat from one core to another, as a transport
/// would: build, seal, open, apply. Returns false when the sender had
/// nothing to say.
pub fn pump(from: &ReplicationCore, to: &ReplicationCore) -> bool {
    let target = to.engine().node_name().clone();
    let wire = from
        .engine()
        .build_outbound(Target::Peer(&target))
        .expect("sealing cannot fail in fixtures");
    let Some(wire) = wire else {
        return false;
    };

    let (sender, message) = to
        .engine()
        .open_wire(&wire)
        .expect("fixture cores share a secret");
    to.engine().note_beat_rx("testkit", &sender);
    to.engine().apply(&sender, &message);
    true
}

/// One full exchange round: every ordered pair pumps once.
pub fn pump_all(cluster: &TestCluster) {
    for from in 0..cluster.cores.len() {
        for to in 0..cluster.cores.len() {
            if from != to {
                pump(cluster.core(from), cluster.core(to));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pump_carries_status() {
        let cluster = TestCluster::new(2);
        cluster
            .core(0)
            .set_local_status(json!({"state": "up"}))
            .unwrap();

        assert!(pump(cluster.core(0), cluster.core(1)));

        let dataset = cluster.core(1).dataset();
        assert_eq!(dataset[&cluster.name(0)]["state"], "up");
    }

    #[test]
    fn test_pump_without_status_is_silent() {
        let cluster = TestCluster::new(2);
        assert!(!pump(cluster.core(0), cluster.core(1)));
    }
}
