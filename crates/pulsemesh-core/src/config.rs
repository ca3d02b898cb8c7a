//! Typed configuration consumed from the node agent.
//!
//! The core never parses configuration files; the embedding agent
//! hands it these structs already validated.

use std::time::Duration;

use crate::node::NodeName;

/// Cluster identity and membership, shared by every transport.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster name, mixed into envelope key derivation.
    pub cluster_name: String,
    /// This node's name.
    pub node_name: NodeName,
    /// Configured cluster members, this node included. Transports may
    /// discover additional members at runtime.
    pub nodes: Vec<NodeName>,
}

impl ClusterConfig {
    /// Configured peers: every member except this node.
    pub fn peers(&self) -> impl Iterator<Item = &NodeName> {
        self.nodes.iter().filter(move |n| **n != self.node_name)
    }
}

/// Heartbeat timing, per transport instance.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatTiming {
    /// Transmit period.
    pub period: Duration,
    /// Silence after which a peer stops beating on this transport.
    pub timeout: Duration,
}

impl Default for HeartbeatTiming {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            timeout: Duration::from_secs(15),
        }
    }
}
