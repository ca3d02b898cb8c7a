//! # Pulsemesh
//!
//! A cluster node agent's state-replication core: every node keeps a
//! status sub-tree, heartbeat transports carry it to every other
//! node, and a generation-vector protocol keeps the merged view
//! eventually consistent while sending mostly small patches.
//!
//! ## Overview
//!
//! ```text
//!  committer ──▶ ReplicationCore ──▶ disk tx/rx  ──▶ shared device
//!                     │         └──▶ mcast tx/rx ──▶ UDP multicast
//!                     ▼
//!            merged dataset, beating(peer), change events
//! ```
//!
//! The embedding agent commits its own status with
//! [`ReplicationCore::set_local_status`], spawns the transports it has
//! configured, and consumes the merged dataset plus the wake signal.
//! There is no coordinator and no consensus: per sub-tree, the owning
//! node is the single writer and last writer wins.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pulsemesh::{CoreConfig, ReplicationCore};
//! use pulsemesh_core::{ClusterConfig, NodeName, NullPurge, NullWake};
//! use pulsemesh_transport::DiskConfig;
//!
//! # async fn example() -> Result<(), pulsemesh::Error> {
//! let config = CoreConfig::new(
//!     ClusterConfig {
//!         cluster_name: "prod".into(),
//!         node_name: NodeName::new("n1"),
//!         nodes: vec![NodeName::new("n1"), NodeName::new("n2")],
//!     },
//!     b"pre-shared secret".to_vec(),
//! );
//! let core = ReplicationCore::new(config, Arc::new(NullWake), Arc::new(NullPurge));
//!
//! core.set_local_status(serde_json::json!({"state": "up"}))?;
//! core.spawn_disk(DiskConfig::new("/dev/disk/by-id/cluster-hb"))?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod error;

pub use crate::core::{CoreConfig, ReplicationCore};
pub use error::Error;

pub use pulsemesh_core::{
    ClusterConfig, EditOp, HeartbeatTiming, NodeName, NullPurge, NullWake, PeerPurge, WakeSink,
};
pub use pulsemesh_proto::{ApplyOutcome, Engine, Target};
pub use pulsemesh_state::ChangeEvent;
pub use pulsemesh_transport::{DiskConfig, McastConfig, SlotLayout, StatsSnapshot};
