//! The replication core the node agent embeds.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;

use pulsemesh_core::{
    diff_trees, ClusterConfig, EditOp, NodeName, PeerPurge, WakeSink,
};
use pulsemesh_proto::{Engine, EngineConfig};
use pulsemesh_secure::{ClusterSecret, Envelope};
use pulsemesh_state::{ChangeEvent, Shared, SharedInner};
use pulsemesh_transport::{
    disk::DISK_ID, mcast::MCAST_ID, DiskConfig, DiskTransport, McastConfig, McastTransport,
    StatsSnapshot, TransferStats,
};

use crate::error::Error;

/// Configuration of the replication core.
#[derive(Clone)]
pub struct CoreConfig {
    pub cluster: ClusterConfig,
    /// Pre-shared cluster secret; never sent, only derived from.
    pub secret: Vec<u8>,
    pub engine: EngineConfig,
    /// Diff journal bound, in generations.
    pub journal_retention: usize,
    /// Change-event queue bound.
    pub event_capacity: usize,
}

impl CoreConfig {
    /// Defaults around the mandatory cluster identity and secret.
    pub fn new(cluster: ClusterConfig, secret: Vec<u8>) -> Self {
        Self {
            cluster,
            secret,
            engine: EngineConfig::default(),
            journal_retention: pulsemesh_state::gens::DEFAULT_JOURNAL_RETENTION,
            event_capacity: pulsemesh_state::events::DEFAULT_EVENT_CAPACITY,
        }
    }
}

/// Owns the shared state and the transport loops.
///
/// One instance per node agent process. Everything here is cheap to
/// share: clone the `Arc` handles out of it freely.
pub struct ReplicationCore {
    cluster: ClusterConfig,
    shared: Arc<Shared>,
    engine: Arc<Engine>,
    stop: Arc<AtomicBool>,
    /// Wakes transmit loops early when local data changes.
    wake_tx: Arc<Notify>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: Mutex<Vec<(&'static str, Arc<TransferStats>)>>,
}

impl ReplicationCore {
    /// Build the core; no I/O happens until a transport is spawned.
    pub fn new(config: CoreConfig, wake: Arc<dyn WakeSink>, purge: Arc<dyn PeerPurge>) -> Self {
        let shared = Shared::with_bounds(config.journal_retention, config.event_capacity);
        let envelope = Envelope::new(ClusterSecret::derive(
            &config.cluster.cluster_name,
            &config.secret,
        ));
        let engine = Arc::new(Engine::new(
            Arc::clone(&shared),
            envelope,
            config.cluster.clone(),
            config.engine,
            wake,
            purge,
        ));

        Self {
            cluster: config.cluster,
            shared,
            engine,
            stop: Arc::new(AtomicBool::new(false)),
            wake_tx: Arc::new(Notify::new()),
            tasks: Mutex::new(Vec::new()),
            stats: Mutex::new(Vec::new()),
        }
    }

    /// The protocol engine, for custom transports and tests.
    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    // ─────────────────────────────────────────────────────────────────
    // Local commits
    // ─────────────────────────────────────────────────────────────────

    /// Apply an edit script to this node's own sub-tree and advance
    /// the generation. The external status writer's entry point.
    pub fn commit_local(&self, edits: Vec<EditOp>) -> Result<u64, Error> {
        let gen = {
            let mut inner = self.shared.lock();
            self.commit_inner(&mut inner, edits)?
        };
        self.wake_tx.notify_waiters();
        Ok(gen)
    }

    /// Replace this node's own sub-tree, committing the computed
    /// difference. Committing an identical tree is a no-op.
    pub fn set_local_status(&self, tree: Value) -> Result<u64, Error> {
        let me = self.cluster.node_name.clone();
        let (gen, changed) = {
            let mut inner = self.shared.lock();
            let old = inner.dataset.get(&me).cloned().unwrap_or(Value::Null);
            let diff = diff_trees(&old, &tree);
            if diff.is_empty() {
                (inner.gens.local_gen(), false)
            } else {
                (self.commit_inner(&mut inner, diff)?, true)
            }
        };
        if changed {
            self.wake_tx.notify_waiters();
        }
        Ok(gen)
    }

    fn commit_inner(&self, inner: &mut SharedInner, edits: Vec<EditOp>) -> Result<u64, Error> {
        inner.dataset.apply_ops(&self.cluster.node_name, &edits)?;
        let gen = inner.gens.bump_local(edits);
        inner.full_cache.invalidate();
        Ok(gen)
    }

    // ─────────────────────────────────────────────────────────────────
    // Transports
    // ─────────────────────────────────────────────────────────────────

    /// Start the disk transport's transmit and receive loops.
    ///
    /// Must run inside a tokio runtime. A startup failure aborts only
    /// this transport; anything already running keeps going.
    pub fn spawn_disk(&self, config: DiskConfig) -> Result<(), Error> {
        let transport = DiskTransport::open(
            Arc::clone(&self.engine),
            config,
            Arc::clone(&self.stop),
            Arc::clone(&self.wake_tx),
        )?;

        self.stats
            .lock()
            .unwrap()
            .push((DISK_ID, Arc::clone(transport.stats())));
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Arc::clone(&transport).run_tx()));
        tasks.push(tokio::spawn(transport.run_rx()));
        Ok(())
    }

    /// Start the multicast transport's transmit and receive loops.
    pub async fn spawn_mcast(&self, config: McastConfig) -> Result<(), Error> {
        let transport = McastTransport::open(
            Arc::clone(&self.engine),
            config,
            Arc::clone(&self.stop),
            Arc::clone(&self.wake_tx),
        )
        .await?;

        self.stats
            .lock()
            .unwrap()
            .push((MCAST_ID, Arc::clone(transport.stats())));
        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(tokio::spawn(Arc::clone(&transport).run_tx()));
        tasks.push(tokio::spawn(transport.run_rx()));
        Ok(())
    }

    /// Ask every loop to finish its current tick and exit.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.wake_tx.notify_waiters();
    }

    /// Stop and wait for every loop to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock().unwrap());
        for task in tasks {
            let _ = task.await;
        }
        info!("replication core stopped");
    }

    // ─────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────

    /// Whether any transport currently hears this peer.
    pub fn beating(&self, peer: &NodeName) -> bool {
        self.shared.lock().beats.beating(peer)
    }

    /// Consistent snapshot of the merged dataset.
    pub fn dataset(&self) -> BTreeMap<NodeName, Value> {
        self.shared.lock().dataset.snapshot()
    }

    /// This node's current generation.
    pub fn local_gen(&self) -> u64 {
        self.shared.lock().gens.local_gen()
    }

    /// Take every queued change event, oldest first.
    pub fn drain_events(&self) -> Vec<ChangeEvent> {
        self.shared.lock().events.drain()
    }

    /// Per-transport transfer counters.
    pub fn transfer_stats(&self) -> Vec<(&'static str, StatsSnapshot)> {
        self.stats
            .lock()
            .unwrap()
            .iter()
            .map(|(id, stats)| (*id, stats.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use pulsemesh_core::{NullPurge, NullWake};

    fn test_core(node: &str) -> ReplicationCore {
        let cluster = ClusterConfig {
            cluster_name: "c1".into(),
            node_name: NodeName::new(node),
            nodes: vec![NodeName::new("a"), NodeName::new("b")],
        };
        ReplicationCore::new(
            CoreConfig::new(cluster, b"hush".to_vec()),
            Arc::new(NullWake),
            Arc::new(NullPurge),
        )
    }

    #[test]
    fn test_set_local_status_bumps_once() {
        let core = test_core("a");

        assert_eq!(core.local_gen(), 0);
        let gen = core.set_local_status(json!({"state": "up"})).unwrap();
        assert_eq!(gen, 1);

        // Identical tree: no new generation.
        let gen = core.set_local_status(json!({"state": "up"})).unwrap();
        assert_eq!(gen, 1);

        let gen = core.set_local_status(json!({"state": "down"})).unwrap();
        assert_eq!(gen, 2);
    }

    #[test]
    fn test_commit_local_rejects_bad_edit() {
        let core = test_core("a");
        core.set_local_status(json!({"scalar": 1})).unwrap();

        let bad = vec![EditOp::set(vec!["scalar".into(), "x".into()], json!(2))];
        assert!(core.commit_local(bad).is_err());
        // The failed script must not consume a generation.
        assert_eq!(core.local_gen(), 1);
    }

    #[test]
    fn test_unheard_peer_not_beating() {
        let core = test_core("a");
        assert!(!core.beating(&NodeName::new("b")));
    }

    #[test]
    fn test_dataset_snapshot_holds_own_tree() {
        let core = test_core("a");
        core.set_local_status(json!({"state": "up"})).unwrap();

        let snapshot = core.dataset();
        assert_eq!(snapshot[&NodeName::new("a")]["state"], "up");
    }
}
