//! The heartbeat protocol state machine.

use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use pulsemesh_core::{
    epoch_now, ClusterConfig, EditOp, Heartbeat, NodeName, PeerPurge, WakeSink, PROTOCOL_COMPAT,
};
use pulsemesh_secure::{Envelope, SealError};
use pulsemesh_state::{ChangeEvent, Shared};

use crate::error::EngineError;

/// Engine policy knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Peer lifecycle states treated as transitional on full resync:
    /// while a peer reports one of these, its previously known
    /// service-status view is preserved rather than overwritten.
    pub transitional_states: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transitional_states: vec!["init".into(), "maintenance".into(), "upgrade".into()],
        }
    }
}

/// Who an outbound message is built for.
#[derive(Debug, Clone, Copy)]
pub enum Target<'a> {
    /// One addressed peer.
    Peer(&'a NodeName),
    /// A message every peer will read (a shared slot, a multicast
    /// datagram). The most behind peer drives the kind choice.
    Broadcast,
}

/// What an inbound message did to the shared state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Dataset changed; the wake sink was invoked once.
    Changed,
    /// Nothing new (already installed, or empty keep-alive patch).
    Unchanged,
    /// Judged unsynchronizable; a full resync was requested instead.
    Desynced,
    /// Our own message heard back; dropped.
    SelfEcho,
}

/// The transport-agnostic protocol engine.
///
/// One instance serves every transport; all state it touches lives in
/// [`Shared`] behind the process-wide lock. The wake sink is invoked
/// after the lock is released.
pub struct Engine {
    shared: Arc<Shared>,
    envelope: Envelope,
    cluster: ClusterConfig,
    config: EngineConfig,
    wake: Arc<dyn WakeSink>,
    purge: Arc<dyn PeerPurge>,
}

impl Engine {
    pub fn new(
        shared: Arc<Shared>,
        envelope: Envelope,
        cluster: ClusterConfig,
        config: EngineConfig,
        wake: Arc<dyn WakeSink>,
        purge: Arc<dyn PeerPurge>,
    ) -> Self {
        Self {
            shared,
            envelope,
            cluster,
            config,
            wake,
            purge,
        }
    }

    /// This node's name.
    pub fn node_name(&self) -> &NodeName {
        &self.cluster.node_name
    }

    /// Cluster membership as configured.
    pub fn cluster(&self) -> &ClusterConfig {
        &self.cluster
    }

    /// Shared state handle, for transports' beat bookkeeping.
    pub fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Decrypt an inbound envelope on a transport's behalf.
    pub fn open_wire(&self, wire: &[u8]) -> Result<(NodeName, Heartbeat), SealError> {
        self.envelope.open(wire)
    }

    /// Record a successful receive from `peer` on a transport.
    pub fn note_beat_rx(&self, transport: &str, peer: &NodeName) {
        self.shared.lock().beats.note_rx(transport, peer, epoch_now());
    }

    /// Record the outcome of a transmit tick.
    pub fn note_beat_tx(&self, transport: &str, success: bool) {
        let me = self.cluster.node_name.clone();
        self.shared
            .lock()
            .beats
            .note_tx(transport, &me, success, epoch_now());
    }

    /// Re-evaluate liveness on one transport; peers that just went
    /// silent get their cached results purged.
    pub fn evaluate_beats(&self, transport: &str, timeout: std::time::Duration) {
        let stale = self
            .shared
            .lock()
            .beats
            .evaluate(transport, timeout.as_secs_f64(), epoch_now());
        for peer in &stale {
            self.purge.forget_peer_data(peer);
        }
    }

    // ─────────────────────────────────────────────────────────────────
    // Outbound
    // ─────────────────────────────────────────────────────────────────

    /// Build the sealed heartbeat to send next, or `None` when there
    /// is genuinely nothing to report yet.
    pub fn build_outbound(&self, target: Target<'_>) -> Result<Option<Vec<u8>>, EngineError> {
        let me = self.cluster.node_name.clone();
        let mut inner = self.shared.lock();

        let (begin, count) = match target {
            Target::Peer(peer) => inner.gens.oldest_unacked_gen(peer),
            Target::Broadcast => {
                let mut peers: Vec<NodeName> = self.cluster.peers().cloned().collect();
                for discovered in inner.gens.known_peers() {
                    if !peers.contains(&discovered) {
                        peers.push(discovered);
                    }
                }
                inner.gens.oldest_unacked_broadcast(peers.into_iter())
            }
        };

        let Some(own_tree) = inner.dataset.get(&me).cloned() else {
            // Own status not initialized: better silence than garbage.
            return Ok(None);
        };

        let gen_vector = inner.gens.gen_vector(&me);
        let local_gen = inner.gens.local_gen();

        if count == 0 {
            let ping = Heartbeat::Ping {
                node: me,
                compat: PROTOCOL_COMPAT,
                gen: gen_vector,
                updated: epoch_now(),
                monitor: monitor_view(&own_tree),
            };
            return Ok(Some(self.envelope.seal(&ping)?));
        }

        if begin == 0 || begin > local_gen || !inner.gens.journal_covers(begin) {
            let full = Heartbeat::Full {
                node: me,
                compat: PROTOCOL_COMPAT,
                gen: gen_vector,
                updated: epoch_now(),
                payload: own_tree,
            };
            let envelope = &self.envelope;
            let wire = inner.full_cache.get_or_build(|| envelope.seal(&full))?;
            return Ok(Some(wire));
        }

        let patch = Heartbeat::Patch {
            node: me,
            compat: PROTOCOL_COMPAT,
            gen: gen_vector,
            updated: epoch_now(),
            deltas: inner.gens.deltas_after(begin),
        };
        Ok(Some(self.envelope.seal(&patch)?))
    }

    // ─────────────────────────────────────────────────────────────────
    // Inbound
    // ─────────────────────────────────────────────────────────────────

    /// Merge one decrypted heartbeat into the shared state.
    ///
    /// Never fails: desync, gaps, and edit failures all degrade to a
    /// resync request recorded in the peer table.
    pub fn apply(&self, peer: &NodeName, message: &Heartbeat) -> ApplyOutcome {
        if *peer == self.cluster.node_name {
            return ApplyOutcome::SelfEcho;
        }

        let me = self.cluster.node_name.clone();
        let outcome;
        {
            let mut inner = self.shared.lock();

            // The gen vector doubles as the peer's ack of our own
            // journal, whatever the message kind.
            inner.gens.record_peer_ack(peer, message.claims_of(&me));

            outcome = match message {
                Heartbeat::Ping { monitor, .. } => self.apply_ping(&mut inner, peer, monitor),
                Heartbeat::Full { payload, .. } => {
                    self.apply_full(&mut inner, peer, message.declared_gen(), payload)
                }
                Heartbeat::Patch { deltas, .. } => {
                    self.apply_patch(&mut inner, peer, message.declared_gen(), deltas)
                }
            };

            if outcome == ApplyOutcome::Changed {
                // Our next full must carry the refreshed gen vector.
                inner.full_cache.invalidate();
            }
        }

        if outcome == ApplyOutcome::Changed {
            self.wake.data_changed();
        }
        outcome
    }

    fn apply_ping(
        &self,
        inner: &mut pulsemesh_state::SharedInner,
        peer: &NodeName,
        monitor: &Value,
    ) -> ApplyOutcome {
        // The peer announced it has no prior record of us; our next
        // message to it will be a full.
        inner.gens.reset_peer(peer);

        if inner.dataset.get(peer) == Some(monitor) {
            return ApplyOutcome::Unchanged;
        }
        debug!(%peer, "ping snapshot installed");
        inner.dataset.set(peer.clone(), monitor.clone());
        inner.events.push(ChangeEvent {
            node: peer.clone(),
            kind: "ping",
            data: monitor.clone(),
        });
        ApplyOutcome::Changed
    }

    fn apply_full(
        &self,
        inner: &mut pulsemesh_state::SharedInner,
        peer: &NodeName,
        declared: u64,
        payload: &Value,
    ) -> ApplyOutcome {
        let current = inner.gens.peer(peer).map(|p| p.remote_gen).unwrap_or(0);
        if declared == current && inner.dataset.contains(peer) {
            return ApplyOutcome::Unchanged;
        }

        let mut installed = payload.clone();
        if self.is_transitional(payload) {
            if let Some(services) = inner
                .dataset
                .get(peer)
                .and_then(|tree| tree.get("services"))
                .cloned()
            {
                // The peer is mid-lifecycle; keep the last settled
                // service view instead of its transitional noise.
                info!(%peer, "preserving service view across transitional full");
                merge_key(&mut installed, "services", services);
            }
        }

        inner.dataset.set(peer.clone(), installed.clone());
        inner.gens.record_peer_installed(peer, declared);
        inner.events.push(ChangeEvent {
            node: peer.clone(),
            kind: "full",
            data: installed,
        });
        ApplyOutcome::Changed
    }

    fn apply_patch(
        &self,
        inner: &mut pulsemesh_state::SharedInner,
        peer: &NodeName,
        declared: u64,
        deltas: &std::collections::BTreeMap<u64, Vec<EditOp>>,
    ) -> ApplyOutcome {
        let mut current = inner.gens.peer(peer).map(|p| p.remote_gen).unwrap_or(0);

        let pending: Vec<(&u64, &Vec<EditOp>)> = deltas.range(current + 1..).collect();
        let Some((&first, _)) = pending.first() else {
            // Keep-alive or redundant redelivery; nothing newer.
            return ApplyOutcome::Unchanged;
        };

        if first - 1 != current {
            warn!(%peer, have = current, first, "generation gap, requesting full resync");
            inner.gens.reset_peer(peer);
            return ApplyOutcome::Desynced;
        }

        for (&gen, ops) in pending {
            if let Err(e) = inner.dataset.apply_ops(peer, ops) {
                warn!(%peer, gen, error = %e, "edit failed, requesting full resync");
                inner.gens.reset_peer(peer);
                return ApplyOutcome::Desynced;
            }
            current = gen;
            inner.events.push(ChangeEvent {
                node: peer.clone(),
                kind: "patch",
                data: serde_json::to_value(ops).unwrap_or(Value::Null),
            });
        }

        inner.gens.record_peer_installed(peer, current);
        if current != declared {
            debug!(%peer, current, declared, "journal ahead of deltas");
        }
        ApplyOutcome::Changed
    }

    fn is_transitional(&self, payload: &Value) -> bool {
        payload
            .get("state")
            .and_then(Value::as_str)
            .map(|state| self.config.transitional_states.iter().any(|t| t == state))
            .unwrap_or(false)
    }
}

/// The minimal own-status view a ping carries.
fn monitor_view(tree: &Value) -> Value {
    let mut view = Map::new();
    for key in ["state", "frozen"] {
        if let Some(value) = tree.get(key) {
            view.insert(key.to_string(), value.clone());
        }
    }
    Value::Object(view)
}

/// Set `key` in `tree`, turning a non-map tree into a map first.
fn merge_key(tree: &mut Value, key: &str, value: Value) {
    if !tree.is_object() {
        *tree = Value::Object(Map::new());
    }
    tree.as_object_mut()
        .expect("coerced to object")
        .insert(key.to_string(), value);
}
