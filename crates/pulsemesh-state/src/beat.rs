//! Per-transport, per-peer liveness tracking.

use std::collections::HashMap;

use tracing::info;

use pulsemesh_core::NodeName;

/// Liveness record for one (transport, peer) pair.
#[derive(Debug, Clone, Copy)]
pub struct BeatState {
    /// Unix-epoch time of the last successful receive (or transmit,
    /// for the self entry).
    pub last: f64,
    /// True while messages keep arriving within the timeout.
    pub beating: bool,
    /// Whether the last send on this transport succeeded.
    pub success: bool,
}

/// Liveness board across all transports.
///
/// Entries are created lazily on first contact and never removed.
/// Flips are logged exactly once per transition; flipping down also
/// reports the peer so the caller can purge its cached results.
#[derive(Debug, Default)]
pub struct BeatBoard {
    slots: HashMap<(String, NodeName), BeatState>,
}

impl BeatBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful receive from `peer` on `transport`.
    /// Returns true when this flipped the peer back up.
    pub fn note_rx(&mut self, transport: &str, peer: &NodeName, now: f64) -> bool {
        let state = self
            .slots
            .entry((transport.to_string(), peer.clone()))
            .or_insert(BeatState {
                last: now,
                beating: false,
                success: true,
            });
        state.last = now;
        if !state.beating {
            state.beating = true;
            info!(%peer, transport, "peer beating");
            return true;
        }
        false
    }

    /// Record the outcome of a transmit tick (the self entry).
    pub fn note_tx(&mut self, transport: &str, node: &NodeName, success: bool, now: f64) {
        let state = self
            .slots
            .entry((transport.to_string(), node.clone()))
            .or_insert(BeatState {
                last: now,
                beating: true,
                success,
            });
        state.success = success;
        if success {
            state.last = now;
            state.beating = true;
        }
    }

    /// Re-evaluate every peer on `transport` against the timeout.
    /// Returns the peers that just stopped beating; the caller owes
    /// each a `forget_peer_data` call.
    pub fn evaluate(&mut self, transport: &str, timeout_secs: f64, now: f64) -> Vec<NodeName> {
        let mut stale = Vec::new();
        for ((t, peer), state) in self.slots.iter_mut() {
            if t != transport || !state.beating {
                continue;
            }
            if now - state.last > timeout_secs {
                state.beating = false;
                info!(%peer, transport, silent = now - state.last, "peer stopped beating");
                stale.push(peer.clone());
            }
        }
        stale
    }

    /// Whether any transport currently hears this peer.
    pub fn beating(&self, peer: &NodeName) -> bool {
        self.slots
            .iter()
            .any(|((_, p), state)| p == peer && state.beating)
    }

    /// Liveness on one specific transport.
    pub fn beating_on(&self, transport: &str, peer: &NodeName) -> bool {
        self.slots
            .get(&(transport.to_string(), peer.clone()))
            .map(|s| s.beating)
            .unwrap_or(false)
    }

    /// The raw record, for observability surfaces.
    pub fn state(&self, transport: &str, peer: &NodeName) -> Option<BeatState> {
        self.slots.get(&(transport.to_string(), peer.clone())).copied()
    }
}
