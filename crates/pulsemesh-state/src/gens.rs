//! Generation counter, diff journal, and per-peer bookkeeping.

use std::collections::{BTreeMap, HashMap};

use pulsemesh_core::{EditOp, GenVector, NodeName};

/// Default bound on journal length, in generations.
pub const DEFAULT_JOURNAL_RETENTION: usize = 64;

/// What we know about one peer's generations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerGens {
    /// Last generation of the peer's sub-tree we have installed.
    /// 0 means we need a full resync from it.
    pub remote_gen: u64,
    /// Last generation of our sub-tree the peer has told us it holds.
    pub local_gen_on_peer: u64,
}

/// This node's generation counter, its bounded diff journal, and the
/// per-peer generation table.
///
/// The journal maps each generation to the edit script that produced
/// it. Entries are appended exactly once, in order, and pruned once
/// every peer has acknowledged them (bounded by retention either way).
#[derive(Debug)]
pub struct GenerationStore {
    local_gen: u64,
    journal: BTreeMap<u64, Vec<EditOp>>,
    retention: usize,
    peers: HashMap<NodeName, PeerGens>,
}

impl GenerationStore {
    /// Empty store with the given journal retention bound.
    pub fn new(retention: usize) -> Self {
        Self {
            local_gen: 0,
            journal: BTreeMap::new(),
            retention,
            peers: HashMap::new(),
        }
    }

    /// This node's own generation.
    pub fn local_gen(&self) -> u64 {
        self.local_gen
    }

    /// Number of journaled generations.
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Advance the local generation and journal the diff that
    /// produced it. Returns the new generation.
    pub fn bump_local(&mut self, diff: Vec<EditOp>) -> u64 {
        self.local_gen += 1;
        self.journal.insert(self.local_gen, diff);
        self.prune();
        self.local_gen
    }

    fn prune(&mut self) {
        // Entries every peer has acknowledged are dead weight, but the
        // retention cap is the hard bound: a silent peer must not pin
        // the journal forever. The newest entry always stays: an empty
        // journal means "just started" to the outbound builder.
        if !self.peers.is_empty() {
            let all_acked = self
                .peers
                .values()
                .map(|p| p.local_gen_on_peer)
                .min()
                .unwrap_or(0);
            let cutoff = all_acked.min(self.local_gen.saturating_sub(1));
            self.journal.retain(|gen, _| *gen > cutoff);
        }
        while self.journal.len() > self.retention {
            let oldest = *self.journal.keys().next().expect("len checked");
            self.journal.remove(&oldest);
        }
    }

    /// The last generation `peer` acknowledged of our sub-tree, plus
    /// how many generations the journal currently holds. The outbound
    /// builder turns this into ping (count 0), full (begin 0 or
    /// inconsistent), or patch.
    pub fn oldest_unacked_gen(&self, peer: &NodeName) -> (u64, usize) {
        let begin = self
            .peers
            .get(peer)
            .map(|p| p.local_gen_on_peer)
            .unwrap_or(0);
        (begin, self.journal.len())
    }

    /// Like [`oldest_unacked_gen`](Self::oldest_unacked_gen), for a
    /// message every peer will read: the most behind peer drives the
    /// choice.
    pub fn oldest_unacked_broadcast(&self, peers: impl Iterator<Item = NodeName>) -> (u64, usize) {
        let begin = peers
            .map(|p| self.oldest_unacked_gen(&p).0)
            .min()
            .unwrap_or(0);
        (begin, self.journal.len())
    }

    /// Whether the journal can take a peer from `begin` to the local
    /// generation without a hole.
    pub fn journal_covers(&self, begin: u64) -> bool {
        match self.journal.keys().next() {
            Some(&oldest) => oldest <= begin + 1,
            None => false,
        }
    }

    /// Journal entries with generation greater than `begin`, ascending.
    pub fn deltas_after(&self, begin: u64) -> BTreeMap<u64, Vec<EditOp>> {
        self.journal
            .range(begin + 1..)
            .map(|(gen, ops)| (*gen, ops.clone()))
            .collect()
    }

    /// Record the generation of our sub-tree a peer claims to hold.
    pub fn record_peer_ack(&mut self, peer: &NodeName, gen: u64) {
        self.peers.entry(peer.clone()).or_default().local_gen_on_peer = gen;
        self.prune();
    }

    /// Record the generation of a peer's sub-tree we just installed.
    pub fn record_peer_installed(&mut self, peer: &NodeName, gen: u64) {
        self.peers.entry(peer.clone()).or_default().remote_gen = gen;
    }

    /// Force a full resync from this peer: its next message will find
    /// our gen vector claiming 0 for it.
    pub fn reset_peer(&mut self, peer: &NodeName) {
        self.peers.entry(peer.clone()).or_default().remote_gen = 0;
    }

    /// Bookkeeping for one peer, if any contact happened yet.
    pub fn peer(&self, peer: &NodeName) -> Option<PeerGens> {
        self.peers.get(peer).copied()
    }

    /// Every peer that ever appeared in the table, configured or
    /// discovered.
    pub fn known_peers(&self) -> Vec<NodeName> {
        self.peers.keys().cloned().collect()
    }

    /// The generation vector carried in every outbound message: our
    /// own generation plus the remote generation we hold per peer.
    pub fn gen_vector(&self, self_name: &NodeName) -> GenVector {
        let mut gens: GenVector = self
            .peers
            .iter()
            .map(|(name, p)| (name.clone(), p.remote_gen))
            .collect();
        gens.insert(self_name.clone(), self.local_gen);
        gens
    }
}

impl Default for GenerationStore {
    fn default() -> Self {
        Self::new(DEFAULT_JOURNAL_RETENTION)
    }
}
