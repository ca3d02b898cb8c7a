//! The single shared-state owner.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::beat::BeatBoard;
use crate::cache::SnapshotCache;
use crate::dataset::ClusterDataset;
use crate::events::{EventQueue, DEFAULT_EVENT_CAPACITY};
use crate::gens::{GenerationStore, DEFAULT_JOURNAL_RETENTION};

/// Everything the transport loops and the engine mutate, behind one
/// mutex.
///
/// The guard must never be held across an await point; every user of
/// [`Shared::lock`] does its in-memory work and releases before any
/// I/O. Merges stay atomic against concurrent readers and against the
/// other transport loops.
#[derive(Debug)]
pub struct Shared {
    inner: Mutex<SharedInner>,
}

/// The mutable state itself.
#[derive(Debug)]
pub struct SharedInner {
    pub dataset: ClusterDataset,
    pub gens: GenerationStore,
    pub beats: BeatBoard,
    pub events: EventQueue,
    pub full_cache: SnapshotCache,
}

impl Shared {
    /// Fresh state with default bounds.
    pub fn new() -> Arc<Self> {
        Self::with_bounds(DEFAULT_JOURNAL_RETENTION, DEFAULT_EVENT_CAPACITY)
    }

    /// Fresh state with explicit journal retention and event capacity.
    pub fn with_bounds(journal_retention: usize, event_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(SharedInner {
                dataset: ClusterDataset::new(),
                gens: GenerationStore::new(journal_retention),
                beats: BeatBoard::new(),
                events: EventQueue::new(event_capacity),
                full_cache: SnapshotCache::new(),
            }),
        })
    }

    /// Take the process-wide lock.
    pub fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulsemesh_core::{EditOp, NodeName};
    use serde_json::json;

    #[test]
    fn test_lock_spans_all_parts() {
        let shared = Shared::new();
        let me = NodeName::new("n1");

        {
            let mut inner = shared.lock();
            inner
                .dataset
                .apply_ops(&me, &[EditOp::set(vec!["state".into()], json!("up"))])
                .unwrap();
            inner.gens.bump_local(vec![]);
            inner.full_cache.invalidate();
        }

        let inner = shared.lock();
        assert_eq!(inner.gens.local_gen(), 1);
        assert_eq!(inner.dataset.get(&me).unwrap()["state"], json!("up"));
    }
}
