//! # Pulsemesh State
//!
//! The process-wide mutable state shared by every transport loop:
//! the merged cluster dataset, the generation store, the per-transport
//! liveness board, the change-event queue, and the full-snapshot
//! cache.
//!
//! All of it lives in one [`Shared`] struct behind one mutex. Every
//! mutation takes the lock; the lock is never held across an await
//! point, so blocking is bounded by in-memory work.

pub mod beat;
pub mod cache;
pub mod dataset;
pub mod events;
pub mod gens;
pub mod shared;

pub use beat::{BeatBoard, BeatState};
pub use cache::SnapshotCache;
pub use dataset::ClusterDataset;
pub use events::{ChangeEvent, EventQueue};
pub use gens::{GenerationStore, PeerGens};
pub use shared::{Shared, SharedInner};
