//! # Pulsemesh Transport
//!
//! The two heartbeat transports behind the protocol engine:
//!
//! - **disk**: fixed-size addressed slots on a shared block or
//!   character device; each node writes its own slot and polls every
//!   claimed one.
//! - **mcast**: UDP multicast with application-level fragmentation
//!   and a bounded worker pool for decrypt+apply.
//!
//! Each transport runs one transmit loop and one receive loop; both
//! survive any per-message failure. Only startup configuration errors
//! propagate, and they abort that transport alone.

pub mod disk;
pub mod error;
pub mod fragment;
pub mod mcast;
pub mod slots;
pub mod stats;

pub use disk::{DiskConfig, DiskTransport};
pub use error::TransportError;
pub use fragment::{Fragment, Ingest, Reassembler};
pub use mcast::{McastConfig, McastTransport};
pub use slots::SlotLayout;
pub use stats::{StatsSnapshot, TransferStats};
