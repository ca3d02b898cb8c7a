//! Transfer statistics counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-transport counters, shared by its transmit and receive loops.
///
/// These are the observability surface the failure taxonomy promises:
/// every locally-handled failure shows up here.
#[derive(Debug, Default)]
pub struct TransferStats {
    /// Messages (or complete fragment sets) sent.
    pub tx_msgs: AtomicU64,
    /// Send failures.
    pub tx_errors: AtomicU64,
    /// Messages accepted by the engine.
    pub rx_msgs: AtomicU64,
    /// Read/socket failures.
    pub rx_errors: AtomicU64,
    /// Messages dropped before the engine: decrypt failures,
    /// reassembly purges, foreign traffic.
    pub rx_drops: AtomicU64,
    /// Complete messages dropped because the worker pool was full.
    pub worker_drops: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub tx_msgs: u64,
    pub tx_errors: u64,
    pub rx_msgs: u64,
    pub rx_errors: u64,
    pub rx_drops: u64,
    pub worker_drops: u64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            tx_msgs: self.tx_msgs.load(Ordering::Relaxed),
            tx_errors: self.tx_errors.load(Ordering::Relaxed),
            rx_msgs: self.rx_msgs.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            rx_drops: self.rx_drops.load(Ordering::Relaxed),
            worker_drops: self.worker_drops.load(Ordering::Relaxed),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_bumps() {
        let stats = TransferStats::new();
        TransferStats::bump(&stats.tx_msgs);
        TransferStats::bump(&stats.tx_msgs);
        TransferStats::bump(&stats.rx_drops);

        let snap = stats.snapshot();
        assert_eq!(snap.tx_msgs, 2);
        assert_eq!(snap.rx_drops, 1);
        assert_eq!(snap.rx_errors, 0);
    }
}
