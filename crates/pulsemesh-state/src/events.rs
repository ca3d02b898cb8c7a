//! Append-only change-event stream for subscribers.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::warn;

use pulsemesh_core::NodeName;

/// Default bound on queued events.
pub const DEFAULT_EVENT_CAPACITY: usize = 4096;

/// One accepted change to the merged dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// The node whose sub-tree changed.
    pub node: NodeName,
    /// Message kind that produced the change ("ping", "full", "patch").
    pub kind: &'static str,
    /// Change payload: the edit script for a patch generation, the
    /// whole sub-tree for a full, the monitor snapshot for a ping.
    pub data: Value,
}

/// Bounded FIFO of change events.
///
/// A slow subscriber loses the oldest events rather than growing the
/// queue without bound; drops are counted and logged once per burst.
#[derive(Debug)]
pub struct EventQueue {
    queue: VecDeque<ChangeEvent>,
    capacity: usize,
    dropped: u64,
    warned: bool,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            capacity,
            dropped: 0,
            warned: false,
        }
    }

    /// Append one event, evicting the oldest at capacity.
    pub fn push(&mut self, event: ChangeEvent) {
        if self.queue.len() >= self.capacity {
            self.queue.pop_front();
            self.dropped += 1;
            if !self.warned {
                warn!(capacity = self.capacity, "event queue full, dropping oldest");
                self.warned = true;
            }
        }
        self.queue.push_back(event);
    }

    /// Take everything queued, oldest first.
    pub fn drain(&mut self) -> Vec<ChangeEvent> {
        self.warned = false;
        self.queue.drain(..).collect()
    }

    /// Events lost to the capacity bound since startup.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(n: u64) -> ChangeEvent {
        ChangeEvent {
            node: NodeName::new("n2"),
            kind: "patch",
            data: json!({"gen": n}),
        }
    }

    #[test]
    fn test_drain_in_order() {
        let mut queue = EventQueue::default();
        queue.push(event(1));
        queue.push(event(2));

        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].data["gen"], 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_capacity_drops_oldest() {
        let mut queue = EventQueue::new(3);
        for n in 1..=5 {
            queue.push(event(n));
        }

        assert_eq!(queue.dropped(), 2);
        let drained = queue.drain();
        assert_eq!(drained.first().unwrap().data["gen"], 3);
        assert_eq!(drained.last().unwrap().data["gen"], 5);
    }
}
