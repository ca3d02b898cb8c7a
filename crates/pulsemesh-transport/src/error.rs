//! Error types for the transports.

use thiserror::Error;

/// Transport startup and I/O errors.
///
/// Loops never surface these past their own tick; the constructors do,
/// and a constructor failure aborts that one transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad transport configuration: {0}")]
    Config(String),

    #[error("no free slot on device (capacity {0})")]
    NoFreeSlot(usize),

    #[error("message of {len} bytes exceeds slot size {slot_size}")]
    SlotOverflow { len: usize, slot_size: usize },
}
