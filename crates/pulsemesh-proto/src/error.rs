//! Error types for the protocol engine.

use thiserror::Error;

use pulsemesh_secure::SealError;

/// Errors building outbound heartbeats.
///
/// Inbound handling has no error type at all: every inbound failure
/// mode is a protocol signal (resync) or a silent drop, handled
/// locally per the failure taxonomy.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("seal failed: {0}")]
    Seal(#[from] SealError),
}
