//! Error types for the secure envelope.

use thiserror::Error;

/// Errors sealing or opening heartbeat envelopes.
#[derive(Debug, Error)]
pub enum SealError {
    #[error("encryption failed: {0}")]
    Encrypt(String),

    /// Authentication failure. Deliberately carries no detail; the
    /// caller drops the message.
    #[error("decrypt failed")]
    Decrypt,

    /// Shorter than a nonce; cannot be one of ours.
    #[error("envelope too short: {0} bytes")]
    TooShort(usize),

    #[error("payload is not a heartbeat: {0}")]
    Payload(String),

    #[error("protocol compat mismatch: local={local}, peer={peer}")]
    CompatMismatch { local: u32, peer: u32 },
}
