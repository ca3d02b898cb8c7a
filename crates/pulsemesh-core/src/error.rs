//! Error types for pulsemesh core.

use thiserror::Error;

/// Errors over heartbeat message encoding and validation.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("encoding error: {0}")]
    Encoding(String),

    #[error("decoding error: {0}")]
    Decoding(String),

    #[error("protocol compat mismatch: local={local}, peer={peer}")]
    CompatMismatch { local: u32, peer: u32 },

    #[error("malformed message: {0}")]
    Malformed(String),
}

/// Errors raised while applying edit operations to a status tree.
///
/// Any of these during patch application is a desync signal: the
/// caller must stop applying and request a full resync.
#[derive(Debug, Error)]
pub enum EditError {
    /// An intermediate path element exists but is not a map.
    #[error("path element {0:?} is not a map")]
    NotAMap(String),

    /// A delete targeted a path that does not exist.
    #[error("path {0:?} not found")]
    MissingPath(String),

    /// Deleting the tree root is not a meaningful edit.
    #[error("empty path")]
    EmptyPath,
}
