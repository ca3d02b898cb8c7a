//! Error type of the facade crate.

use thiserror::Error;

/// Errors surfaced to the embedding node agent.
///
/// Only two things can fail from the outside: committing a bad local
/// edit script, and starting a misconfigured transport. Everything
/// the loops hit afterwards is handled internally.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Transport(#[from] pulsemesh_transport::TransportError),

    #[error("local edit failed: {0}")]
    Edit(#[from] pulsemesh_core::EditError),
}
