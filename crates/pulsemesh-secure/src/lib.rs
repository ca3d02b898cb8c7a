//! # Pulsemesh Secure
//!
//! The secure envelope: every heartbeat travels as
//! `nonce || ChaCha20-Poly1305 ciphertext`, keyed from the pre-shared
//! cluster secret. A message that fails to open is silently dropped by
//! callers — absence of a beat is itself informative.
//!
//! The sending node is identified from the decrypted payload, never
//! from transport-level addressing (a slot index or a source address
//! is advisory only).

pub mod envelope;
pub mod error;
pub mod secret;

pub use envelope::Envelope;
pub use error::SealError;
pub use secret::ClusterSecret;
