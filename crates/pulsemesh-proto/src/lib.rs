//! # Pulsemesh Proto
//!
//! The transport-agnostic heartbeat protocol engine.
//!
//! A transport's transmitter asks the engine what to send (ping, full,
//! or patch, already sealed); its receiver hands decrypted messages to
//! [`Engine::apply`], which merges them into the shared cluster
//! dataset with gap detection and generation bookkeeping.
//!
//! ## Message choice
//!
//! ```text
//! journal empty            -> ping   (presence announcement)
//! peer acked nothing, or
//! journal cannot reach it  -> full   (replacement snapshot, cached)
//! otherwise                -> patch  (journal entries the peer lacks)
//! ```
//!
//! ## Key Properties
//!
//! - **Ordered**: patches apply strictly in generation order; a hole
//!   aborts the whole message and requests a full resync instead.
//! - **Idempotent**: re-applying an installed generation is a no-op,
//!   so at-least-once delivery over redundant transports is safe.
//! - **Contained**: desync and edit failures never escalate; they
//!   degrade to a resync request.

pub mod engine;
pub mod error;

pub use engine::{ApplyOutcome, Engine, EngineConfig, Target};
pub use error::EngineError;
