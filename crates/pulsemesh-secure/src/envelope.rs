//! Seal and open heartbeat payloads.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;

use pulsemesh_core::{Heartbeat, NodeName, PROTOCOL_COMPAT};

use crate::error::SealError;
use crate::secret::ClusterSecret;

const NONCE_LEN: usize = 12;

/// Seals heartbeats for the wire and opens inbound ones.
///
/// Wire layout: 12-byte random nonce followed by the ciphertext
/// (authentication tag included). No framing beyond that — the disk
/// transport NUL-pads to its slot size, the multicast transport
/// fragments the hex text.
#[derive(Clone)]
pub struct Envelope {
    secret: ClusterSecret,
}

impl Envelope {
    /// Build an envelope around a derived cluster secret.
    pub fn new(secret: ClusterSecret) -> Self {
        Self { secret }
    }

    /// Encrypt a heartbeat for transmission.
    pub fn seal(&self, message: &Heartbeat) -> Result<Vec<u8>, SealError> {
        let plaintext =
            serde_json::to_vec(message).map_err(|e| SealError::Encrypt(e.to_string()))?;

        let cipher = ChaCha20Poly1305::new_from_slice(self.secret.as_bytes())
            .map_err(|e| SealError::Encrypt(e.to_string()))?;

        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| SealError::Encrypt(e.to_string()))?;

        let mut wire = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wire.extend_from_slice(&nonce);
        wire.extend_from_slice(&ciphertext);
        Ok(wire)
    }

    /// Decrypt an inbound envelope and identify its sender.
    ///
    /// Rejects messages from a different protocol compat. The returned
    /// name is the one declared inside the payload; it is the
    /// authoritative sender identity.
    pub fn open(&self, wire: &[u8]) -> Result<(NodeName, Heartbeat), SealError> {
        if wire.len() <= NONCE_LEN {
            return Err(SealError::TooShort(wire.len()));
        }
        let (nonce, ciphertext) = wire.split_at(NONCE_LEN);

        let cipher = ChaCha20Poly1305::new_from_slice(self.secret.as_bytes())
            .map_err(|_| SealError::Decrypt)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| SealError::Decrypt)?;

        let message: Heartbeat =
            serde_json::from_slice(&plaintext).map_err(|e| SealError::Payload(e.to_string()))?;

        if message.compat() != PROTOCOL_COMPAT {
            return Err(SealError::CompatMismatch {
                local: PROTOCOL_COMPAT,
                peer: message.compat(),
            });
        }

        Ok((message.node().clone(), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ping(node: &str, compat: u32) -> Heartbeat {
        Heartbeat::Ping {
            node: NodeName::new(node),
            compat,
            gen: Default::default(),
            updated: 1700000000.0,
            monitor: json!({"state": "idle"}),
        }
    }

    fn envelope(cluster: &str, secret: &[u8]) -> Envelope {
        Envelope::new(ClusterSecret::derive(cluster, secret))
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let env = envelope("c1", b"hush");
        let wire = env.seal(&ping("n1", PROTOCOL_COMPAT)).unwrap();

        let (sender, message) = env.open(&wire).unwrap();
        assert_eq!(sender, NodeName::new("n1"));
        assert_eq!(message.declared_gen(), 0);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let wire = envelope("c1", b"hush")
            .seal(&ping("n1", PROTOCOL_COMPAT))
            .unwrap();

        assert!(matches!(
            envelope("c1", b"other").open(&wire),
            Err(SealError::Decrypt)
        ));
    }

    #[test]
    fn test_other_cluster_rejected() {
        let wire = envelope("c1", b"hush")
            .seal(&ping("n1", PROTOCOL_COMPAT))
            .unwrap();

        assert!(matches!(
            envelope("c2", b"hush").open(&wire),
            Err(SealError::Decrypt)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let env = envelope("c1", b"hush");
        let mut wire = env.seal(&ping("n1", PROTOCOL_COMPAT)).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0x01;

        assert!(matches!(env.open(&wire), Err(SealError::Decrypt)));
    }

    #[test]
    fn test_compat_mismatch_rejected() {
        let env = envelope("c1", b"hush");
        let wire = env.seal(&ping("n1", PROTOCOL_COMPAT + 1)).unwrap();

        assert!(matches!(
            env.open(&wire),
            Err(SealError::CompatMismatch { .. })
        ));
    }

    #[test]
    fn test_short_input_rejected() {
        let env = envelope("c1", b"hush");
        assert!(matches!(env.open(&[0u8; 5]), Err(SealError::TooShort(5))));
    }

    #[test]
    fn test_nonce_freshness() {
        let env = envelope("c1", b"hush");
        let message = ping("n1", PROTOCOL_COMPAT);
        let a = env.seal(&message).unwrap();
        let b = env.seal(&message).unwrap();
        assert_ne!(a, b);
    }
}
