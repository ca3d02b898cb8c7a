//! Key derivation from the pre-shared cluster secret.

use std::fmt;

/// A 256-bit envelope key derived from the cluster's pre-shared
/// secret and the cluster name.
///
/// Every node configured with the same pair derives the same key, so
/// any member can open any member's heartbeats. Mixing in the cluster
/// name keeps two clusters on one wire (or one shared device) from
/// accepting each other's traffic.
#[derive(Clone)]
pub struct ClusterSecret([u8; 32]);

impl ClusterSecret {
    /// Derive the envelope key.
    pub fn derive(cluster_name: &str, secret: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key("pulsemesh-v1-envelope");
        hasher.update(cluster_name.as_bytes());
        hasher.update(secret);
        Self(*hasher.finalize().as_bytes())
    }

    /// Create from raw key bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for ClusterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.write_str("ClusterSecret(..)")
    }
}
