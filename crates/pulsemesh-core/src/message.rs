//! Heartbeat wire messages.
//!
//! Every heartbeat is one of three kinds:
//!
//! - **ping**: a cheap presence announcement carrying only a minimal
//!   monitor snapshot, sent while this node holds no diff journal yet.
//! - **full**: a complete replacement snapshot of the sender's
//!   sub-tree, sent when incremental catch-up is impossible.
//! - **patch**: the journal entries the receiver is missing, one edit
//!   script per generation.
//!
//! The sender is identified by the `node` field of the decrypted
//! payload, never by transport-level addressing.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::edit::EditOp;
use crate::node::{GenVector, NodeName};

/// Protocol compatibility number. Messages carrying a different value
/// are dropped on receive.
pub const PROTOCOL_COMPAT: u32 = 2;

/// A heartbeat message, after decryption.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Heartbeat {
    /// Presence announcement; asks peers for a full resync of us.
    Ping {
        node: NodeName,
        compat: u32,
        gen: GenVector,
        updated: f64,
        /// Minimal own-status snapshot (node state, frozen flag).
        monitor: Value,
    },

    /// Complete replacement snapshot of the sender's sub-tree.
    Full {
        node: NodeName,
        compat: u32,
        gen: GenVector,
        updated: f64,
        payload: Value,
    },

    /// Incremental catch-up: one edit script per missed generation.
    Patch {
        node: NodeName,
        compat: u32,
        gen: GenVector,
        updated: f64,
        #[serde(with = "delta_keys")]
        deltas: BTreeMap<u64, Vec<EditOp>>,
    },
}

impl Heartbeat {
    /// The sending node, as declared inside the payload.
    pub fn node(&self) -> &NodeName {
        match self {
            Heartbeat::Ping { node, .. }
            | Heartbeat::Full { node, .. }
            | Heartbeat::Patch { node, .. } => node,
        }
    }

    /// Protocol compatibility number the sender speaks.
    pub fn compat(&self) -> u32 {
        match self {
            Heartbeat::Ping { compat, .. }
            | Heartbeat::Full { compat, .. }
            | Heartbeat::Patch { compat, .. } => *compat,
        }
    }

    /// The sender's generation vector.
    pub fn gen(&self) -> &GenVector {
        match self {
            Heartbeat::Ping { gen, .. }
            | Heartbeat::Full { gen, .. }
            | Heartbeat::Patch { gen, .. } => gen,
        }
    }

    /// Unix-epoch time at which the sender built this message.
    pub fn updated(&self) -> f64 {
        match self {
            Heartbeat::Ping { updated, .. }
            | Heartbeat::Full { updated, .. }
            | Heartbeat::Patch { updated, .. } => *updated,
        }
    }

    /// The generation the sender declares for its own sub-tree.
    pub fn declared_gen(&self) -> u64 {
        self.gen().get(self.node()).copied().unwrap_or(0)
    }

    /// The generation the sender claims to hold of `name`'s sub-tree.
    pub fn claims_of(&self, name: &NodeName) -> u64 {
        self.gen().get(name).copied().unwrap_or(0)
    }

    /// Message kind discriminator.
    pub fn kind(&self) -> HeartbeatKind {
        match self {
            Heartbeat::Ping { .. } => HeartbeatKind::Ping,
            Heartbeat::Full { .. } => HeartbeatKind::Full,
            Heartbeat::Patch { .. } => HeartbeatKind::Patch,
        }
    }
}

/// Kind discriminator, also used as the `kind` field of change events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatKind {
    Ping,
    Full,
    Patch,
}

impl HeartbeatKind {
    /// Lowercase wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            HeartbeatKind::Ping => "ping",
            HeartbeatKind::Full => "full",
            HeartbeatKind::Patch => "patch",
        }
    }
}

/// Current time as float Unix epoch seconds, the wire's `updated` unit.
pub fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time went backwards")
        .as_secs_f64()
}

/// JSON maps key by string; generation numbers are integers. This
/// module bridges the two for the `deltas` field.
mod delta_keys {
    use std::collections::BTreeMap;

    use serde::de::Error as DeError;
    use serde::{Deserialize, Deserializer, Serializer};

    use crate::edit::EditOp;

    pub fn serialize<S: Serializer>(
        deltas: &BTreeMap<u64, Vec<EditOp>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(deltas.iter().map(|(gen, ops)| (gen.to_string(), ops)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u64, Vec<EditOp>>, D::Error> {
        let raw: BTreeMap<String, Vec<EditOp>> = BTreeMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(key, ops)| {
                key.parse::<u64>()
                    .map(|gen| (gen, ops))
                    .map_err(|_| D::Error::custom(format!("non-numeric generation key {key:?}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gens(pairs: &[(&str, u64)]) -> GenVector {
        pairs
            .iter()
            .map(|(name, gen)| (NodeName::new(*name), *gen))
            .collect()
    }

    #[test]
    fn test_ping_wire_shape() {
        let ping = Heartbeat::Ping {
            node: NodeName::new("n1"),
            compat: PROTOCOL_COMPAT,
            gen: gens(&[("n1", 0)]),
            updated: 1700000000.5,
            monitor: json!({"state": "idle", "frozen": false}),
        };

        let wire = serde_json::to_value(&ping).unwrap();
        assert_eq!(wire["kind"], "ping");
        assert_eq!(wire["node"], "n1");
        assert_eq!(wire["gen"]["n1"], 0);
        assert_eq!(wire["monitor"]["state"], "idle");
    }

    #[test]
    fn test_patch_delta_keys_are_strings() {
        let mut deltas = BTreeMap::new();
        deltas.insert(4, vec![EditOp::set(vec!["frozen".into()], json!(true))]);
        deltas.insert(5, vec![EditOp::delete(vec!["frozen".into()])]);

        let patch = Heartbeat::Patch {
            node: NodeName::new("n1"),
            compat: PROTOCOL_COMPAT,
            gen: gens(&[("n1", 5), ("n2", 2)]),
            updated: 1700000000.0,
            deltas,
        };

        let wire = serde_json::to_value(&patch).unwrap();
        assert_eq!(wire["deltas"]["4"], json!([[["frozen"], true]]));
        assert_eq!(wire["deltas"]["5"], json!([[["frozen"]]]));

        let back: Heartbeat = serde_json::from_value(wire).unwrap();
        match back {
            Heartbeat::Patch { deltas, .. } => {
                assert_eq!(deltas.keys().copied().collect::<Vec<_>>(), vec![4, 5]);
            }
            other => panic!("expected patch, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_declared_and_claimed_gens() {
        let full = Heartbeat::Full {
            node: NodeName::new("a"),
            compat: PROTOCOL_COMPAT,
            gen: gens(&[("a", 7), ("b", 3)]),
            updated: 0.0,
            payload: json!({}),
        };

        assert_eq!(full.declared_gen(), 7);
        assert_eq!(full.claims_of(&NodeName::new("b")), 3);
        assert_eq!(full.claims_of(&NodeName::new("c")), 0);
    }

    #[test]
    fn test_non_numeric_delta_key_rejected() {
        let wire = json!({
            "kind": "patch",
            "node": "n1",
            "compat": PROTOCOL_COMPAT,
            "gen": {"n1": 1},
            "updated": 0.0,
            "deltas": {"not-a-gen": []},
        });
        assert!(serde_json::from_value::<Heartbeat>(wire).is_err());
    }
}
