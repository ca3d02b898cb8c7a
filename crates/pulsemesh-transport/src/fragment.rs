//! Fragmentation and reassembly for the multicast transport.
//!
//! A sealed message larger than one datagram is hex-encoded and split
//! into tagged chunks `{id, i, n, c}`, one JSON object per datagram,
//! NUL-terminated. The receiver buffers chunks per (source address,
//! message id) and concatenates by index once all `n` are present.
//!
//! Two independent bounds cap memory under adversarial or buggy
//! senders: pending message ids per source, and fragments per id.
//! Exceeding either purges the oldest or offending buffer instead of
//! growing.

use std::collections::HashMap;
use std::net::SocketAddr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One chunk of an oversized message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fragment {
    /// Message id, fresh per fragmented message.
    pub id: String,
    /// Chunk index, `0..n`.
    pub i: u32,
    /// Total chunk count.
    pub n: u32,
    /// Chunk of the hex-encoded sealed message.
    pub c: String,
}

/// Split a sealed message into datagrams.
///
/// A message that fits goes out as-is (one datagram); larger ones are
/// hex-encoded and chunked. Every datagram is NUL-terminated.
pub fn to_datagrams(sealed: &[u8], chunk_size: usize) -> Vec<Vec<u8>> {
    if sealed.len() <= chunk_size {
        let mut datagram = sealed.to_vec();
        datagram.push(0);
        return vec![datagram];
    }

    let text = hex::encode(sealed);
    let chunks: Vec<&str> = text
        .as_bytes()
        .chunks(chunk_size)
        .map(|c| std::str::from_utf8(c).expect("hex is ascii"))
        .collect();
    let n = chunks.len() as u32;
    let id: String = {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill(&mut bytes);
        hex::encode(bytes)
    };

    chunks
        .into_iter()
        .enumerate()
        .map(|(i, c)| {
            let fragment = Fragment {
                id: id.clone(),
                i: i as u32,
                n,
                c: c.to_string(),
            };
            let mut datagram =
                serde_json::to_vec(&fragment).expect("fragment serialization cannot fail");
            datagram.push(0);
            datagram
        })
        .collect()
}

/// Outcome of ingesting one datagram.
#[derive(Debug, PartialEq, Eq)]
pub enum Ingest {
    /// A complete sealed message, ready for the envelope.
    Complete(Vec<u8>),
    /// A fragment was buffered; more are needed.
    Pending,
    /// The datagram was discarded.
    Dropped(&'static str),
}

struct PendingMessage {
    n: u32,
    chunks: HashMap<u32, String>,
    born: u64,
}

/// Per-source reassembly buffers with hard bounds.
pub struct Reassembler {
    max_messages: usize,
    max_fragments: usize,
    sources: HashMap<SocketAddr, HashMap<String, PendingMessage>>,
    clock: u64,
}

impl Reassembler {
    pub fn new(max_messages: usize, max_fragments: usize) -> Self {
        Self {
            max_messages,
            max_fragments,
            sources: HashMap::new(),
            clock: 0,
        }
    }

    /// Feed one received datagram.
    pub fn ingest(&mut self, src: SocketAddr, datagram: &[u8]) -> Ingest {
        let payload = strip_nul(datagram);
        if payload.is_empty() {
            return Ingest::Dropped("empty datagram");
        }

        // Sealed envelopes start with a random nonce; a fragment is
        // the only thing here that parses as a JSON object.
        if payload[0] != b'{' {
            return Ingest::Complete(payload.to_vec());
        }
        let fragment: Fragment = match serde_json::from_slice(payload) {
            Ok(f) => f,
            Err(_) => return Ingest::Complete(payload.to_vec()),
        };

        if fragment.n == 0 || fragment.i >= fragment.n {
            return Ingest::Dropped("bad fragment header");
        }
        if fragment.n as usize > self.max_fragments {
            // The offending id may already hold buffered chunks.
            if let Some(pending) = self.sources.get_mut(&src) {
                pending.remove(&fragment.id);
            }
            warn!(%src, n = fragment.n, "fragment count over bound, purging message");
            return Ingest::Dropped("fragment count over bound");
        }

        let pending = self.sources.entry(src).or_default();
        if !pending.contains_key(&fragment.id) && pending.len() >= self.max_messages {
            if let Some(oldest) = pending
                .iter()
                .min_by_key(|(_, m)| m.born)
                .map(|(id, _)| id.clone())
            {
                pending.remove(&oldest);
                warn!(%src, "pending messages over bound, purging oldest");
            }
        }

        self.clock += 1;
        let message = pending.entry(fragment.id.clone()).or_insert(PendingMessage {
            n: fragment.n,
            chunks: HashMap::new(),
            born: self.clock,
        });
        if message.n != fragment.n {
            pending.remove(&fragment.id);
            return Ingest::Dropped("inconsistent fragment total");
        }
        message.chunks.insert(fragment.i, fragment.c);

        if message.chunks.len() < message.n as usize {
            return Ingest::Pending;
        }

        let message = pending.remove(&fragment.id).expect("just inserted");
        let mut text = String::new();
        for i in 0..message.n {
            text.push_str(&message.chunks[&i]);
        }
        match hex::decode(&text) {
            Ok(sealed) => Ingest::Complete(sealed),
            Err(_) => Ingest::Dropped("undecodable reassembly"),
        }
    }

    /// Pending message ids buffered for one source.
    pub fn pending_for(&self, src: &SocketAddr) -> usize {
        self.sources.get(src).map(HashMap::len).unwrap_or(0)
    }
}

fn strip_nul(datagram: &[u8]) -> &[u8] {
    match datagram.last() {
        Some(0) => &datagram[..datagram.len() - 1],
        _ => datagram,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn src(port: u16) -> SocketAddr {
        format!("192.0.2.1:{port}").parse().unwrap()
    }

    #[test]
    fn test_small_message_single_datagram() {
        let sealed = vec![0x42u8; 100];
        let datagrams = to_datagrams(&sealed, 1200);
        assert_eq!(datagrams.len(), 1);

        let mut reasm = Reassembler::new(16, 256);
        assert_eq!(reasm.ingest(src(1), &datagrams[0]), Ingest::Complete(sealed));
    }

    #[test]
    fn test_fragment_roundtrip_in_order() {
        let sealed: Vec<u8> = (0..2000u32).map(|n| (n % 251) as u8).collect();
        let datagrams = to_datagrams(&sealed, 1200);
        assert!(datagrams.len() > 1);

        let mut reasm = Reassembler::new(16, 256);
        let mut complete = None;
        for datagram in &datagrams {
            match reasm.ingest(src(1), datagram) {
                Ingest::Complete(bytes) => complete = Some(bytes),
                Ingest::Pending => {}
                Ingest::Dropped(reason) => panic!("dropped: {reason}"),
            }
        }
        assert_eq!(complete.unwrap(), sealed);
    }

    #[test]
    fn test_fragment_roundtrip_reversed() {
        let sealed: Vec<u8> = (0..5000u32).map(|n| (n % 239) as u8).collect();
        let datagrams = to_datagrams(&sealed, 800);

        let mut reasm = Reassembler::new(16, 256);
        let mut complete = None;
        for datagram in datagrams.iter().rev() {
            if let Ingest::Complete(bytes) = reasm.ingest(src(1), datagram) {
                complete = Some(bytes);
            }
        }
        assert_eq!(complete.unwrap(), sealed);
    }

    #[test]
    fn test_sources_do_not_mix() {
        let sealed: Vec<u8> = (0..2000u32).map(|n| (n % 251) as u8).collect();
        let datagrams = to_datagrams(&sealed, 1200);

        let mut reasm = Reassembler::new(16, 256);
        // First fragment arrives from one address, the rest from
        // another: never completes either side.
        assert_eq!(reasm.ingest(src(1), &datagrams[0]), Ingest::Pending);
        for datagram in &datagrams[1..] {
            assert_ne!(
                reasm.ingest(src(2), datagram),
                Ingest::Complete(sealed.clone())
            );
        }
    }

    #[test]
    fn test_message_id_bound_purges_oldest() {
        let mut reasm = Reassembler::new(4, 256);
        let source = src(1);

        for batch in 0..20 {
            let sealed: Vec<u8> = vec![batch as u8; 3000];
            let datagrams = to_datagrams(&sealed, 1200);
            // Hold every message incomplete.
            reasm.ingest(source, &datagrams[0]);
            assert!(reasm.pending_for(&source) <= 4);
        }
    }

    #[test]
    fn test_fragment_count_bound() {
        let mut reasm = Reassembler::new(16, 8);
        let fragment = Fragment {
            id: "feed".into(),
            i: 0,
            n: 9,
            c: "00".into(),
        };
        let mut datagram = serde_json::to_vec(&fragment).unwrap();
        datagram.push(0);

        assert_eq!(
            reasm.ingest(src(1), &datagram),
            Ingest::Dropped("fragment count over bound")
        );
        assert_eq!(reasm.pending_for(&src(1)), 0);
    }

    #[test]
    fn test_bogus_header_dropped() {
        let mut reasm = Reassembler::new(16, 256);
        let fragment = Fragment {
            id: "feed".into(),
            i: 5,
            n: 3,
            c: "00".into(),
        };
        let mut datagram = serde_json::to_vec(&fragment).unwrap();
        datagram.push(0);

        assert_eq!(
            reasm.ingest(src(1), &datagram),
            Ingest::Dropped("bad fragment header")
        );
    }

    #[test]
    fn test_duplicate_fragment_is_idempotent() {
        let sealed: Vec<u8> = (0..2600u32).map(|n| (n % 199) as u8).collect();
        let datagrams = to_datagrams(&sealed, 1200);
        assert!(datagrams.len() >= 3);

        let mut reasm = Reassembler::new(16, 256);
        reasm.ingest(src(1), &datagrams[0]);
        reasm.ingest(src(1), &datagrams[0]);
        reasm.ingest(src(1), &datagrams[1]);
        let mut complete = None;
        for datagram in &datagrams[2..] {
            if let Ingest::Complete(bytes) = reasm.ingest(src(1), datagram) {
                complete = Some(bytes);
            }
        }
        assert_eq!(complete.unwrap(), sealed);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn reassembly_order_independent(
                payload in proptest::collection::vec(any::<u8>(), 1500..6000),
                seed in any::<u64>(),
            ) {
                let datagrams = to_datagrams(&payload, 900);
                prop_assume!(datagrams.len() > 1);

                // Deterministic shuffle from the seed.
                let mut order: Vec<usize> = (0..datagrams.len()).collect();
                let mut state = seed | 1;
                for i in (1..order.len()).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
                    order.swap(i, (state % (i as u64 + 1)) as usize);
                }

                let mut reasm = Reassembler::new(16, 256);
                let mut complete = None;
                for &i in &order {
                    if let Ingest::Complete(bytes) = reasm.ingest(src(1), &datagrams[i]) {
                        complete = Some(bytes);
                    }
                }
                prop_assert_eq!(complete.unwrap(), payload);
            }
        }
    }
}
