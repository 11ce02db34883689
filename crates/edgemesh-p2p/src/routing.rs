//! Bounded k-bucket peer table.
//!
//! Peers are keyed by the SHA-256 of their identity; the bucket index is the
//! XOR distance (shared-prefix length) to the local key. The table never
//! runs a lookup protocol — it is purely the overlay's bounded working set,
//! and it reports membership changes as intents on a channel so the consumer
//! (the server loop) can react without re-entrant callbacks.

use std::time::Instant;

use libp2p::PeerId;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::{
    config::{DEFAULT_BUCKET_SIZE, ROUTING_STALE_TIMEOUT, ROUTING_STORE_TTL},
    error::{Error, Result},
};

const KEY_BITS: usize = 256;

/// Membership change, consumed by the dial machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingEvent {
    PeerAdded(PeerId),
    PeerRemoved(PeerId),
}

#[derive(Debug, Clone)]
struct Entry {
    peer: PeerId,
    key: [u8; 32],
    added: Instant,
    last_seen: Instant,
}

pub struct RoutingTable {
    local_key: [u8; 32],
    bucket_size: usize,
    buckets: Vec<Vec<Entry>>,
    events: mpsc::UnboundedSender<RoutingEvent>,
}

fn key_of(peer: &PeerId) -> [u8; 32] {
    Sha256::digest(peer.to_bytes()).into()
}

/// Shared-prefix length of two keys; `KEY_BITS` when equal.
fn common_prefix_len(a: &[u8; 32], b: &[u8; 32]) -> usize {
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        let xor = x ^ y;
        if xor != 0 {
            return i * 8 + xor.leading_zeros() as usize;
        }
    }
    KEY_BITS
}

impl RoutingTable {
    /// Create a table keyed by the local peer identity. Returns the table
    /// together with the receiving half of its event channel.
    pub fn new(
        local: PeerId,
        bucket_size: usize,
    ) -> (Self, mpsc::UnboundedReceiver<RoutingEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                local_key: key_of(&local),
                bucket_size,
                buckets: vec![Vec::new(); KEY_BITS],
                events: tx,
            },
            rx,
        )
    }

    pub fn with_default_bucket_size(
        local: PeerId,
    ) -> (Self, mpsc::UnboundedReceiver<RoutingEvent>) {
        Self::new(local, DEFAULT_BUCKET_SIZE)
    }

    fn bucket_index(&self, key: &[u8; 32]) -> Option<usize> {
        let cpl = common_prefix_len(&self.local_key, key);
        if cpl >= KEY_BITS {
            // The local node never occupies its own table.
            return None;
        }
        Some(cpl)
    }

    /// Try to add a peer.
    ///
    /// Returns `Ok(true)` when newly inserted (a `PeerAdded` event is
    /// emitted), `Ok(false)` when the peer was already present (its
    /// last-seen clock is refreshed). When the target bucket is full, one
    /// stale resident (unseen for [`ROUTING_STALE_TIMEOUT`], and past its
    /// [`ROUTING_STORE_TTL`] grace period) is evicted to make room;
    /// otherwise the add fails with [`Error::RoutingTableFull`] and the
    /// caller is expected to revert any peer-store insert it made.
    pub fn try_add(&mut self, peer: PeerId) -> Result<bool> {
        let key = key_of(&peer);
        let Some(idx) = self.bucket_index(&key) else {
            return Ok(false);
        };

        let bucket = &mut self.buckets[idx];
        if let Some(entry) = bucket.iter_mut().find(|e| e.peer == peer) {
            entry.last_seen = Instant::now();
            return Ok(false);
        }

        if bucket.len() >= self.bucket_size {
            let stale = bucket.iter().position(|e| {
                e.last_seen.elapsed() > ROUTING_STALE_TIMEOUT
                    && e.added.elapsed() > ROUTING_STORE_TTL
            });
            match stale {
                Some(pos) => {
                    let evicted = bucket.remove(pos);
                    let _ = self.events.send(RoutingEvent::PeerRemoved(evicted.peer));
                }
                None => return Err(Error::RoutingTableFull),
            }
        }

        let now = Instant::now();
        self.buckets[idx].push(Entry {
            peer,
            key,
            added: now,
            last_seen: now,
        });
        let _ = self.events.send(RoutingEvent::PeerAdded(peer));
        Ok(true)
    }

    /// Remove a peer; emits `PeerRemoved` when it was present.
    pub fn remove(&mut self, peer: PeerId) -> bool {
        let key = key_of(&peer);
        let Some(idx) = self.bucket_index(&key) else {
            return false;
        };
        let bucket = &mut self.buckets[idx];
        match bucket.iter().position(|e| e.peer == peer) {
            Some(pos) => {
                bucket.remove(pos);
                let _ = self.events.send(RoutingEvent::PeerRemoved(peer));
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        let key = key_of(&peer);
        self.bucket_index(&key)
            .map(|idx| self.buckets[idx].iter().any(|e| e.peer == peer))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Peers ordered by XOR distance from the local key, closest first.
    pub fn nearest(&self, count: usize) -> Vec<PeerId> {
        let mut all: Vec<&Entry> = self.buckets.iter().flatten().collect();
        all.sort_by_key(|e| {
            std::cmp::Reverse(common_prefix_len(&self.local_key, &e.key))
        });
        all.into_iter().take(count).map(|e| e.peer).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_peer() -> PeerId {
        libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RoutingEvent>) -> Vec<RoutingEvent> {
        let mut out = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            out.push(ev);
        }
        out
    }

    #[test]
    fn add_emits_event_once() {
        let local = some_peer();
        let (mut table, mut rx) = RoutingTable::with_default_bucket_size(local);
        let peer = some_peer();

        assert!(table.try_add(peer).unwrap());
        assert!(!table.try_add(peer).unwrap());
        assert!(table.contains(peer));
        assert_eq!(drain(&mut rx), vec![RoutingEvent::PeerAdded(peer)]);
    }

    #[test]
    fn remove_emits_event_only_for_members() {
        let local = some_peer();
        let (mut table, mut rx) = RoutingTable::with_default_bucket_size(local);
        let peer = some_peer();

        assert!(!table.remove(peer));
        table.try_add(peer).unwrap();
        drain(&mut rx);

        assert!(table.remove(peer));
        assert!(!table.contains(peer));
        assert_eq!(drain(&mut rx), vec![RoutingEvent::PeerRemoved(peer)]);
    }

    #[test]
    fn local_id_never_enters_the_table() {
        let local = some_peer();
        let (mut table, mut rx) = RoutingTable::with_default_bucket_size(local);
        assert!(!table.try_add(local).unwrap());
        assert!(drain(&mut rx).is_empty());
        assert!(table.is_empty());
    }

    #[test]
    fn full_bucket_rejects_fresh_residents() {
        let local = some_peer();
        // Bucket size 1 so any two peers sharing a bucket collide quickly.
        let (mut table, _rx) = RoutingTable::new(local, 1);

        let mut full_error = false;
        for _ in 0..64 {
            match table.try_add(some_peer()) {
                Ok(_) => {}
                Err(Error::RoutingTableFull) => {
                    full_error = true;
                    break;
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert!(full_error, "expected a full bucket within 64 random peers");
    }

    #[test]
    fn nearest_returns_at_most_count() {
        let local = some_peer();
        let (mut table, _rx) = RoutingTable::with_default_bucket_size(local);
        for _ in 0..8 {
            table.try_add(some_peer()).unwrap();
        }
        assert_eq!(table.nearest(3).len(), 3);
        assert_eq!(table.nearest(100).len(), 8);
    }
}
