//! Peer-store-update gossip state.
//!
//! Every node keeps at most one update record per peer. Locally observed
//! addresses are published on the `route_table/0.2` topic; records learned
//! *from* the topic are stored but never re-published, which is the single
//! rule that keeps the gossip from amplifying.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Instant,
};

use libp2p::PeerId;

use crate::{
    addr::AddrInfo,
    config::TEMP_ADDR_TTL,
    peers::{AddrTtl, PeerStore},
    protocol::wire,
};

/// Deduplication record for one peer's gossiped address info.
#[derive(Debug, Clone)]
pub struct PeerUpdateInfo {
    pub info: AddrInfo,
    /// Who told us (the local id for addresses observed here).
    pub from: PeerId,
    pub update_time: Instant,
    pub publish_time: Instant,
}

#[derive(Debug)]
pub struct UpdateTracker {
    local_id: PeerId,
    peers: Mutex<HashMap<PeerId, PeerUpdateInfo>>,
}

impl UpdateTracker {
    pub fn new(local_id: PeerId) -> Self {
        Self {
            local_id,
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Record an address update for `id` as reported by `from`.
    ///
    /// Returns the `PeerInfo` message to publish when the record is fresh
    /// enough to warrant it and the update originated locally
    /// (`gossip == false`). Relayed gossip is never re-published.
    ///
    /// The two sequential republish-window checks mirror the upstream
    /// behavior exactly, including the fact that the second predicate is
    /// evaluated against the freshly bumped publish time.
    pub fn add_peer_update_info(
        &self,
        from: PeerId,
        id: PeerId,
        info: AddrInfo,
        gossip: bool,
    ) -> Option<wire::PeerInfo> {
        let mut peers = self.peers.lock().unwrap();

        tracing::debug!(
            "addPeerUpdateInfo id={id} from={from} gossip={gossip} addrs={:?}",
            info.addrs
        );

        let mut need_to_publish = false;
        let published_info;
        match peers.get_mut(&id) {
            None => {
                let now = Instant::now();
                published_info = info.clone();
                peers.insert(
                    id,
                    PeerUpdateInfo {
                        info,
                        from,
                        update_time: now,
                        publish_time: now,
                    },
                );
                need_to_publish = true;
            }
            Some(record) => {
                if record.publish_time > record.update_time + TEMP_ADDR_TTL {
                    record.publish_time = Instant::now();
                    need_to_publish = true;
                }
                if record.publish_time > record.update_time + TEMP_ADDR_TTL {
                    record.info = info.clone();
                    record.from = from;
                    record.update_time = Instant::now();
                    need_to_publish = true;
                }
                published_info = info;
            }
        }

        if !gossip && need_to_publish {
            return Some(wire::PeerInfo {
                from: self.local_id.to_string(),
                nodes: vec![published_info.to_multiaddr_string()],
            });
        }
        None
    }

    /// Process one incoming `route_table/0.2` message.
    ///
    /// Self-originated messages are discarded silently. Addresses that fail
    /// to parse are logged and skipped; the rest land in the peer store with
    /// permanent retention and are recorded as relayed gossip (so they are
    /// never re-published). Returns the accepted records so the caller can
    /// mirror them into the swarm's address book.
    pub fn handle_peer_store_update(
        &self,
        msg: &wire::PeerInfo,
        peer_store: &PeerStore,
    ) -> Vec<AddrInfo> {
        let from: PeerId = match msg.from.parse() {
            Ok(id) => id,
            Err(_) => {
                tracing::error!("gossip message carries invalid origin id: {}", msg.from);
                return Vec::new();
            }
        };
        if from == self.local_id {
            return Vec::new();
        }

        let mut accepted = Vec::new();
        for raw in &msg.nodes {
            let node = match AddrInfo::from_multiaddr_str(raw) {
                Ok(node) => node,
                Err(e) => {
                    tracing::error!("failed to parse gossiped addr {raw}: {e}");
                    continue;
                }
            };
            for addr in &node.addrs {
                peer_store.add_addr(node.peer_id, addr.clone(), AddrTtl::Permanent);
            }
            tracing::debug!("peer store update from={from} node={}", node.peer_id);
            self.add_peer_update_info(from, node.peer_id, node.clone(), true);
            accepted.push(node);
        }
        accepted
    }

    pub fn get(&self, id: PeerId) -> Option<PeerUpdateInfo> {
        self.peers.lock().unwrap().get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn set_times(&self, id: PeerId, update_time: Instant, publish_time: Instant) {
        let mut peers = self.peers.lock().unwrap();
        let record = peers.get_mut(&id).expect("record exists");
        record.update_time = update_time;
        record.publish_time = publish_time;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn some_peer() -> PeerId {
        libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
    }

    fn info(id: PeerId) -> AddrInfo {
        AddrInfo::new(id, vec!["/ip4/1.2.3.4/tcp/9".parse().unwrap()])
    }

    #[test]
    fn first_local_update_publishes_single_node() {
        let local = some_peer();
        let tracker = UpdateTracker::new(local);
        let peer = some_peer();

        let msg = tracker
            .add_peer_update_info(local, peer, info(peer), false)
            .expect("fresh record publishes");
        assert_eq!(msg.from, local.to_string());
        assert_eq!(msg.nodes, vec![format!("/ip4/1.2.3.4/tcp/9/p2p/{peer}")]);
    }

    #[test]
    fn relayed_gossip_is_never_republished() {
        let local = some_peer();
        let tracker = UpdateTracker::new(local);
        let (remote, peer) = (some_peer(), some_peer());

        assert!(tracker
            .add_peer_update_info(remote, peer, info(peer), true)
            .is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn repeat_update_inside_window_is_a_noop() {
        let local = some_peer();
        let tracker = UpdateTracker::new(local);
        let peer = some_peer();

        tracker.add_peer_update_info(local, peer, info(peer), false);
        let first = tracker.get(peer).unwrap();

        let other = AddrInfo::new(peer, vec!["/ip4/9.9.9.9/tcp/9".parse().unwrap()]);
        assert!(tracker
            .add_peer_update_info(local, peer, other, false)
            .is_none());

        let second = tracker.get(peer).unwrap();
        assert_eq!(second.info.addrs, first.info.addrs);
        assert_eq!(second.update_time, first.update_time);
    }

    #[test]
    fn stale_record_is_refreshed_through_both_checks() {
        let local = some_peer();
        let tracker = UpdateTracker::new(local);
        let peer = some_peer();

        tracker.add_peer_update_info(local, peer, info(peer), false);
        // Simulate a record whose last republish outran its update clock.
        let now = Instant::now();
        tracker.set_times(
            peer,
            now - Duration::from_secs(600),
            now - Duration::from_secs(300),
        );

        let other = AddrInfo::new(peer, vec!["/ip4/9.9.9.9/tcp/9".parse().unwrap()]);
        let msg = tracker
            .add_peer_update_info(local, peer, other.clone(), false)
            .expect("stale record republishes");
        assert_eq!(msg.nodes.len(), 1);

        let record = tracker.get(peer).unwrap();
        assert_eq!(record.info.addrs, other.addrs);
        assert!(record.update_time > now - Duration::from_secs(1));
    }

    #[test]
    fn self_originated_gossip_is_discarded() {
        let local = some_peer();
        let tracker = UpdateTracker::new(local);
        let store = PeerStore::new();
        let peer = some_peer();

        let msg = wire::PeerInfo {
            from: local.to_string(),
            nodes: vec![format!("/ip4/1.2.3.4/tcp/9/p2p/{peer}")],
        };
        tracker.handle_peer_store_update(&msg, &store);

        assert!(tracker.is_empty());
        assert!(store.addrs(peer).is_empty());
    }

    #[test]
    fn malformed_entries_are_skipped_not_fatal() {
        let local = some_peer();
        let tracker = UpdateTracker::new(local);
        let store = PeerStore::new();
        let (remote, peer) = (some_peer(), some_peer());

        let msg = wire::PeerInfo {
            from: remote.to_string(),
            nodes: vec![
                "garbage".into(),
                "/ip4/1.2.3.4/tcp/9".into(), // no identity
                format!("/ip4/1.2.3.4/tcp/9/p2p/{peer}"),
            ],
        };
        tracker.handle_peer_store_update(&msg, &store);

        assert_eq!(tracker.len(), 1);
        assert_eq!(store.addrs(peer).len(), 1);
    }

    #[test]
    fn incoming_gossip_lands_in_peer_store() {
        let local = some_peer();
        let tracker = UpdateTracker::new(local);
        let store = PeerStore::new();
        let (remote, peer) = (some_peer(), some_peer());

        let msg = wire::PeerInfo {
            from: remote.to_string(),
            nodes: vec![format!("/ip4/1.2.3.4/tcp/9/p2p/{peer}")],
        };
        tracker.handle_peer_store_update(&msg, &store);

        let stored = store.peer_info(peer);
        assert_eq!(stored.addrs, vec!["/ip4/1.2.3.4/tcp/9".parse().unwrap()]);
        assert_eq!(tracker.get(peer).unwrap().from, remote);
    }
}
