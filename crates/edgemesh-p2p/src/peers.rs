//! Per-peer connection bookkeeping: the connection registry (direction of
//! every live connection plus cached per-protocol RPC channels) and the
//! peer store (known addresses with retention classes).

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Instant,
};

use libp2p::{core::ConnectedPoint, Multiaddr, PeerId};

use crate::{addr::AddrInfo, config::TEMP_ADDR_TTL, error::Result};

/// Direction of an established connection, from this node's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnDirection {
    Inbound,
    Outbound,
    Unknown,
}

impl From<&ConnectedPoint> for ConnDirection {
    fn from(endpoint: &ConnectedPoint) -> Self {
        match endpoint {
            ConnectedPoint::Dialer { .. } => ConnDirection::Outbound,
            ConnectedPoint::Listener { .. } => ConnDirection::Inbound,
        }
    }
}

/// Handle to an established per-protocol RPC channel to one peer.
///
/// RPC substreams are opened per request by the swarm; this handle is the
/// registry's unit of reuse and lifecycle. A closed handle refuses further
/// use even if clones are still held by callers.
#[derive(Debug, Clone)]
pub struct ProtoChannel {
    peer: PeerId,
    protocol: &'static str,
    open: Arc<AtomicBool>,
}

impl ProtoChannel {
    pub fn new(peer: PeerId, protocol: &'static str) -> Self {
        Self {
            peer,
            protocol,
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn protocol(&self) -> &'static str {
        self.protocol
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Live connection state for one peer.
#[derive(Debug, Clone)]
pub struct PeerConnInfo {
    pub info: AddrInfo,
    directions: HashSet<ConnDirection>,
    channels: HashMap<&'static str, ProtoChannel>,
}

impl PeerConnInfo {
    pub fn new(info: AddrInfo) -> Self {
        Self {
            info,
            directions: HashSet::new(),
            channels: HashMap::new(),
        }
    }

    /// Record a connection direction; returns `true` when it was already
    /// present.
    pub fn add_direction(&mut self, direction: ConnDirection) -> bool {
        !self.directions.insert(direction)
    }

    pub fn directions(&self) -> &HashSet<ConnDirection> {
        &self.directions
    }
}

/// Thread-safe map of all live peer connections. Owned exclusively by the
/// overlay server (or the relay client for its own peer set).
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<HashMap<PeerId, PeerConnInfo>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection with its direction.
    ///
    /// Returns `true` when the peer already had this exact direction
    /// recorded (the call is then a no-op).
    pub fn add(&self, info: AddrInfo, direction: ConnDirection) -> bool {
        let mut peers = self.peers.lock().unwrap();
        let entry = peers
            .entry(info.peer_id)
            .or_insert_with(|| PeerConnInfo::new(info));
        !entry.directions.insert(direction)
    }

    /// Cache an established protocol channel for later reuse.
    ///
    /// Saving a channel for a peer that is not in the registry is logged and
    /// dropped; the channel simply will not be reused.
    pub fn add_protocol_channel(&self, id: PeerId, channel: ProtoChannel) {
        let mut peers = self.peers.lock().unwrap();
        match peers.get_mut(&id) {
            Some(info) => {
                info.channels.insert(channel.protocol(), channel);
            }
            None => {
                tracing::warn!(
                    "Attempted to save protocol {} channel for non-existing peer {id}",
                    channel.protocol()
                );
            }
        }
    }

    /// Fetch a cached protocol channel, if any.
    pub fn protocol_channel(&self, id: PeerId, protocol: &str) -> Option<ProtoChannel> {
        let peers = self.peers.lock().unwrap();
        peers.get(&id).and_then(|p| p.channels.get(protocol)).cloned()
    }

    /// Detach and close a protocol channel. A missing channel is a no-op.
    pub fn remove_protocol_channel(&self, id: PeerId, protocol: &str) -> Result<()> {
        let mut peers = self.peers.lock().unwrap();
        if let Some(info) = peers.get_mut(&id) {
            if let Some(channel) = info.channels.remove(protocol) {
                channel.close();
            }
        }
        Ok(())
    }

    /// Drop the peer record entirely, closing every cached channel.
    /// Invoked from the network "disconnected" notification.
    pub fn remove(&self, id: PeerId) -> Option<PeerConnInfo> {
        let mut peers = self.peers.lock().unwrap();
        let info = peers.remove(&id)?;
        for channel in info.channels.values() {
            channel.close();
        }
        Some(info)
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.peers.lock().unwrap().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: PeerId) -> Option<PeerConnInfo> {
        self.peers.lock().unwrap().get(&id).cloned()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().unwrap().keys().copied().collect()
    }

    /// Uniformly random connected peer, drawn with the OS CSPRNG.
    pub fn random_peer(&self) -> Option<PeerId> {
        use rand::Rng;

        let peers = self.peers.lock().unwrap();
        if peers.is_empty() {
            return None;
        }
        let idx = rand::rngs::OsRng.gen_range(0..peers.len());
        peers.keys().nth(idx).copied()
    }
}

/// Address retention class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddrTtl {
    /// Kept until the peer is removed.
    Permanent,
    /// Kept for [`TEMP_ADDR_TTL`].
    Temporary,
}

#[derive(Debug, Clone)]
struct StoredAddr {
    addr: Multiaddr,
    ttl: AddrTtl,
    added: Instant,
}

/// Known addresses per peer, with retention classes.
#[derive(Debug, Default)]
pub struct PeerStore {
    inner: Mutex<HashMap<PeerId, Vec<StoredAddr>>>,
}

impl PeerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an address for a peer. Re-adding an address upgrades its
    /// retention class to the stronger of the two and refreshes its clock.
    pub fn add_addr(&self, id: PeerId, addr: Multiaddr, ttl: AddrTtl) {
        let mut inner = self.inner.lock().unwrap();
        let addrs = inner.entry(id).or_default();
        if let Some(existing) = addrs.iter_mut().find(|s| s.addr == addr) {
            if ttl == AddrTtl::Permanent {
                existing.ttl = AddrTtl::Permanent;
            }
            existing.added = Instant::now();
            return;
        }
        addrs.push(StoredAddr {
            addr,
            ttl,
            added: Instant::now(),
        });
    }

    /// All live (non-expired) addresses for a peer.
    pub fn addrs(&self, id: PeerId) -> Vec<Multiaddr> {
        let inner = self.inner.lock().unwrap();
        inner
            .get(&id)
            .map(|addrs| {
                addrs
                    .iter()
                    .filter(|s| {
                        s.ttl == AddrTtl::Permanent || s.added.elapsed() < TEMP_ADDR_TTL
                    })
                    .map(|s| s.addr.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The peer's `AddrInfo` as currently known (addresses may be empty).
    pub fn peer_info(&self, id: PeerId) -> AddrInfo {
        AddrInfo::new(id, self.addrs(id))
    }

    pub fn remove_peer(&self, id: PeerId) {
        self.inner.lock().unwrap().remove(&id);
    }

    pub fn known_peers(&self) -> Vec<PeerId> {
        self.inner.lock().unwrap().keys().copied().collect()
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

    fn info(id: PeerId) -> AddrInfo {
        AddrInfo::new(id, vec!["/ip4/127.0.0.1/tcp/1".parse().unwrap()])
    }

    #[test]
    fn add_is_idempotent_per_direction() {
        let reg = PeerRegistry::new();
        let id = some_peer();

        assert!(!reg.add(info(id), ConnDirection::Outbound));
        assert!(reg.add(info(id), ConnDirection::Outbound));
        // A second direction is new information, not a duplicate.
        assert!(!reg.add(info(id), ConnDirection::Inbound));

        let directions = reg.get(id).unwrap().directions().clone();
        assert_eq!(directions.len(), 2);
    }

    #[test]
    fn saving_channel_for_unknown_peer_is_dropped() {
        let reg = PeerRegistry::new();
        let id = some_peer();

        reg.add_protocol_channel(id, ProtoChannel::new(id, "/p"));
        assert!(reg.protocol_channel(id, "/p").is_none());
    }

    #[test]
    fn remove_closes_every_channel() {
        let reg = PeerRegistry::new();
        let id = some_peer();
        reg.add(info(id), ConnDirection::Inbound);

        let chan = ProtoChannel::new(id, "/p");
        reg.add_protocol_channel(id, chan.clone());
        assert!(reg.protocol_channel(id, "/p").unwrap().is_open());

        reg.remove(id);
        assert!(!chan.is_open());
        assert!(!reg.contains(id));
    }

    #[test]
    fn remove_protocol_channel_is_noop_when_missing() {
        let reg = PeerRegistry::new();
        let id = some_peer();
        reg.add(info(id), ConnDirection::Unknown);
        assert!(reg.remove_protocol_channel(id, "/p").is_ok());
    }

    #[test]
    fn peer_store_returns_added_addr() {
        let store = PeerStore::new();
        let id = some_peer();
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/9".parse().unwrap();

        store.add_addr(id, addr.clone(), AddrTtl::Permanent);
        assert!(store.peer_info(id).addrs.contains(&addr));
    }

    #[test]
    fn re_adding_addr_does_not_duplicate() {
        let store = PeerStore::new();
        let id = some_peer();
        let addr: Multiaddr = "/ip4/1.2.3.4/tcp/9".parse().unwrap();

        store.add_addr(id, addr.clone(), AddrTtl::Temporary);
        store.add_addr(id, addr, AddrTtl::Permanent);
        assert_eq!(store.addrs(id).len(), 1);
    }

    #[test]
    fn random_peer_requires_nonempty_registry() {
        let reg = PeerRegistry::new();
        assert!(reg.random_peer().is_none());

        let id = some_peer();
        reg.add(info(id), ConnDirection::Outbound);
        assert_eq!(reg.random_peer(), Some(id));
    }
}
