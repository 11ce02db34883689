//! Peer address records and multiaddr helpers.
//!
//! An overlay address is multi-layered: `/ip4/…/tcp/…/p2p/<id>` for a
//! directly reachable node, or `<relay>/p2p-circuit/p2p/<id>` for a node
//! that is only reachable through a relay circuit.

use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};

use crate::error::{Error, Result};

/// A peer identity together with the transport addresses it is known under.
///
/// Equality is by identity only; the address set may grow over time.
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PartialEq for AddrInfo {
    fn eq(&self, other: &Self) -> bool {
        self.peer_id == other.peer_id
    }
}

impl Eq for AddrInfo {}

impl AddrInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }

    /// Parse a full `/…/p2p/<id>` multiaddr string into an `AddrInfo`.
    ///
    /// The trailing `/p2p/<id>` component is split off into the identity;
    /// the remainder becomes the transport address. Fails when the string is
    /// not a multiaddr or carries no identity.
    pub fn from_multiaddr_str(raw: &str) -> Result<Self> {
        let addr: Multiaddr = raw
            .parse()
            .map_err(|e| Error::Config(format!("failed to parse multiaddr {raw}: {e}")))?;
        Self::from_multiaddr(addr)
    }

    /// Split a full multiaddr into identity + transport address.
    pub fn from_multiaddr(mut addr: Multiaddr) -> Result<Self> {
        match addr.pop() {
            Some(Protocol::P2p(mh)) => {
                let peer_id = PeerId::from_multihash(mh.into())
                    .map_err(|_| Error::Config(format!("invalid peer id in {addr}")))?;
                Ok(Self::new(peer_id, vec![addr]))
            }
            _ => Err(Error::Config(format!("multiaddr {addr} has no /p2p component"))),
        }
    }

    /// Render the first address back into canonical `/…/p2p/<id>` text form.
    pub fn to_multiaddr_string(&self) -> String {
        match self.addrs.first() {
            Some(a) => format!("{}/p2p/{}", a, self.peer_id),
            None => format!("/p2p/{}", self.peer_id),
        }
    }

    /// Full dialable multiaddr (first address with the `/p2p` suffix).
    pub fn dial_addr(&self) -> Option<Multiaddr> {
        self.addrs
            .first()
            .map(|a| a.clone().with(Protocol::P2p(self.peer_id.into())))
    }
}

/// Extract the last `/p2p/<id>` component of an address, if any.
///
/// For circuit addresses this is the *target* peer; the relay's own id sits
/// before the `/p2p-circuit` component.
pub fn peer_id_from_addr(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter()
        .filter_map(|p| match p {
            Protocol::P2p(mh) => PeerId::from_multihash(mh.into()).ok(),
            _ => None,
        })
        .last()
}

/// Build the circuit listen/dial address `<relay>/p2p/<relay-id>/p2p-circuit`.
pub fn circuit_listen_addr(relay_addr: &Multiaddr, relay_id: PeerId) -> Multiaddr {
    let mut a = relay_addr.clone();
    if !matches!(a.iter().last(), Some(Protocol::P2p(_))) {
        a.push(Protocol::P2p(relay_id.into()));
    }
    a.push(Protocol::P2pCircuit);
    a
}

/// Build the advertised address `<relay>/p2p/<relay-id>/p2p-circuit/p2p/<self>`.
pub fn circuit_addr(relay_addr: &Multiaddr, relay_id: PeerId, target: PeerId) -> Multiaddr {
    circuit_listen_addr(relay_addr, relay_id).with(Protocol::P2p(target.into()))
}

/// Extract the relay server's `PeerId` from a circuit address: the `/p2p`
/// component seen immediately before `/p2p-circuit`.
pub fn relay_peer_from_circuit_addr(addr: &Multiaddr) -> Option<PeerId> {
    let mut last_peer: Option<PeerId> = None;
    for proto in addr.iter() {
        match proto {
            Protocol::P2pCircuit => return last_peer,
            Protocol::P2p(mh) => last_peer = PeerId::from_multihash(mh.into()).ok(),
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_peer() -> PeerId {
        libp2p::identity::Keypair::generate_ed25519()
            .public()
            .to_peer_id()
    }

    #[test]
    fn multiaddr_string_round_trip() {
        let id = some_peer();
        let raw = format!("/ip4/1.2.3.4/tcp/9/p2p/{id}");
        let info = AddrInfo::from_multiaddr_str(&raw).unwrap();
        assert_eq!(info.peer_id, id);
        assert_eq!(info.addrs, vec!["/ip4/1.2.3.4/tcp/9".parse::<Multiaddr>().unwrap()]);
        assert_eq!(info.to_multiaddr_string(), raw);
    }

    #[test]
    fn rejects_addr_without_identity() {
        assert!(AddrInfo::from_multiaddr_str("/ip4/1.2.3.4/tcp/9").is_err());
        assert!(AddrInfo::from_multiaddr_str("not a multiaddr").is_err());
    }

    #[test]
    fn circuit_addr_shape() {
        let relay = some_peer();
        let target = some_peer();
        let base: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();

        let addr = circuit_addr(&base, relay, target);
        assert_eq!(
            addr.to_string(),
            format!("/ip4/127.0.0.1/tcp/4001/p2p/{relay}/p2p-circuit/p2p/{target}")
        );
        assert_eq!(relay_peer_from_circuit_addr(&addr), Some(relay));
        assert_eq!(peer_id_from_addr(&addr), Some(target));
    }

    #[test]
    fn circuit_listen_addr_keeps_existing_identity() {
        let relay = some_peer();
        let base: Multiaddr = format!("/ip4/127.0.0.1/tcp/4001/p2p/{relay}").parse().unwrap();
        let addr = circuit_listen_addr(&base, relay);
        assert_eq!(
            addr.to_string(),
            format!("/ip4/127.0.0.1/tcp/4001/p2p/{relay}/p2p-circuit")
        );
    }

    #[test]
    fn addr_info_equality_is_by_identity() {
        let id = some_peer();
        let a = AddrInfo::new(id, vec!["/ip4/1.1.1.1/tcp/1".parse().unwrap()]);
        let b = AddrInfo::new(id, vec!["/ip4/2.2.2.2/tcp/2".parse().unwrap()]);
        assert_eq!(a, b);
    }
}
