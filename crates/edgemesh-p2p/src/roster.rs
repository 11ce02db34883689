//! Static bootstrap set (bootnodes or relaynodes) with a live-connection
//! counter.
//!
//! Random picks use the OS CSPRNG so an adversary cannot bias which
//! bootstrap host a node probes next.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
};

use libp2p::PeerId;
use rand::Rng;

use crate::{
    addr::AddrInfo,
    error::{Error, Result},
};

#[derive(Debug)]
pub struct Roster {
    nodes: Vec<AddrInfo>,
    index: HashMap<PeerId, usize>,
    conn_count: AtomicI64,
}

impl Roster {
    /// Parse the configured multiaddr strings into a roster.
    ///
    /// Entries whose identity equals `local_id` are silently skipped (a node
    /// never bootstraps against itself). Fails when fewer than `minimum`
    /// entries are supplied, or when nothing usable remains after filtering.
    pub fn parse(raw: &[String], local_id: PeerId, minimum: usize) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::NoRelaynodes);
        }
        if raw.len() < minimum {
            return Err(Error::MinimumNodes {
                minimum,
                supplied: raw.len(),
            });
        }

        let mut nodes = Vec::with_capacity(raw.len());
        let mut index = HashMap::new();
        for entry in raw {
            let info = AddrInfo::from_multiaddr_str(entry)?;
            if info.peer_id == local_id {
                tracing::info!("Omitting roster entry with same id as host: {}", info.peer_id);
                continue;
            }
            index.insert(info.peer_id, nodes.len());
            nodes.push(info);
        }

        if nodes.is_empty() {
            return Err(Error::MinimumNodes {
                minimum,
                supplied: 0,
            });
        }

        Ok(Self {
            nodes,
            index,
            conn_count: AtomicI64::new(0),
        })
    }

    /// Roster with no entries, for nodes that bootstrap the network
    /// themselves.
    pub fn empty() -> Self {
        Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            conn_count: AtomicI64::new(0),
        }
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn get(&self, id: PeerId) -> Option<&AddrInfo> {
        self.index.get(&id).map(|&i| &self.nodes[i])
    }

    pub fn nodes(&self) -> &[AddrInfo] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Uniformly random roster entry.
    pub fn get_random(&self) -> Option<&AddrInfo> {
        if self.nodes.is_empty() {
            return None;
        }
        let idx = rand::rngs::OsRng.gen_range(0..self.nodes.len());
        Some(&self.nodes[idx])
    }

    /// Uniformly random entry for which `is_connected` is false.
    pub fn get_random_unconnected(
        &self,
        is_connected: impl Fn(PeerId) -> bool,
    ) -> Option<&AddrInfo> {
        let candidates: Vec<&AddrInfo> = self
            .nodes
            .iter()
            .filter(|n| !is_connected(n.peer_id))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::rngs::OsRng.gen_range(0..candidates.len());
        Some(candidates[idx])
    }

    pub fn conn_count(&self) -> i64 {
        self.conn_count.load(Ordering::SeqCst)
    }

    pub fn inc_conn_count(&self) {
        self.conn_count.fetch_add(1, Ordering::SeqCst);
    }

    pub fn dec_conn_count(&self) {
        self.conn_count.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn keypair() -> libp2p::identity::Keypair {
        libp2p::identity::Keypair::generate_ed25519()
    }

    fn entry(id: PeerId, port: u16) -> String {
        format!("/ip4/127.0.0.1/tcp/{port}/p2p/{id}")
    }

    #[test]
    fn requires_minimum_entries() {
        let local = keypair().public().to_peer_id();
        assert!(matches!(
            Roster::parse(&[], local, 1),
            Err(Error::NoRelaynodes)
        ));

        let one = vec![entry(keypair().public().to_peer_id(), 1)];
        assert!(matches!(
            Roster::parse(&one, local, 2),
            Err(Error::MinimumNodes { .. })
        ));
    }

    #[test]
    fn skips_self_and_fails_when_nothing_remains() {
        let local = keypair().public().to_peer_id();
        let only_self = vec![entry(local, 1)];
        assert!(matches!(
            Roster::parse(&only_self, local, 1),
            Err(Error::MinimumNodes { .. })
        ));

        let other = keypair().public().to_peer_id();
        let mixed = vec![entry(local, 1), entry(other, 2)];
        let roster = Roster::parse(&mixed, local, 1).unwrap();
        assert_eq!(roster.len(), 1);
        assert!(roster.contains(other));
        assert!(!roster.contains(local));
    }

    #[test]
    fn random_unconnected_respects_predicate() {
        let local = keypair().public().to_peer_id();
        let a = keypair().public().to_peer_id();
        let b = keypair().public().to_peer_id();
        let roster =
            Roster::parse(&[entry(a, 1), entry(b, 2)], local, 1).unwrap();

        let connected: HashSet<PeerId> = [a].into_iter().collect();
        for _ in 0..16 {
            let pick = roster
                .get_random_unconnected(|id| connected.contains(&id))
                .unwrap();
            assert_eq!(pick.peer_id, b);
        }

        let all: HashSet<PeerId> = [a, b].into_iter().collect();
        assert!(roster
            .get_random_unconnected(|id| all.contains(&id))
            .is_none());
    }

    #[test]
    fn conn_count_tracks_inc_dec() {
        let local = keypair().public().to_peer_id();
        let roster =
            Roster::parse(&[entry(keypair().public().to_peer_id(), 1)], local, 1).unwrap();
        assert_eq!(roster.conn_count(), 0);
        roster.inc_conn_count();
        roster.inc_conn_count();
        roster.dec_conn_count();
        assert_eq!(roster.conn_count(), 1);
    }
}
