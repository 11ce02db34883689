use std::{path::PathBuf, time::Duration};

use libp2p::Multiaddr;

/// Minimum number of relaynodes that must be supplied to a relay client.
pub const MINIMUM_RELAY_NODES: usize = 1;

/// Default lower bound on concurrently held relay reservations.
pub const DEFAULT_MINIMUM_RELAY_CONNECTIONS: usize = 1;

/// Routing-table bucket capacity. Contract, not a tuning knob.
pub const DEFAULT_BUCKET_SIZE: usize = 256;

/// Routing-table peer staleness horizon.
pub const ROUTING_STALE_TIMEOUT: Duration = Duration::from_secs(60);

/// Routing-table backing-store TTL.
pub const ROUTING_STORE_TTL: Duration = Duration::from_secs(10);

/// Max peer count that can be requested from another peer in one
/// discovery round.
pub const MAX_DISCOVERY_PEER_REQ_COUNT: u32 = 16;

/// Cadence of the relay reservation keep-alive loop.
pub const RESERVATION_TICK: Duration = Duration::from_secs(5);

/// Interval at which random bootnodes are dialed for an alive check.
pub const BOOTNODE_ALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Cadence of the overlay discovery loop.
pub const DISCOVERY_TICK: Duration = Duration::from_secs(5);

/// Retention for addresses learned from short-lived sources.
pub const TEMP_ADDR_TTL: Duration = Duration::from_secs(2 * 60);

/// Assumed reservation lifetime when the relay's acceptance carries no
/// explicit limit (the circuit-relay v2 default lease).
pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(60 * 60);

/// Configuration for a public overlay node.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP listen address. Use `/ip4/0.0.0.0/tcp/0` for an OS-assigned port.
    pub listen_addr: Multiaddr,

    /// Bootstrap peers as full `/…/p2p/<id>` multiaddr strings.
    pub bootnodes: Vec<String>,

    /// Path to the persisted network key. `None` generates an ephemeral
    /// identity (tests).
    pub keypair_path: Option<PathBuf>,

    /// Human-readable node name reported in the application status.
    pub node_name: String,
}

impl ServerConfig {
    pub fn new(listen_addr: Multiaddr, bootnodes: Vec<String>) -> Self {
        Self {
            listen_addr,
            bootnodes,
            keypair_path: None,
            node_name: "edgemesh".to_owned(),
        }
    }
}

/// Configuration for a private node's relay client.
#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// Public relay hosts as full `/…/p2p/<id>` multiaddr strings.
    /// At least [`MINIMUM_RELAY_NODES`] entries are required.
    pub relaynodes: Vec<String>,

    /// How many live reservations the keep-alive loop maintains.
    pub minimum_relay_connections: usize,

    /// Path to the persisted network key.
    pub keypair_path: Option<PathBuf>,
}

impl RelayClientConfig {
    pub fn new(relaynodes: Vec<String>) -> Self {
        Self {
            relaynodes,
            minimum_relay_connections: DEFAULT_MINIMUM_RELAY_CONNECTIONS,
            keypair_path: None,
        }
    }
}

/// Configuration for a relay server (public reservation acceptor).
#[derive(Debug, Clone)]
pub struct RelayServerConfig {
    /// Listen address; must be publicly reachable in production.
    pub listen_addr: Multiaddr,

    /// Path to the persisted network key so the relay identity stays stable.
    pub keypair_path: Option<PathBuf>,
}

impl RelayServerConfig {
    pub fn new(listen_addr: Multiaddr) -> Self {
        Self {
            listen_addr,
            keypair_path: None,
        }
    }
}
