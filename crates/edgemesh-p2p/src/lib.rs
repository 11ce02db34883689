//! Peer-to-peer overlay control plane for edge matrix nodes.
//!
//! Public nodes run the overlay [`server`]: protocol handlers, a dial queue,
//! a bounded routing table and the `route_table/0.2` peer-update gossip.
//! Private nodes run the [`relay::client`], which keeps circuit reservations
//! alive on public relay hosts so the node stays dialable; those hosts run
//! the [`relay::server`].

pub mod addr;
pub mod behaviour;
pub mod config;
pub mod dial;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod peers;
pub mod protocol;
pub mod relay;
pub mod roster;
pub mod routing;
pub mod server;
pub mod syncapp;
pub mod transport;

pub use addr::AddrInfo;
pub use config::{RelayClientConfig, RelayServerConfig, ServerConfig};
pub use error::{Error, Result};
pub use peers::{AddrTtl, ConnDirection, PeerConnInfo, PeerRegistry, PeerStore};
pub use relay::{
    client::{RelayClient, RelayClientEvent, RelayClientHandle, RelayPeerInfo, Reservation},
    server::{RelayServer, RelayServerEvent, RelayServerHandle},
};
pub use server::{Server, ServerEvent, ServerHandle};
pub use syncapp::{NodeStatus, SyncAppHandler};
