//! Protocol identifiers and wire-level plumbing.

pub mod codec;
pub mod wire;

use libp2p::StreamProtocol;

/// Peer-discovery RPC.
pub const DISCOVERY_PROTO_NAME: &str = "/edgemesh/disc/0.2";
pub const DISCOVERY_PROTO: StreamProtocol = StreamProtocol::new(DISCOVERY_PROTO_NAME);

/// Liveness RPC between private nodes and bootnodes.
pub const ALIVE_PROTO_NAME: &str = "/edgemesh/alive/0.2";
pub const ALIVE_PROTO: StreamProtocol = StreamProtocol::new(ALIVE_PROTO_NAME);

/// Application status/data sync RPC; transported, never interpreted.
pub const SYNCAPP_PROTO_NAME: &str = "/edgemesh/syncapp/0.2";
pub const SYNCAPP_PROTO: StreamProtocol = StreamProtocol::new(SYNCAPP_PROTO_NAME);

/// Gossip topic for peer-store updates. The name is a wire contract.
pub const ROUTE_TABLE_TOPIC: &str = "route_table/0.2";

/// Identify protocol string exchanged between overlay nodes.
pub const ID_PROTO: &str = "/edgemesh/id/0.2";
