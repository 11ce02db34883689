use std::path::PathBuf;

use clap::{Parser, Subcommand};
use edgemesh_registry::NodeRole;
use libp2p::Multiaddr;

#[derive(Parser, Debug)]
#[command(name = "edgemesh", about = "Peer-to-peer overlay node for the edge matrix network")]
pub struct Cli {
    /// Path to a YAML config file providing bootnode/relaynode lists.
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Directory for the network key and other node state.
    /// Defaults to the platform data dir.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Log to stderr at debug level (RUST_LOG overrides).
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a public overlay node.
    ///
    /// Hosts the discovery, alive and syncapp protocols, participates in
    /// the route-table gossip and dials peers learned from bootnodes.
    Node {
        /// TCP listen address.
        #[arg(long, default_value = "/ip4/0.0.0.0/tcp/50001")]
        listen: Multiaddr,

        /// Bootnode multiaddrs (full `/…/p2p/<id>` form). May also come
        /// from the config file.
        #[arg(long)]
        bootnodes: Vec<String>,

        /// Role advertised to the node registry.
        #[arg(long, default_value = "router")]
        role: NodeRole,

        /// Human-readable node name reported in the app status.
        #[arg(long)]
        name: Option<String>,

        /// Base URL of the registry HTTP gateway. Registration is skipped
        /// when absent.
        #[arg(long)]
        registry_url: Option<String>,

        /// Registry canister id.
        #[arg(long, default_value = "bw4dl-smaaa-aaaaa-qaacq-cai")]
        canister: String,

        /// Principal owning the registration. Defaults to the peer id.
        #[arg(long)]
        principal: Option<String>,
    },

    /// Start a private edge node.
    ///
    /// Creates no listen address of its own; reachability comes from relay
    /// reservations kept alive on the configured relaynodes.
    Edge {
        /// Relaynode multiaddrs (full `/…/p2p/<id>` form). May also come
        /// from the config file.
        #[arg(long)]
        relaynodes: Vec<String>,

        /// How many concurrent relay reservations to maintain.
        #[arg(long, default_value_t = 1)]
        min_relay_connections: usize,

        /// Role advertised to the node registry.
        #[arg(long, default_value = "computing")]
        role: NodeRole,

        /// Base URL of the registry HTTP gateway. Registration is skipped
        /// when absent.
        #[arg(long)]
        registry_url: Option<String>,

        /// Registry canister id.
        #[arg(long, default_value = "bw4dl-smaaa-aaaaa-qaacq-cai")]
        canister: String,

        /// Principal owning the registration. Defaults to the peer id.
        #[arg(long)]
        principal: Option<String>,
    },

    /// Start a relay server (public reservation acceptor).
    Relay {
        /// TCP listen address; must be publicly reachable in production.
        #[arg(long, default_value = "/ip4/0.0.0.0/tcp/50002")]
        listen: Multiaddr,
    },
}
