//! Transport construction shared by all node kinds.

use std::time::Duration;

use futures::future;
use libp2p::{
    core::{muxing::StreamMuxerBox, transport::Boxed, upgrade},
    identity, noise,
    relay::client::Transport as RelayTransport,
    swarm::Config as SwarmConfig,
    tcp, yamux, PeerId, Transport,
};

use crate::error::Error;

/// Build a TCP transport with Noise encryption and Yamux multiplexing.
///
/// Used as-is by public nodes (overlay server, relay server).
pub fn build_transport(
    key: &identity::Keypair,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, Error> {
    let noise_config = noise::Config::new(key).map_err(|e| Error::Transport(e.to_string()))?;

    let transport = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(noise_config)
        .multiplex(yamux::Config::default())
        .boxed();
    Ok(transport)
}

/// Build the private-node transport: TCP composed with the circuit-relay
/// client transport, both upgraded with Noise + Yamux.
///
/// The relay half lets the node listen on `<relay>/p2p-circuit` addresses
/// even though it has no direct listen address of its own.
pub fn build_client_transport(
    key: &identity::Keypair,
    relay_transport: RelayTransport,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, Error> {
    let tcp_t = tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
        .upgrade(upgrade::Version::V1)
        .authenticate(noise::Config::new(key).map_err(|e| Error::Transport(e.to_string()))?)
        .multiplex(yamux::Config::default())
        .map(|(p, m), _| (p, StreamMuxerBox::new(m)));

    let relay_t = relay_transport
        .upgrade(upgrade::Version::V1)
        .authenticate(noise::Config::new(key).map_err(|e| Error::Transport(e.to_string()))?)
        .multiplex(yamux::Config::default())
        .map(|(p, m), _| (p, StreamMuxerBox::new(m)));

    let transport = tcp_t
        .or_transport(relay_t)
        .map(|either, _| match either {
            future::Either::Left(v) => v,
            future::Either::Right(v) => v,
        })
        .boxed();
    Ok(transport)
}

/// Default swarm configuration: 60 s idle connection timeout so relay
/// reservations and slow RPC exchanges survive between uses.
pub fn default_swarm_config() -> SwarmConfig {
    SwarmConfig::with_tokio_executor().with_idle_connection_timeout(Duration::from_secs(60))
}
