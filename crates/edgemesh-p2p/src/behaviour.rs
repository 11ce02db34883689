//! libp2p `NetworkBehaviour` compositions.
//!
//! `ServerBehaviour`      — public overlay nodes (C4).
//! `RelayClientBehaviour` — private nodes reserving relay circuits (C5).
//! `RelayServerBehaviour` — public relay hosts (C6).
//!
//! The derive macro generates the matching `*BehaviourEvent` enums.

use std::time::Duration;

use libp2p::{
    gossipsub, identify, identity, ping, relay, request_response,
    swarm::NetworkBehaviour,
};

use crate::{
    error::Error,
    protocol::{
        codec::ProstCodec,
        wire::{
            AliveStatus, FindPeersReq, FindPeersResp, HelloReply, SyncAppRequest,
            SyncAppResponse,
        },
        ALIVE_PROTO, DISCOVERY_PROTO, ID_PROTO, SYNCAPP_PROTO,
    },
};

pub type DiscoveryCodec = ProstCodec<FindPeersReq, FindPeersResp>;
pub type AliveCodec = ProstCodec<AliveStatus, HelloReply>;
pub type SyncAppCodec = ProstCodec<SyncAppRequest, SyncAppResponse>;

pub type DiscoveryEvent = request_response::Event<FindPeersReq, FindPeersResp>;
pub type AliveEvent = request_response::Event<AliveStatus, HelloReply>;
pub type SyncAppEvent = request_response::Event<SyncAppRequest, SyncAppResponse>;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);

fn build_gossipsub(key: &identity::Keypair) -> Result<gossipsub::Behaviour, Error> {
    let config = gossipsub::ConfigBuilder::default()
        .heartbeat_interval(Duration::from_secs(1))
        .validation_mode(gossipsub::ValidationMode::Strict)
        .build()
        .map_err(|e| Error::Config(format!("gossipsub config: {e}")))?;
    gossipsub::Behaviour::new(
        gossipsub::MessageAuthenticity::Signed(key.clone()),
        config,
    )
    .map_err(|e| Error::Config(format!("gossipsub: {e}")))
}

fn build_identify(key: &identity::Keypair) -> identify::Behaviour {
    identify::Behaviour::new(identify::Config::new(ID_PROTO.into(), key.public()))
}

fn build_ping() -> ping::Behaviour {
    ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(15)))
}

fn build_alive() -> request_response::Behaviour<AliveCodec> {
    request_response::Behaviour::with_codec(
        AliveCodec::default(),
        [(ALIVE_PROTO, request_response::ProtocolSupport::Full)],
        request_response::Config::default().with_request_timeout(RPC_TIMEOUT),
    )
}

// ── Overlay server (public node) ──────────────────────────────────────────────

#[derive(NetworkBehaviour)]
pub struct ServerBehaviour {
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub gossipsub: gossipsub::Behaviour,
    pub discovery: request_response::Behaviour<DiscoveryCodec>,
    pub alive: request_response::Behaviour<AliveCodec>,
    pub syncapp: request_response::Behaviour<SyncAppCodec>,
}

impl ServerBehaviour {
    pub fn new(key: &identity::Keypair) -> Result<Self, Error> {
        Ok(Self {
            identify: build_identify(key),
            ping: build_ping(),
            gossipsub: build_gossipsub(key)?,
            discovery: request_response::Behaviour::with_codec(
                DiscoveryCodec::default(),
                [(DISCOVERY_PROTO, request_response::ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(RPC_TIMEOUT),
            ),
            alive: build_alive(),
            syncapp: request_response::Behaviour::with_codec(
                SyncAppCodec::default(),
                [(SYNCAPP_PROTO, request_response::ProtocolSupport::Full)],
                request_response::Config::default().with_request_timeout(RPC_TIMEOUT),
            ),
        })
    }
}

// ── Relay client (private node) ───────────────────────────────────────────────

#[derive(NetworkBehaviour)]
pub struct RelayClientBehaviour {
    pub relay_client: relay::client::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub alive: request_response::Behaviour<AliveCodec>,
}

impl RelayClientBehaviour {
    pub fn new(key: &identity::Keypair, relay_client: relay::client::Behaviour) -> Self {
        Self {
            relay_client,
            identify: build_identify(key),
            ping: build_ping(),
            alive: build_alive(),
        }
    }
}

// ── Relay server ──────────────────────────────────────────────────────────────

#[derive(NetworkBehaviour)]
pub struct RelayServerBehaviour {
    pub relay: relay::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
    pub alive: request_response::Behaviour<AliveCodec>,
}

impl RelayServerBehaviour {
    pub fn new(key: &identity::Keypair) -> Self {
        let local_peer_id = key.public().to_peer_id();
        Self {
            relay: relay::Behaviour::new(local_peer_id, relay::Config::default()),
            identify: build_identify(key),
            ping: build_ping(),
            alive: build_alive(),
        }
    }
}
