//! Relay server: a public node that accepts circuit-relay reservations from
//! private clients and hosts the alive service.
//!
//! The server is otherwise passive — it neither gossips addresses nor dials.

use std::sync::{Arc, Mutex};

use futures::StreamExt;
use libp2p::{
    multiaddr::Protocol,
    relay, request_response,
    swarm::SwarmEvent,
    Multiaddr, PeerId, Swarm,
};
use tokio::sync::{broadcast, watch};

use crate::{
    behaviour::{RelayServerBehaviour, RelayServerBehaviourEvent},
    config::RelayServerConfig,
    error::{Error, Result},
    identity::load_or_create_keypair,
    protocol::wire,
    transport::{build_transport, default_swarm_config},
};

type RelaySwarm = Swarm<RelayServerBehaviour>;

#[derive(Debug, Clone)]
pub enum RelayServerEvent {
    /// Listening on a full `/…/p2p/<id>` address.
    Listening(Multiaddr),
    /// A client's reservation request was accepted.
    ReservationAccepted(PeerId),
    /// An inbound circuit to a reserved client was opened.
    CircuitOpened { src: PeerId, dst: PeerId },
}

/// Cheap-to-clone handle to the running relay server.
#[derive(Clone)]
pub struct RelayServerHandle {
    local_peer_id: PeerId,
    event_tx: broadcast::Sender<RelayServerEvent>,
    shutdown_tx: watch::Sender<bool>,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
}

impl RelayServerHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayServerEvent> {
        self.event_tx.subscribe()
    }

    /// Full `/…/p2p/<id>` addresses the relay is reachable at.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.lock().unwrap().clone()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

pub struct RelayServer {
    config: RelayServerConfig,
}

impl RelayServer {
    pub fn new(config: RelayServerConfig) -> Self {
        Self { config }
    }

    /// Build the public host with the reservation acceptor and spawn the
    /// event loop.
    pub fn start(self) -> Result<RelayServerHandle> {
        let key = match &self.config.keypair_path {
            Some(p) => load_or_create_keypair(p)?,
            None => libp2p::identity::Keypair::generate_ed25519(),
        };
        let local_peer_id = key.public().to_peer_id();
        tracing::info!("Relay server starting peer_id={local_peer_id}");

        let transport = build_transport(&key)?;
        let behaviour = RelayServerBehaviour::new(&key);
        let mut swarm = Swarm::new(transport, behaviour, local_peer_id, default_swarm_config());

        swarm
            .listen_on(self.config.listen_addr.clone())
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (event_tx, _) = broadcast::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = RelayServerHandle {
            local_peer_id,
            event_tx,
            shutdown_tx,
            listen_addrs: Arc::new(Mutex::new(Vec::new())),
        };

        tokio::spawn(run_loop(swarm, handle.clone(), shutdown_rx));
        Ok(handle)
    }
}

async fn run_loop(
    mut swarm: RelaySwarm,
    handle: RelayServerHandle,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let local_peer_id = handle.local_peer_id;
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
            event = swarm.select_next_some() => {
                on_swarm_event(&mut swarm, &handle, local_peer_id, event);
            }
        }
    }
    tracing::info!("Relay server shut down");
}

fn on_swarm_event(
    swarm: &mut RelaySwarm,
    handle: &RelayServerHandle,
    local_peer_id: PeerId,
    event: SwarmEvent<RelayServerBehaviourEvent>,
) {
    match event {
        SwarmEvent::NewListenAddr { address, .. } => {
            // Advertise the full address so reservation responses carry a
            // dialable relay address including our identity.
            let full = address.with(Protocol::P2p(local_peer_id.into()));
            tracing::info!("Relay listening on {full}");
            swarm.add_external_address(full.clone());
            handle.listen_addrs.lock().unwrap().push(full.clone());
            let _ = handle.event_tx.send(RelayServerEvent::Listening(full));
        }

        SwarmEvent::ConnectionEstablished { peer_id, .. } => {
            tracing::debug!("Relay: connected to {peer_id}");
        }
        SwarmEvent::ConnectionClosed { peer_id, .. } => {
            tracing::debug!("Relay: disconnected from {peer_id}");
        }

        SwarmEvent::Behaviour(RelayServerBehaviourEvent::Relay(e)) => {
            match e {
                relay::Event::ReservationReqAccepted { src_peer_id, .. } => {
                    tracing::info!("Reservation accepted for {src_peer_id}");
                    let _ = handle
                        .event_tx
                        .send(RelayServerEvent::ReservationAccepted(src_peer_id));
                }
                relay::Event::CircuitReqAccepted {
                    src_peer_id,
                    dst_peer_id,
                    ..
                } => {
                    let _ = handle.event_tx.send(RelayServerEvent::CircuitOpened {
                        src: src_peer_id,
                        dst: dst_peer_id,
                    });
                }
                _ => tracing::debug!("relay event: {e:?}"),
            }
        }

        SwarmEvent::Behaviour(RelayServerBehaviourEvent::Alive(ev)) => {
            if let request_response::Event::Message {
                peer,
                message: request_response::Message::Request { channel, .. },
                ..
            } = ev
            {
                tracing::debug!("Hello from {peer}");
                let reply = wire::HelloReply { success: true };
                if swarm
                    .behaviour_mut()
                    .alive
                    .send_response(channel, reply)
                    .is_err()
                {
                    tracing::debug!("Hello reply to {peer} dropped (channel expired)");
                }
            }
        }

        SwarmEvent::Behaviour(RelayServerBehaviourEvent::Identify(_))
        | SwarmEvent::Behaviour(RelayServerBehaviourEvent::Ping(_)) => {}

        _ => {}
    }
}
