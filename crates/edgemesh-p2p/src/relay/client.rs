//! Relay client: the private node's side of the rendezvous.
//!
//! A private node has no listen address of its own. It maintains at least
//! `minimum_relay_connections` circuit reservations on the configured
//! relaynodes, so that its advertised address is always of the form
//! `<relay>/p2p-circuit/p2p/<self>`, and it pings a random bootnode with an
//! alive `Hello` once a minute to keep the mesh warm.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use futures::StreamExt;
use libp2p::{
    core::transport::ListenerId,
    relay,
    request_response::{self, OutboundRequestId},
    swarm::{dial_opts::DialOpts, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    time::{interval_at, Instant as TokioInstant, MissedTickBehavior},
};

use crate::{
    addr::{circuit_addr, circuit_listen_addr, AddrInfo},
    behaviour::{RelayClientBehaviour, RelayClientBehaviourEvent},
    config::{
        RelayClientConfig, BOOTNODE_ALIVE_INTERVAL, DEFAULT_RESERVATION_TTL,
        MINIMUM_RELAY_NODES, RESERVATION_TICK,
    },
    error::{Error, Result},
    identity::load_or_create_keypair,
    peers::{AddrTtl, ConnDirection, PeerConnInfo, PeerRegistry, PeerStore, ProtoChannel},
    protocol::{wire, ALIVE_PROTO_NAME},
    roster::Roster,
    transport::{build_client_transport, default_swarm_config},
};

type ClientSwarm = Swarm<RelayClientBehaviour>;

/// Back-off floor/ceiling for failed reservation attempts, keyed by
/// relaynode id so one dead relay cannot hot-loop the keep-alive.
const RESERVE_BACKOFF_MIN: Duration = Duration::from_secs(5);
const RESERVE_BACKOFF_MAX: Duration = Duration::from_secs(5 * 60);

/// A lease granted by a relay, permitting inbound circuits to this node.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub limit_data: u64,
    pub limit_duration: Duration,
    pub expiration: Instant,
    pub addrs: Vec<Multiaddr>,
}

/// Relay-host record: connection info plus the live reservation.
#[derive(Debug, Clone)]
pub struct RelayPeerInfo {
    pub info: PeerConnInfo,
    pub reservation: Reservation,
}

#[derive(Debug, Clone)]
pub enum RelayClientEvent {
    /// A reservation was accepted (or renewed) by `relay`.
    Reserved { relay: PeerId },
    /// The relay disconnected and its record was dropped.
    RelayLost { relay: PeerId },
    /// Outcome of one bootnode `Hello` probe.
    HelloResult { peer: PeerId, success: bool },
}

#[derive(Debug)]
enum ClientCommand {
    Hello {
        peer: PeerId,
        status: wire::AliveStatus,
        reply: oneshot::Sender<Result<wire::HelloReply>>,
    },
}

/// Connected RPC client for the alive protocol.
pub struct AliveClient {
    channel: ProtoChannel,
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
}

impl AliveClient {
    pub async fn hello(&self, status: wire::AliveStatus) -> Result<bool> {
        if !self.channel.is_open() {
            return Err(Error::Rpc(format!(
                "alive channel to {} is closed",
                self.channel.peer()
            )));
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ClientCommand::Hello {
                peer: self.channel.peer(),
                status,
                reply,
            })
            .map_err(|_| Error::Shutdown)?;
        let reply = rx.await.map_err(|_| Error::Shutdown)??;
        Ok(reply.success)
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to the running relay client.
#[derive(Clone)]
pub struct RelayClientHandle {
    local_peer_id: PeerId,
    cmd_tx: mpsc::UnboundedSender<ClientCommand>,
    event_tx: broadcast::Sender<RelayClientEvent>,
    shutdown_tx: watch::Sender<bool>,
    peers: Arc<PeerRegistry>,
    peer_store: Arc<PeerStore>,
    relay_peers: Arc<Mutex<HashMap<PeerId, RelayPeerInfo>>>,
    relaynodes: Arc<Roster>,
}

impl RelayClientHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RelayClientEvent> {
        self.event_tx.subscribe()
    }

    pub fn num_relay_peers(&self) -> usize {
        self.relay_peers.lock().unwrap().len()
    }

    pub fn has_relay_peer(&self, id: PeerId) -> bool {
        self.relay_peers.lock().unwrap().contains_key(&id)
    }

    pub fn relay_peer(&self, id: PeerId) -> Option<RelayPeerInfo> {
        self.relay_peers.lock().unwrap().get(&id).cloned()
    }

    /// Connection info of every reserved relay host.
    pub fn relay_peers(&self) -> Vec<PeerConnInfo> {
        self.relay_peers
            .lock()
            .unwrap()
            .values()
            .map(|r| r.info.clone())
            .collect()
    }

    /// The circuit addresses this node can currently be dialed at.
    pub fn advertised_addrs(&self) -> Vec<Multiaddr> {
        self.relay_peers
            .lock()
            .unwrap()
            .values()
            .flat_map(|r| r.reservation.addrs.clone())
            .collect()
    }

    /// Random relaynode that is currently not connected as a peer.
    pub fn get_random_bootnode(&self) -> Option<AddrInfo> {
        self.relaynodes
            .get_random_unconnected(|id| self.peers.contains(id))
            .cloned()
    }

    /// New or reused alive RPC client for `peer`.
    pub fn new_alive_client(&self, peer: PeerId) -> AliveClient {
        if let Some(channel) = self.peers.protocol_channel(peer, ALIVE_PROTO_NAME) {
            return AliveClient {
                channel,
                cmd_tx: self.cmd_tx.clone(),
            };
        }
        let channel = ProtoChannel::new(peer, ALIVE_PROTO_NAME);
        self.peers.add_protocol_channel(peer, channel.clone());
        AliveClient {
            channel,
            cmd_tx: self.cmd_tx.clone(),
        }
    }

    pub fn close_protocol_channel(&self, peer: PeerId, protocol: &str) -> Result<()> {
        self.peers.remove_protocol_channel(peer, protocol)
    }

    /// Whether a cached channel for `(peer, protocol)` currently exists.
    pub fn has_protocol_channel(&self, peer: PeerId, protocol: &str) -> bool {
        self.peers.protocol_channel(peer, protocol).is_some()
    }

    /// One `Hello` round-trip; the alive channel is closed before returning,
    /// success or not.
    pub async fn hello(&self, peer: PeerId) -> Result<bool> {
        let client = self.new_alive_client(peer);
        let result = client.hello(wire::AliveStatus::default()).await;
        self.close_protocol_channel(peer, ALIVE_PROTO_NAME)?;
        result
    }

    /// Stop both background loops. Idempotent.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

// ── RelayClient ───────────────────────────────────────────────────────────────

pub struct RelayClient {
    config: RelayClientConfig,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig) -> Self {
        Self { config }
    }

    /// Build the private host, parse the relaynode roster and spawn the
    /// event loop (reservation keep-alive + bootnode liveness).
    pub fn start(self) -> Result<RelayClientHandle> {
        let key = match &self.config.keypair_path {
            Some(p) => load_or_create_keypair(p)?,
            None => libp2p::identity::Keypair::generate_ed25519(),
        };
        let local_peer_id = key.public().to_peer_id();
        tracing::info!("Relay client starting peer_id={local_peer_id}");

        let relaynodes = Arc::new(Roster::parse(
            &self.config.relaynodes,
            local_peer_id,
            MINIMUM_RELAY_NODES,
        )?);

        let (relay_transport, relay_behaviour) = relay::client::new(local_peer_id);
        let transport = build_client_transport(&key, relay_transport)?;
        let behaviour = RelayClientBehaviour::new(&key, relay_behaviour);
        // A private node keeps no listen addresses of its own; reachability
        // comes exclusively from relay circuits.
        let mut swarm = Swarm::new(transport, behaviour, local_peer_id, default_swarm_config());

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = RelayClientHandle {
            local_peer_id,
            cmd_tx,
            event_tx,
            shutdown_tx,
            peers: Arc::new(PeerRegistry::new()),
            peer_store: Arc::new(PeerStore::new()),
            relay_peers: Arc::new(Mutex::new(HashMap::new())),
            relaynodes,
        };

        // Make every relaynode dialable before the first tick.
        for node in handle.relaynodes.nodes() {
            for addr in &node.addrs {
                handle
                    .peer_store
                    .add_addr(node.peer_id, addr.clone(), AddrTtl::Permanent);
                swarm.add_peer_address(node.peer_id, addr.clone());
            }
        }

        let state = ClientLoop {
            handle: handle.clone(),
            minimum_relay_connections: self.config.minimum_relay_connections.max(1),
            pending_listeners: HashMap::new(),
            pending_hellos: HashMap::new(),
            backoff: HashMap::new(),
        };
        tokio::spawn(state.event_loop(swarm, cmd_rx, shutdown_rx));

        Ok(handle)
    }
}

// ── Event loop ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Backoff {
    until: Instant,
    delay: Duration,
}

struct ClientLoop {
    handle: RelayClientHandle,
    minimum_relay_connections: usize,
    /// Circuit listeners awaiting a reservation, keyed by listener so
    /// listener errors can be attributed to their relay.
    pending_listeners: HashMap<ListenerId, PeerId>,
    pending_hellos: HashMap<OutboundRequestId, oneshot::Sender<Result<wire::HelloReply>>>,
    /// Per-relaynode exponential back-off after failed attempts.
    backoff: HashMap<PeerId, Backoff>,
}

impl ClientLoop {
    async fn event_loop(
        mut self,
        mut swarm: ClientSwarm,
        mut cmd_rx: mpsc::UnboundedReceiver<ClientCommand>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut reserve_tick =
            interval_at(TokioInstant::now() + RESERVATION_TICK, RESERVATION_TICK);
        reserve_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut alive_tick = interval_at(
            TokioInstant::now() + BOOTNODE_ALIVE_INTERVAL,
            BOOTNODE_ALIVE_INTERVAL,
        );
        alive_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = swarm.select_next_some() => {
                    self.on_swarm_event(&mut swarm, event);
                }
                Some(cmd) = cmd_rx.recv() => {
                    self.on_command(&mut swarm, cmd);
                }
                _ = reserve_tick.tick() => {
                    self.on_reserve_tick(&mut swarm);
                }
                _ = alive_tick.tick() => {
                    self.on_alive_tick();
                }
            }
        }

        tracing::info!("Relay client shut down");
    }

    // ── Reservation keep-alive ───────────────────────────────────────────────

    /// Every 5 s: while below the reservation floor, pick a random
    /// unconnected relaynode (skipping those in back-off) and start a
    /// circuit reservation by listening on its `/p2p-circuit` address.
    fn on_reserve_tick(&mut self, swarm: &mut ClientSwarm) {
        if self.handle.num_relay_peers() >= self.minimum_relay_connections {
            return;
        }

        let now = Instant::now();
        let pending: HashSet<PeerId> = self.pending_listeners.values().copied().collect();
        let backoff = &self.backoff;
        let handle = &self.handle;
        let pick = handle.relaynodes.get_random_unconnected(|id| {
            handle.has_relay_peer(id)
                || pending.contains(&id)
                || backoff.get(&id).is_some_and(|b| b.until > now)
        });
        let Some(relay) = pick.cloned() else {
            return;
        };
        let Some(base) = relay.addrs.first() else {
            return;
        };

        tracing::info!("Requesting relay reservation on {}", relay.peer_id);
        let listen = circuit_listen_addr(base, relay.peer_id);
        match swarm.listen_on(listen) {
            Ok(listener_id) => {
                self.pending_listeners.insert(listener_id, relay.peer_id);
            }
            Err(e) => {
                tracing::error!(
                    "failed to request reservation from {}: {e}",
                    relay.peer_id
                );
                self.bump_backoff(relay.peer_id);
            }
        }
    }

    fn bump_backoff(&mut self, relay: PeerId) {
        let entry = self.backoff.entry(relay).or_insert(Backoff {
            until: Instant::now(),
            delay: RESERVE_BACKOFF_MIN,
        });
        entry.until = Instant::now() + entry.delay;
        entry.delay = (entry.delay * 2).min(RESERVE_BACKOFF_MAX);
    }

    fn on_reservation_accepted(&mut self, relay_id: PeerId, renewal: bool) {
        let Some(relay_info) = self.handle.relaynodes.get(relay_id).cloned() else {
            tracing::warn!("reservation accepted by unknown relay {relay_id}");
            return;
        };

        let addrs = relay_info
            .addrs
            .iter()
            .map(|a| circuit_addr(a, relay_id, self.handle.local_peer_id))
            .collect();
        let reservation = Reservation {
            limit_data: 0,
            limit_duration: DEFAULT_RESERVATION_TTL,
            expiration: Instant::now() + DEFAULT_RESERVATION_TTL,
            addrs,
        };
        tracing::info!(
            "reservation: relay={relay_id} renewal={renewal} expiration={:?}",
            reservation.expiration
        );

        {
            let mut relay_peers = self.handle.relay_peers.lock().unwrap();
            match relay_peers.get_mut(&relay_id) {
                Some(existing) => {
                    existing.reservation = reservation;
                    existing.info.add_direction(ConnDirection::Unknown);
                }
                None => {
                    let mut info = PeerConnInfo::new(relay_info);
                    info.add_direction(ConnDirection::Unknown);
                    relay_peers.insert(relay_id, RelayPeerInfo { info, reservation });
                }
            }
        }
        self.backoff.remove(&relay_id);
        self.emit(RelayClientEvent::Reserved { relay: relay_id });
    }

    // ── Bootnode liveness ────────────────────────────────────────────────────

    /// Every 60 s: say hello to random unconnected bootnodes until one
    /// answers or the set is exhausted.
    fn on_alive_tick(&self) {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            keep_alive_to_bootnodes(&handle).await;
        });
    }

    // ── Swarm events ─────────────────────────────────────────────────────────

    fn on_swarm_event(
        &mut self,
        swarm: &mut ClientSwarm,
        event: SwarmEvent<RelayClientBehaviourEvent>,
    ) {
        match event {
            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                let direction = ConnDirection::from(&endpoint);
                tracing::info!("Conn peer={peer_id} direction={direction:?}");
                let mut info = self.handle.peer_store.peer_info(peer_id);
                let remote = endpoint.get_remote_address().clone();
                if !info.addrs.contains(&remote) {
                    info.addrs.push(remote);
                }
                self.handle.peers.add(info, direction);
                if self.handle.relaynodes.contains(peer_id) {
                    self.handle.relaynodes.inc_conn_count();
                }
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established > 0 {
                    return;
                }
                self.handle.peers.remove(peer_id);
                if self.handle.relaynodes.contains(peer_id) {
                    self.handle.relaynodes.dec_conn_count();
                }
                let removed = self.handle.relay_peers.lock().unwrap().remove(&peer_id);
                if removed.is_some() {
                    tracing::warn!("removeRelayPeerInfo {peer_id}");
                    self.emit(RelayClientEvent::RelayLost { relay: peer_id });
                }
            }

            SwarmEvent::Behaviour(RelayClientBehaviourEvent::RelayClient(
                relay::client::Event::ReservationReqAccepted {
                    relay_peer_id,
                    renewal,
                    ..
                },
            )) => {
                self.pending_listeners.retain(|_, p| *p != relay_peer_id);
                self.on_reservation_accepted(relay_peer_id, renewal);
            }
            SwarmEvent::Behaviour(RelayClientBehaviourEvent::RelayClient(e)) => {
                tracing::debug!("relay client event: {e:?}");
            }

            SwarmEvent::Behaviour(RelayClientBehaviourEvent::Alive(ev)) => {
                self.on_alive_rpc(swarm, ev);
            }

            SwarmEvent::Behaviour(RelayClientBehaviourEvent::Identify(_))
            | SwarmEvent::Behaviour(RelayClientBehaviourEvent::Ping(_)) => {}

            SwarmEvent::ListenerError { listener_id, error, .. } => {
                if let Some(relay) = self.pending_listeners.remove(&listener_id) {
                    tracing::error!("failed to receive a relay reservation from {relay}: {error}");
                    self.bump_backoff(relay);
                }
            }

            SwarmEvent::ListenerClosed { listener_id, .. } => {
                if let Some(relay) = self.pending_listeners.remove(&listener_id) {
                    self.bump_backoff(relay);
                }
            }

            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if self.handle.relaynodes.contains(peer_id) {
                    tracing::error!("relaynode {peer_id} unreachable: {error}");
                    self.bump_backoff(peer_id);
                } else {
                    tracing::debug!("connection error to {peer_id}: {error}");
                }
            }

            _ => {}
        }
    }

    fn on_alive_rpc(
        &mut self,
        swarm: &mut ClientSwarm,
        event: request_response::Event<wire::AliveStatus, wire::HelloReply>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                // A private node can still be probed over an inbound circuit.
                request_response::Message::Request { channel, .. } => {
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
                request_response::Message::Response {
                    request_id,
                    response,
                    ..
                } => {
                    if let Some(reply) = self.pending_hellos.remove(&request_id) {
                        let _ = reply.send(Ok(response));
                    }
                }
            },
            request_response::Event::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                if let Some(reply) = self.pending_hellos.remove(&request_id) {
                    let _ = reply.send(Err(Error::Rpc(format!(
                        "Hello to {peer} failed: {error}"
                    ))));
                }
            }
            _ => {}
        }
    }

    fn on_command(&mut self, swarm: &mut ClientSwarm, cmd: ClientCommand) {
        match cmd {
            ClientCommand::Hello {
                peer,
                status,
                reply,
            } => {
                // Request/response dials on demand; make sure the swarm
                // knows the roster addresses for this peer.
                if !swarm.is_connected(&peer) {
                    if let Some(node) = self.handle.relaynodes.get(peer) {
                        let opts = DialOpts::peer_id(peer)
                            .addresses(node.addrs.clone())
                            .build();
                        if let Err(e) = swarm.dial(opts) {
                            tracing::debug!("pre-hello dial {peer}: {e}");
                        }
                    }
                }
                let request_id = swarm.behaviour_mut().alive.send_request(&peer, status);
                self.pending_hellos.insert(request_id, reply);
            }
        }
    }

    fn emit(&self, event: RelayClientEvent) {
        let _ = self.handle.event_tx.send(event);
    }
}

/// Probe random unconnected bootnodes until one answers.
async fn keep_alive_to_bootnodes(handle: &RelayClientHandle) {
    tracing::debug!("keepAliveToBootnodes running");

    let mut tried: HashSet<PeerId> = HashSet::new();
    loop {
        let Some(bootnode) = handle
            .relaynodes
            .get_random_unconnected(|id| handle.peers.contains(id) || tried.contains(&id))
        else {
            return;
        };
        tried.insert(bootnode.peer_id);

        match handle.hello(bootnode.peer_id).await {
            Ok(success) => {
                let _ = handle.event_tx.send(RelayClientEvent::HelloResult {
                    peer: bootnode.peer_id,
                    success,
                });
                return;
            }
            Err(e) => {
                tracing::error!(
                    "unable to execute bootnode alive call to {}: {e}",
                    bootnode.peer_id
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_fails_without_relaynodes() {
        let client = RelayClient::new(RelayClientConfig::new(vec![]));
        assert!(matches!(client.start(), Err(Error::NoRelaynodes)));
    }

    #[tokio::test]
    async fn start_fails_when_roster_reduces_to_self() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("key");
        let key = load_or_create_keypair(&path).unwrap();
        let self_id = key.public().to_peer_id();

        let mut config =
            RelayClientConfig::new(vec![format!("/ip4/127.0.0.1/tcp/1/p2p/{self_id}")]);
        config.keypair_path = Some(path);

        assert!(matches!(
            RelayClient::new(config).start(),
            Err(Error::MinimumNodes { .. })
        ));
    }
}
