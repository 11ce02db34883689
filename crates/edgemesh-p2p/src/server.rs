//! Overlay server: the public node's control plane.
//!
//! Owns the peer connection registry, the peer store, the routing table,
//! the dial queue and the peer-update gossip. [`Server::start`] spawns the
//! event loop and returns a [`ServerHandle`] through which every other
//! subsystem talks to the node.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex},
};

use futures::StreamExt;
use libp2p::{
    gossipsub, identify,
    request_response::{self, OutboundRequestId},
    swarm::{dial_opts::DialOpts, SwarmEvent},
    Multiaddr, PeerId, Swarm,
};
use prost::Message;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{
    addr::AddrInfo,
    behaviour::{ServerBehaviour, ServerBehaviourEvent},
    config::{ServerConfig, DISCOVERY_TICK, MAX_DISCOVERY_PEER_REQ_COUNT},
    dial::{DialPriority, DialQueue, DialTask},
    error::{Error, Result},
    gossip::UpdateTracker,
    identity::load_or_create_keypair,
    peers::{AddrTtl, ConnDirection, PeerRegistry, PeerStore, ProtoChannel},
    protocol::{
        wire, DISCOVERY_PROTO_NAME, ROUTE_TABLE_TOPIC,
    },
    roster::Roster,
    routing::{RoutingEvent, RoutingTable},
    syncapp::SyncAppHandler,
    transport::{build_transport, default_swarm_config},
};

type ServerSwarm = Swarm<ServerBehaviour>;

/// Events emitted to the host application.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    Listening(Multiaddr),
    PeerConnected {
        peer_id: PeerId,
        direction: ConnDirection,
    },
    PeerDisconnected(PeerId),
}

#[derive(Debug)]
pub(crate) enum ServerCommand {
    /// Publish a peer-update record on the gossip topic.
    Publish(wire::PeerInfo),
    /// Insert a peer into the peer store + routing table (dial follows via
    /// the routing `PeerAdded` event).
    AddToTable(AddrInfo),
    /// Issue a FindPeers RPC and reply on the channel.
    FindPeers {
        peer: PeerId,
        count: i64,
        reply: oneshot::Sender<Result<wire::FindPeersResp>>,
    },
    /// Close all connections to a peer (end of a temporary dial).
    Disconnect(PeerId),
    Shutdown,
}

/// One-shot flags for peers dialed for a single RPC and never promoted to
/// the persistent peer set.
#[derive(Debug, Default)]
pub struct TemporaryDials {
    set: Mutex<HashSet<PeerId>>,
}

impl TemporaryDials {
    /// Test-and-set: returns whether the flag was already present, setting
    /// it when `new_value` is true.
    pub fn fetch_or_set(&self, id: PeerId, new_value: bool) -> bool {
        let mut set = self.set.lock().unwrap();
        let loaded = set.contains(&id);
        if !loaded && new_value {
            set.insert(id);
        }
        loaded
    }

    pub fn contains(&self, id: PeerId) -> bool {
        self.set.lock().unwrap().contains(&id)
    }

    pub fn remove(&self, id: PeerId) {
        self.set.lock().unwrap().remove(&id);
    }
}

/// Clears a temporary-dial flag when dropped, so RPC completion always
/// reaches the remove path, error or not.
pub struct TempDialGuard {
    handle: ServerHandle,
    peer: PeerId,
}

impl Drop for TempDialGuard {
    fn drop(&mut self) {
        self.handle.remove_temporary_dial(self.peer);
    }
}

/// Connected RPC client for the discovery protocol.
pub struct DiscoveryClient {
    channel: ProtoChannel,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
}

impl DiscoveryClient {
    /// Ask the remote peer for up to `count` peers (clamped remotely).
    pub async fn find_peers(&self, count: i64) -> Result<Vec<AddrInfo>> {
        if !self.channel.is_open() {
            return Err(Error::Rpc(format!(
                "discovery channel to {} is closed",
                self.channel.peer()
            )));
        }
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ServerCommand::FindPeers {
                peer: self.channel.peer(),
                count,
                reply,
            })
            .map_err(|_| Error::Shutdown)?;
        let resp = rx.await.map_err(|_| Error::Shutdown)??;

        let mut found = Vec::with_capacity(resp.nodes.len());
        for raw in &resp.nodes {
            match AddrInfo::from_multiaddr_str(raw) {
                Ok(info) => found.push(info),
                Err(e) => tracing::debug!("discarding unparseable discovered addr {raw}: {e}"),
            }
        }
        Ok(found)
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cheap-to-clone handle to the running overlay server.
#[derive(Clone)]
pub struct ServerHandle {
    local_peer_id: PeerId,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    event_tx: broadcast::Sender<ServerEvent>,
    registry: Arc<PeerRegistry>,
    peer_store: Arc<PeerStore>,
    tracker: Arc<UpdateTracker>,
    bootnodes: Arc<Roster>,
    dial_queue: Arc<DialQueue>,
    temporary_dials: Arc<TemporaryDials>,
    listen_addrs: Arc<Mutex<Vec<Multiaddr>>>,
}

impl ServerHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Addresses the node is currently listening on.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen_addrs.lock().unwrap().clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ServerEvent> {
        self.event_tx.subscribe()
    }

    /// Record an address for `id` with permanent retention and feed the
    /// peer-update gossip.
    pub fn add_addr(&self, id: PeerId, addr: Multiaddr) {
        self.peer_store
            .add_addr(id, addr.clone(), AddrTtl::Permanent);
        let info = AddrInfo::new(id, vec![addr]);
        if let Some(msg) =
            self.tracker
                .add_peer_update_info(self.local_peer_id, id, info, false)
        {
            let _ = self.cmd_tx.send(ServerCommand::Publish(msg));
        }
    }

    /// The peer's currently known addresses.
    pub fn peer_info(&self, id: PeerId) -> AddrInfo {
        self.peer_store.peer_info(id)
    }

    pub fn is_connected(&self, id: PeerId) -> bool {
        self.registry.contains(id)
    }

    pub fn peers(&self) -> Vec<PeerId> {
        self.registry.peer_ids()
    }

    pub fn num_peers(&self) -> usize {
        self.registry.len()
    }

    /// Number of bootnodes currently connected.
    pub fn bootnode_conn_count(&self) -> i64 {
        self.bootnodes.conn_count()
    }

    /// Random bootnode that is currently *not* in the peer map.
    pub fn get_random_bootnode(&self) -> Option<AddrInfo> {
        self.bootnodes
            .get_random_unconnected(|id| self.registry.contains(id))
            .cloned()
    }

    /// Random connected peer.
    pub fn get_random_peer(&self) -> Option<PeerId> {
        self.registry.random_peer()
    }

    pub fn fetch_or_set_temporary_dial(&self, id: PeerId, new_value: bool) -> bool {
        self.temporary_dials.fetch_or_set(id, new_value)
    }

    pub fn remove_temporary_dial(&self, id: PeerId) {
        self.temporary_dials.remove(id);
    }

    /// Flag `peer` as a temporary dial, returning a guard that clears the
    /// flag on drop. `None` when the peer is already flagged.
    pub fn temporary_dial_guard(&self, peer: PeerId) -> Option<TempDialGuard> {
        if self.fetch_or_set_temporary_dial(peer, true) {
            return None;
        }
        Some(TempDialGuard {
            handle: self.clone(),
            peer,
        })
    }

    /// New or reused discovery RPC client for `peer`.
    ///
    /// Fails unless the peer is connected or flagged as a temporary dial.
    /// A channel created for a non-temporary peer is saved in the registry
    /// so later calls reuse it.
    pub fn new_discovery_client(&self, peer: PeerId) -> Result<DiscoveryClient> {
        let is_temporary = self.temporary_dials.contains(peer);
        if !self.registry.contains(peer) && !is_temporary {
            return Err(Error::NotConnected(peer));
        }

        if let Some(channel) = self.registry.protocol_channel(peer, DISCOVERY_PROTO_NAME) {
            return Ok(DiscoveryClient {
                channel,
                cmd_tx: self.cmd_tx.clone(),
            });
        }

        let channel = ProtoChannel::new(peer, DISCOVERY_PROTO_NAME);
        if !is_temporary {
            self.save_protocol_channel(peer, channel.clone());
        }
        Ok(DiscoveryClient {
            channel,
            cmd_tx: self.cmd_tx.clone(),
        })
    }

    pub fn save_protocol_channel(&self, peer: PeerId, channel: ProtoChannel) {
        self.registry.add_protocol_channel(peer, channel);
    }

    pub fn close_protocol_channel(&self, peer: PeerId, protocol: &str) -> Result<()> {
        self.registry.remove_protocol_channel(peer, protocol)
    }

    /// Queue a dial with the given priority.
    pub fn dial(&self, info: AddrInfo, priority: DialPriority) {
        self.dial_queue.add_task(info, priority);
    }

    /// Insert a peer into the peer store and routing table; a dial follows
    /// from the routing `PeerAdded` event.
    pub fn add_to_table(&self, info: AddrInfo) {
        let _ = self.cmd_tx.send(ServerCommand::AddToTable(info));
    }

    /// Close all connections to `id`.
    pub fn disconnect(&self, id: PeerId) {
        let _ = self.cmd_tx.send(ServerCommand::Disconnect(id));
    }

    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(ServerCommand::Shutdown);
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn SyncAppHandler>,
    cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
    event_tx: broadcast::Sender<ServerEvent>,
}

impl Server {
    pub fn new(config: ServerConfig, handler: Arc<dyn SyncAppHandler>) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config,
            handler,
            cmd_tx,
            cmd_rx,
            event_tx,
        }
    }

    /// Build the swarm, seed the bootnodes, spawn the event loop and return
    /// the handle.
    pub fn start(self) -> Result<ServerHandle> {
        let key = match &self.config.keypair_path {
            Some(p) => load_or_create_keypair(p)?,
            None => libp2p::identity::Keypair::generate_ed25519(),
        };
        let local_peer_id = key.public().to_peer_id();
        tracing::info!("Overlay server starting peer_id={local_peer_id}");

        let transport = build_transport(&key)?;
        let behaviour = ServerBehaviour::new(&key)?;
        let mut swarm = Swarm::new(transport, behaviour, local_peer_id, default_swarm_config());

        swarm
            .listen_on(self.config.listen_addr.clone())
            .map_err(|e| Error::Transport(e.to_string()))?;

        let topic = gossipsub::IdentTopic::new(ROUTE_TABLE_TOPIC);
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&topic)
            .map_err(|e| Error::Config(format!("gossip subscribe: {e}")))?;

        let bootnodes = if self.config.bootnodes.is_empty() {
            Arc::new(Roster::empty())
        } else {
            Arc::new(Roster::parse(&self.config.bootnodes, local_peer_id, 1)?)
        };

        let (routing, routing_rx) = RoutingTable::with_default_bucket_size(local_peer_id);

        let handle = ServerHandle {
            local_peer_id,
            cmd_tx: self.cmd_tx.clone(),
            event_tx: self.event_tx.clone(),
            registry: Arc::new(PeerRegistry::new()),
            peer_store: Arc::new(PeerStore::new()),
            tracker: Arc::new(UpdateTracker::new(local_peer_id)),
            bootnodes,
            dial_queue: Arc::new(DialQueue::new()),
            temporary_dials: Arc::new(TemporaryDials::default()),
            listen_addrs: Arc::new(Mutex::new(Vec::new())),
        };

        let state = ServerLoop {
            handle: handle.clone(),
            handler: self.handler,
            routing,
            pending_find_peers: HashMap::new(),
            counted_bootnodes: HashSet::new(),
            topic,
        };

        // Connect to the configured bootnodes at explicit priority and seed
        // the routing table with them; the queue collapses the duplicate
        // task raised by the PeerAdded event.
        for node in handle.bootnodes.nodes() {
            handle.dial(node.clone(), DialPriority::RequestedDial);
            handle.add_to_table(node.clone());
        }

        tokio::spawn(state.event_loop(swarm, self.cmd_rx, routing_rx));
        Ok(handle)
    }
}

// ── Event loop ────────────────────────────────────────────────────────────────

struct ServerLoop {
    handle: ServerHandle,
    handler: Arc<dyn SyncAppHandler>,
    routing: RoutingTable,
    pending_find_peers:
        HashMap<OutboundRequestId, oneshot::Sender<Result<wire::FindPeersResp>>>,
    /// Bootnodes currently counted in the roster's connection counter.
    /// Keeps inc/dec symmetric even when a temporary-dial flag races a
    /// disconnect notification.
    counted_bootnodes: HashSet<PeerId>,
    topic: gossipsub::IdentTopic,
}

impl ServerLoop {
    async fn event_loop(
        mut self,
        mut swarm: ServerSwarm,
        mut cmd_rx: mpsc::UnboundedReceiver<ServerCommand>,
        mut routing_rx: mpsc::UnboundedReceiver<RoutingEvent>,
    ) {
        let dial_queue = Arc::clone(&self.handle.dial_queue);
        let mut disc_tick = interval_at(Instant::now() + DISCOVERY_TICK, DISCOVERY_TICK);
        disc_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = swarm.select_next_some() => {
                    self.on_swarm_event(&mut swarm, event);
                }
                Some(cmd) = cmd_rx.recv() => {
                    if self.on_command(&mut swarm, cmd) {
                        break;
                    }
                }
                Some(ev) = routing_rx.recv() => {
                    self.on_routing_event(ev);
                }
                task = dial_queue.wait_pop() => {
                    self.on_dial_task(&mut swarm, task);
                }
                _ = disc_tick.tick() => {
                    self.on_discovery_tick();
                }
            }
        }

        tracing::info!("Overlay server shut down");
    }

    // ── Swarm events ─────────────────────────────────────────────────────────

    fn on_swarm_event(&mut self, swarm: &mut ServerSwarm, event: SwarmEvent<ServerBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                tracing::info!("Listening on {address}");
                self.handle.listen_addrs.lock().unwrap().push(address.clone());
                self.emit(ServerEvent::Listening(address));
            }

            SwarmEvent::ConnectionEstablished {
                peer_id, endpoint, ..
            } => {
                // A temporary dial carries a single RPC and is never
                // promoted into the persistent peer set.
                if self.handle.temporary_dials.contains(peer_id) {
                    tracing::debug!("temporary dial to {peer_id} established");
                    return;
                }

                let direction = ConnDirection::from(&endpoint);
                tracing::info!("Conn peer={peer_id} direction={direction:?}");

                let mut info = self.handle.peer_store.peer_info(peer_id);
                let remote = endpoint.get_remote_address().clone();
                if !info.addrs.contains(&remote) {
                    info.addrs.push(remote);
                }
                self.handle.registry.add(info, direction);

                if self.handle.bootnodes.contains(peer_id)
                    && self.counted_bootnodes.insert(peer_id)
                {
                    self.handle.bootnodes.inc_conn_count();
                }
                self.emit(ServerEvent::PeerConnected { peer_id, direction });
            }

            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established > 0 {
                    return;
                }
                let had_record = self.handle.registry.remove(peer_id).is_some();
                if self.counted_bootnodes.remove(&peer_id) {
                    self.handle.bootnodes.dec_conn_count();
                }
                if had_record {
                    self.emit(ServerEvent::PeerDisconnected(peer_id));
                }
            }

            SwarmEvent::Behaviour(ev) => self.on_behaviour_event(swarm, ev),

            SwarmEvent::OutgoingConnectionError { peer_id, error, .. } => {
                tracing::debug!("Connection error to {peer_id:?}: {error}");
            }

            _ => {}
        }
    }

    fn on_behaviour_event(&mut self, swarm: &mut ServerSwarm, event: ServerBehaviourEvent) {
        match event {
            ServerBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                message, ..
            }) => {
                self.on_gossip_message(swarm, &message.data);
            }
            ServerBehaviourEvent::Gossipsub(_) => {}

            ServerBehaviourEvent::Identify(identify::Event::Received {
                peer_id, info, ..
            }) => {
                for addr in info.listen_addrs {
                    self.handle
                        .peer_store
                        .add_addr(peer_id, addr.clone(), AddrTtl::Temporary);
                    swarm.add_peer_address(peer_id, addr);
                }
            }
            ServerBehaviourEvent::Identify(_) => {}

            ServerBehaviourEvent::Discovery(ev) => self.on_discovery_rpc(swarm, ev),
            ServerBehaviourEvent::Alive(ev) => self.on_alive_rpc(swarm, ev),
            ServerBehaviourEvent::Syncapp(ev) => self.on_syncapp_rpc(swarm, ev),

            ServerBehaviourEvent::Ping(_) => {}
        }
    }

    /// Incoming `route_table/0.2` message: store, never re-publish.
    fn on_gossip_message(&mut self, swarm: &mut ServerSwarm, data: &[u8]) {
        let msg = match wire::PeerInfo::decode(data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!("failed to decode gossiped PeerInfo: {e}");
                return;
            }
        };
        let accepted = self
            .handle
            .tracker
            .handle_peer_store_update(&msg, &self.handle.peer_store);
        for info in accepted {
            for addr in &info.addrs {
                swarm.add_peer_address(info.peer_id, addr.clone());
            }
        }
    }

    // ── RPC protocols ────────────────────────────────────────────────────────

    fn on_discovery_rpc(
        &mut self,
        swarm: &mut ServerSwarm,
        event: request_response::Event<wire::FindPeersReq, wire::FindPeersResp>,
    ) {
        match event {
            request_response::Event::Message { peer, message, .. } => match message {
                request_response::Message::Request {
                    request, channel, ..
                } => {
                    let resp = self.build_find_peers_resp(peer, request.count);
                    if swarm
                        .behaviour_mut()
                        .discovery
                        .send_response(channel, resp)
                        .is_err()
                    {
                        tracing::debug!("FindPeers response to {peer} dropped (channel expired)");
                    }
                }
                request_response::Message::Response {
                    request_id,
                    response,
                    ..
                } => {
                    if let Some(reply) = self.pending_find_peers.remove(&request_id) {
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
                if let Some(reply) = self.pending_find_peers.remove(&request_id) {
                    let _ = reply.send(Err(Error::Rpc(format!(
                        "FindPeers to {peer} failed: {error}"
                    ))));
                }
            }
            _ => {}
        }
    }

    fn on_alive_rpc(
        &mut self,
        swarm: &mut ServerSwarm,
        event: request_response::Event<wire::AliveStatus, wire::HelloReply>,
    ) {
        if let request_response::Event::Message {
            peer,
            message:
                request_response::Message::Request { channel, .. },
            ..
        } = event
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

    fn on_syncapp_rpc(
        &mut self,
        swarm: &mut ServerSwarm,
        event: request_response::Event<wire::SyncAppRequest, wire::SyncAppResponse>,
    ) {
        if let request_response::Event::Message {
            peer,
            message:
                request_response::Message::Request {
                    request, channel, ..
                },
            ..
        } = event
        {
            use wire::sync_app_request::Call;

            let mut resp = wire::SyncAppResponse::default();
            match request.call {
                Some(Call::PostAppStatus(req)) => {
                    resp.results = self.handler.post_app_status(req);
                }
                Some(Call::GetData(req)) => {
                    resp.data = self.handler.get_data(req);
                }
                Some(Call::GetStatus(_)) => {
                    resp.status = Some(self.handler.get_status());
                }
                None => {}
            }
            if swarm
                .behaviour_mut()
                .syncapp
                .send_response(channel, resp)
                .is_err()
            {
                tracing::debug!("SyncApp response to {peer} dropped (channel expired)");
            }
        }
    }

    /// Up to `count` (clamped) connected peers, requester excluded.
    fn build_find_peers_resp(&self, requester: PeerId, count: i64) -> wire::FindPeersResp {
        let count = count.clamp(0, MAX_DISCOVERY_PEER_REQ_COUNT as i64) as usize;
        let nodes = self
            .handle
            .registry
            .peer_ids()
            .into_iter()
            .filter(|id| *id != requester && *id != self.handle.local_peer_id)
            .map(|id| self.handle.peer_store.peer_info(id))
            .filter(|info| !info.addrs.is_empty())
            .take(count)
            .map(|info| info.to_multiaddr_string())
            .collect();
        wire::FindPeersResp { nodes }
    }

    // ── Commands / routing / dial ────────────────────────────────────────────

    /// Returns `true` when the loop should exit.
    fn on_command(&mut self, swarm: &mut ServerSwarm, cmd: ServerCommand) -> bool {
        match cmd {
            ServerCommand::Publish(msg) => {
                let data = msg.encode_to_vec();
                if let Err(e) = swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.topic.clone(), data)
                {
                    tracing::debug!("gossip publish failed: {e}");
                }
                false
            }
            ServerCommand::AddToTable(info) => {
                self.add_to_table(swarm, info);
                false
            }
            ServerCommand::FindPeers { peer, count, reply } => {
                let request_id = swarm
                    .behaviour_mut()
                    .discovery
                    .send_request(&peer, wire::FindPeersReq { count });
                self.pending_find_peers.insert(request_id, reply);
                false
            }
            ServerCommand::Disconnect(peer) => {
                let _ = swarm.disconnect_peer_id(peer);
                false
            }
            ServerCommand::Shutdown => true,
        }
    }

    /// Peer store first, then the routing table; a table rejection reverts
    /// the store insert so no half-added peer lingers.
    fn add_to_table(&mut self, swarm: &mut ServerSwarm, info: AddrInfo) {
        for addr in &info.addrs {
            self.handle
                .peer_store
                .add_addr(info.peer_id, addr.clone(), AddrTtl::Permanent);
            swarm.add_peer_address(info.peer_id, addr.clone());
        }
        if let Err(e) = self.routing.try_add(info.peer_id) {
            tracing::error!("Failed to add peer {} to routing table: {e}", info.peer_id);
            self.handle.peer_store.remove_peer(info.peer_id);
        }
    }

    fn on_routing_event(&mut self, event: RoutingEvent) {
        match event {
            RoutingEvent::PeerAdded(peer) => {
                let info = self.handle.peer_store.peer_info(peer);
                self.handle
                    .dial_queue
                    .add_task(info, DialPriority::RandomDial);
            }
            RoutingEvent::PeerRemoved(peer) => {
                self.handle.dial_queue.delete_task(peer);
            }
        }
    }

    fn on_dial_task(&mut self, swarm: &mut ServerSwarm, task: DialTask) {
        let id = task.info.peer_id;
        if id == self.handle.local_peer_id || swarm.is_connected(&id) {
            return;
        }
        tracing::debug!("Dialing {id} priority={:?}", task.priority);
        let opts = DialOpts::peer_id(id)
            .addresses(task.info.addrs.clone())
            .build();
        if let Err(e) = swarm.dial(opts) {
            tracing::debug!("dial {id} failed: {e}");
        }
    }

    // ── Discovery loop ───────────────────────────────────────────────────────

    fn on_discovery_tick(&mut self) {
        // With no bootnode connection left, query a random unconnected
        // bootnode over a one-shot temporary dial.
        if self.handle.bootnode_conn_count() == 0 {
            if let Some(bootnode) = self.handle.get_random_bootnode() {
                let handle = self.handle.clone();
                tokio::spawn(async move {
                    let id = bootnode.peer_id;
                    if let Err(e) = bootnode_discovery_round(&handle, bootnode).await {
                        tracing::debug!("bootnode discovery via {id} failed: {e}");
                    }
                });
            }
        }

        // Ask a random connected peer for more peers.
        if let Some(peer) = self.handle.get_random_peer() {
            let handle = self.handle.clone();
            tokio::spawn(async move {
                if let Err(e) = discovery_round(&handle, peer).await {
                    tracing::debug!("discovery round via {peer} failed: {e}");
                }
            });
        }
    }

    fn emit(&self, event: ServerEvent) {
        let _ = self.handle.event_tx.send(event);
    }
}

/// One discovery round: query `peer` for up to the protocol maximum and
/// feed everything new into the table.
async fn discovery_round(handle: &ServerHandle, peer: PeerId) -> Result<()> {
    let client = handle.new_discovery_client(peer)?;
    let found = client
        .find_peers(MAX_DISCOVERY_PEER_REQ_COUNT as i64)
        .await?;
    for info in found {
        if info.peer_id == handle.local_peer_id() {
            continue;
        }
        handle.add_to_table(info);
    }
    Ok(())
}

/// Discovery round against an *unconnected* bootnode.
///
/// The temporary-dial flag gates `new_discovery_client`, the guard clears
/// it on every exit path, and the connection is closed once the RPC is
/// done, so the bootnode never enters the persistent peer set.
async fn bootnode_discovery_round(handle: &ServerHandle, bootnode: AddrInfo) -> Result<()> {
    let Some(_guard) = handle.temporary_dial_guard(bootnode.peer_id) else {
        // A round against this bootnode is still in flight.
        return Ok(());
    };

    let client = handle.new_discovery_client(bootnode.peer_id)?;
    let result = client.find_peers(MAX_DISCOVERY_PEER_REQ_COUNT as i64).await;
    handle.disconnect(bootnode.peer_id);

    for info in result? {
        if info.peer_id == handle.local_peer_id() {
            continue;
        }
        handle.add_to_table(info);
    }
    Ok(())
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
    fn temporary_dial_is_test_and_set() {
        let dials = TemporaryDials::default();
        let id = some_peer();

        assert!(!dials.fetch_or_set(id, true));
        assert!(dials.fetch_or_set(id, true));
        dials.remove(id);
        assert!(!dials.fetch_or_set(id, true));
    }

    #[tokio::test]
    async fn discovery_client_requires_connection_or_temporary_flag() {
        let handle = Server::new(
            ServerConfig::new("/ip4/127.0.0.1/tcp/0".parse().unwrap(), vec![]),
            Arc::new(crate::syncapp::NodeStatus::new("t", "t")),
        )
        .start()
        .unwrap();

        let stranger = some_peer();
        assert!(matches!(
            handle.new_discovery_client(stranger),
            Err(Error::NotConnected(_))
        ));

        // A temporary flag lifts the restriction.
        let guard = handle.temporary_dial_guard(stranger).unwrap();
        assert!(handle.new_discovery_client(stranger).is_ok());
        drop(guard);
        assert!(matches!(
            handle.new_discovery_client(stranger),
            Err(Error::NotConnected(_))
        ));

        handle.shutdown();
    }
}
