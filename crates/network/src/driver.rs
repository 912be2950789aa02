//! Swarm driver task
//!
//! Owns the swarm. Commands from [`HostHandle`](crate::HostHandle) and swarm
//! events are multiplexed in one `select!` loop, so no swarm state is shared
//! across tasks.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use futures::StreamExt;
use libp2p::core::ConnectedPoint;
use libp2p::kad::{self, GetProvidersOk, QueryId, QueryResult, RecordKey};
use libp2p::swarm::dial_opts::{DialOpts, PeerCondition};
use libp2p::swarm::{ConnectionId, DialError, SwarmEvent};
use libp2p::{autonat, dcutr, identify, mdns, relay, upnp, Multiaddr, PeerId, Swarm};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::autorelay::{AutoRelay, Reachability};
use crate::behaviour::{EdgeMeshBehaviour, EdgeMeshBehaviourEvent};
use crate::conn_manager::ConnManager;
use crate::host::{HostCommand, NetworkEvent};
use crate::node::{NetworkConfig, NetworkError};
use crate::relay_map::{append_multiaddr, circuit_addr, is_circuit_addr, PeerAddrInfo};

/// Connection trimming and relay reservation retry period
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(10);

type PeersReply = oneshot::Sender<Result<Vec<PeerAddrInfo>, NetworkError>>;

enum PendingQuery {
    ClosestPeers(PeersReply),
    Providers { found: Vec<PeerId>, reply: PeersReply },
}

struct ConnectionInfo {
    peer_id: PeerId,
    local: Multiaddr,
    remote: Multiaddr,
}

pub(crate) struct SwarmDriver {
    swarm: Swarm<EdgeMeshBehaviour>,
    commands: mpsc::Receiver<HostCommand>,
    candidates: mpsc::Receiver<PeerAddrInfo>,
    events: mpsc::Sender<NetworkEvent>,
    address_book: HashMap<PeerId, Vec<Multiaddr>>,
    listen_addrs: Vec<Multiaddr>,
    dial_waiters: HashMap<PeerId, Vec<oneshot::Sender<Result<(), NetworkError>>>>,
    queries: HashMap<QueryId, PendingQuery>,
    connections: HashMap<ConnectionId, ConnectionInfo>,
    conn_manager: ConnManager,
    autorelay: AutoRelay,
    force_private: bool,
    external_addrs: Vec<Multiaddr>,
}

impl SwarmDriver {
    pub(crate) fn new(
        swarm: Swarm<EdgeMeshBehaviour>,
        config: &NetworkConfig,
        commands: mpsc::Receiver<HostCommand>,
        candidates: mpsc::Receiver<PeerAddrInfo>,
        events: mpsc::Sender<NetworkEvent>,
    ) -> Self {
        let mut driver = Self {
            swarm,
            commands,
            candidates,
            events,
            address_book: HashMap::new(),
            listen_addrs: Vec::new(),
            dial_waiters: HashMap::new(),
            queries: HashMap::new(),
            connections: HashMap::new(),
            conn_manager: ConnManager::new(config.conn_manager),
            autorelay: AutoRelay::new(config.max_candidates, config.force_private),
            force_private: config.force_private,
            external_addrs: if config.relay_service {
                config.external_addrs.clone()
            } else {
                Vec::new()
            },
        };
        driver.set_relays(config.relays.clone());
        driver
    }

    pub(crate) async fn run(mut self) {
        let mut maintenance = tokio::time::interval(MAINTENANCE_INTERVAL);
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(HostCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                Some(candidate) = self.candidates.recv() => {
                    self.add_relay_candidate(candidate);
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                _ = maintenance.tick() => {
                    self.maintain();
                }
            }
        }
        info!("Swarm driver for {} stopped", self.swarm.local_peer_id());
    }

    fn handle_command(&mut self, command: HostCommand) {
        match command {
            HostCommand::Connect { peer_id, addrs, reply } => self.connect(peer_id, addrs, reply),
            HostCommand::IsConnected { peer_id, reply } => {
                let _ = reply.send(self.swarm.is_connected(&peer_id));
            }
            HostCommand::AddAddresses { peer_id, addrs } => self.remember(peer_id, addrs),
            HostCommand::Addresses { peer_id, reply } => {
                let _ = reply.send(self.address_book.get(&peer_id).cloned().unwrap_or_default());
            }
            HostCommand::ClosestPeers { key, reply } => {
                let query_id = self.swarm.behaviour_mut().kademlia.get_closest_peers(key);
                self.queries.insert(query_id, PendingQuery::ClosestPeers(reply));
            }
            HostCommand::Advertise { namespace, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .start_providing(RecordKey::new(&namespace))
                    .map(|_| ())
                    .map_err(|e| NetworkError::Dht(e.to_string()));
                let _ = reply.send(result);
            }
            HostCommand::FindProviders { namespace, reply } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(RecordKey::new(&namespace));
                self.queries.insert(
                    query_id,
                    PendingQuery::Providers {
                        found: Vec::new(),
                        reply,
                    },
                );
            }
            HostCommand::ConnectionAddrs { peer_id, reply } => {
                let addrs = self
                    .connections
                    .values()
                    .find(|c| c.peer_id == peer_id)
                    .map(|c| (c.local.clone(), c.remote.clone()));
                let _ = reply.send(addrs);
            }
            HostCommand::ListenAddrs { reply } => {
                let _ = reply.send(self.listen_addrs.clone());
            }
            HostCommand::SetRelays { relays } => self.set_relays(relays),
            HostCommand::SetRelayService {
                enabled,
                external_addrs,
            } => self.set_relay_service(enabled, external_addrs),
            HostCommand::Shutdown => {}
        }
    }

    fn connect(
        &mut self,
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    ) {
        if self.swarm.is_connected(&peer_id) {
            let _ = reply.send(Ok(()));
            return;
        }
        self.remember(peer_id, addrs);
        let known = self.address_book.get(&peer_id).cloned().unwrap_or_default();
        let opts = DialOpts::peer_id(peer_id)
            .addresses(known)
            .condition(PeerCondition::DisconnectedAndNotDialing)
            .extend_addresses_through_behaviour()
            .build();

        match self.swarm.dial(opts) {
            Ok(()) | Err(DialError::DialPeerConditionFalse(_)) => {
                self.dial_waiters.entry(peer_id).or_default().push(reply);
            }
            Err(e) => {
                debug!("Dial to {} rejected: {}", peer_id, e);
                let _ = reply.send(Err(NetworkError::Dial {
                    peer_id,
                    reason: e.to_string(),
                }));
            }
        }
    }

    fn remember(&mut self, peer_id: PeerId, addrs: Vec<Multiaddr>) {
        if peer_id == *self.swarm.local_peer_id() || addrs.is_empty() {
            return;
        }
        let known = self.address_book.entry(peer_id).or_default();
        for addr in addrs {
            append_multiaddr(known, addr);
        }
    }

    fn peer_info(&self, peer_id: PeerId) -> PeerAddrInfo {
        PeerAddrInfo::new(
            peer_id,
            self.address_book.get(&peer_id).cloned().unwrap_or_default(),
        )
    }

    fn set_relays(&mut self, relays: Vec<PeerAddrInfo>) {
        self.conn_manager
            .set_protected(relays.iter().map(|relay| relay.peer_id));
        for relay in relays {
            if relay.peer_id == *self.swarm.local_peer_id() {
                continue;
            }
            let behaviour = self.swarm.behaviour_mut();
            for addr in &relay.addrs {
                behaviour.kademlia.add_address(&relay.peer_id, addr.clone());
            }
            if let Some(autonat) = behaviour.autonat.as_mut() {
                autonat.add_server(relay.peer_id, relay.addrs.first().cloned());
            }
            self.remember(relay.peer_id, relay.addrs);
        }
        if let Err(e) = self.swarm.behaviour_mut().kademlia.bootstrap() {
            debug!("DHT bootstrap skipped: {}", e);
        }
    }

    fn set_relay_service(&mut self, enabled: bool, external_addrs: Vec<Multiaddr>) {
        let local_peer_id = *self.swarm.local_peer_id();
        for addr in std::mem::take(&mut self.external_addrs) {
            self.swarm.remove_external_address(&addr);
        }
        self.swarm
            .behaviour_mut()
            .set_relay_service(local_peer_id, enabled);
        if enabled {
            for addr in &external_addrs {
                self.swarm.add_external_address(addr.clone());
            }
            self.external_addrs = external_addrs;
        }
        info!("Relay service {}", if enabled { "enabled" } else { "disabled" });
    }

    fn add_relay_candidate(&mut self, candidate: PeerAddrInfo) {
        if candidate.peer_id == *self.swarm.local_peer_id() {
            return;
        }
        trace!("Relay candidate {}", candidate);
        self.remember(candidate.peer_id, candidate.addrs.clone());
        self.autorelay.add_candidate(candidate);
        self.reserve_relays();
    }

    fn reserve_relays(&mut self) {
        let now = Instant::now();
        for (relay, addr) in self.autorelay.next_reservations(now) {
            let circuit = circuit_addr(&addr, relay);
            match self.swarm.listen_on(circuit.clone()) {
                Ok(listener_id) => {
                    debug!("Requesting relay reservation via {}", circuit);
                    self.autorelay.on_reserving(relay, listener_id);
                }
                Err(e) => {
                    warn!("Failed to listen via relay {}: {}", circuit, e);
                    self.autorelay.on_reservation_failed(relay, now);
                }
            }
        }
    }

    fn maintain(&mut self) {
        for connection_id in self.conn_manager.connections_to_trim(Instant::now()) {
            debug!("Trimming connection {:?}", connection_id);
            self.swarm.close_connection(connection_id);
        }
        self.reserve_relays();
    }

    fn emit(&self, event: NetworkEvent) {
        if let Err(TrySendError::Full(event)) = self.events.try_send(event) {
            warn!("Network event queue full, dropping {:?}", event);
        }
    }

    fn resolve_dial(&mut self, peer_id: &PeerId, result: Result<(), String>) {
        let Some(waiters) = self.dial_waiters.remove(peer_id) else {
            return;
        };
        for waiter in waiters {
            let reply = result.clone().map_err(|reason| NetworkError::Dial {
                peer_id: *peer_id,
                reason,
            });
            let _ = waiter.send(reply);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<EdgeMeshBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on {}", address);
                append_multiaddr(&mut self.listen_addrs, address);
            }
            SwarmEvent::ExpiredListenAddr { address, .. } => {
                self.listen_addrs.retain(|a| a != &address);
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                if let Some(relay) = self.autorelay.on_listener_closed(listener_id, Instant::now()) {
                    warn!("Relay reservation on {} closed: {:?}", relay, reason);
                }
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                if let Some(relay) = self.autorelay.on_listener_closed(listener_id, Instant::now()) {
                    warn!("Relay reservation on {} failed: {}", relay, error);
                }
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                debug!("Connected to {} via {:?}", peer_id, endpoint);
                let (local, remote) = match &endpoint {
                    ConnectedPoint::Dialer { address, .. } => {
                        if !is_circuit_addr(address) {
                            self.remember(peer_id, vec![address.clone()]);
                        }
                        let local = self.listen_addrs.first().cloned().unwrap_or_else(Multiaddr::empty);
                        (local, address.clone())
                    }
                    ConnectedPoint::Listener {
                        local_addr,
                        send_back_addr,
                    } => (local_addr.clone(), send_back_addr.clone()),
                };
                self.connections.insert(
                    connection_id,
                    ConnectionInfo {
                        peer_id,
                        local,
                        remote,
                    },
                );
                self.conn_manager
                    .on_established(connection_id, peer_id, Instant::now());
                self.resolve_dial(&peer_id, Ok(()));
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                connection_id,
                num_established,
                cause,
                ..
            } => {
                self.connections.remove(&connection_id);
                self.conn_manager.on_closed(connection_id);
                if num_established == 0 {
                    debug!("Disconnected from {}: {:?}", peer_id, cause);
                }
            }
            SwarmEvent::OutgoingConnectionError {
                peer_id: Some(peer_id),
                error,
                ..
            } => {
                if !self.swarm.is_connected(&peer_id) {
                    debug!("Outgoing connection to {} failed: {}", peer_id, error);
                    self.resolve_dial(&peer_id, Err(error.to_string()));
                }
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!("External address confirmed: {}", address);
            }
            SwarmEvent::Behaviour(event) => self.handle_behaviour_event(event),
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: EdgeMeshBehaviourEvent) {
        match event {
            EdgeMeshBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id,
                result,
                step,
                ..
            }) => self.handle_query_progress(id, result, step.last),
            EdgeMeshBehaviourEvent::Kademlia(kad::Event::RoutingUpdated {
                peer, addresses, ..
            }) => {
                self.remember(peer, addresses.into_vec());
            }
            EdgeMeshBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                let addrs: Vec<Multiaddr> = info
                    .listen_addrs
                    .into_iter()
                    .filter(|a| !is_circuit_addr(a))
                    .collect();
                for addr in &addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                }
                self.remember(peer_id, addrs);
            }
            EdgeMeshBehaviourEvent::Mdns(mdns::Event::Discovered(list)) => {
                let mut found: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in list {
                    append_multiaddr(found.entry(peer_id).or_default(), addr);
                }
                for (peer_id, addrs) in found {
                    if peer_id == *self.swarm.local_peer_id() {
                        continue;
                    }
                    self.remember(peer_id, addrs);
                    self.emit(NetworkEvent::LocalPeerDiscovered(self.peer_info(peer_id)));
                }
            }
            EdgeMeshBehaviourEvent::Mdns(mdns::Event::Expired(list)) => {
                for (peer_id, addr) in list {
                    trace!("mDNS record expired: {} {}", peer_id, addr);
                }
            }
            EdgeMeshBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                if !renewal {
                    info!("Relay reservation accepted by {}", relay_peer_id);
                    self.emit(NetworkEvent::RelayReservationAccepted(relay_peer_id));
                }
            }
            EdgeMeshBehaviourEvent::RelayClient(event) => debug!("Relay client: {:?}", event),
            EdgeMeshBehaviourEvent::RelayServer(event) => trace!("Relay service: {:?}", event),
            EdgeMeshBehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            }) => match result {
                Ok(_) => info!("Hole punch to {} succeeded", remote_peer_id),
                Err(e) => debug!("Hole punch to {} failed: {}", remote_peer_id, e),
            },
            EdgeMeshBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                debug!("NAT status {:?} -> {:?}", old, new);
                self.on_nat_status(new);
            }
            EdgeMeshBehaviourEvent::Upnp(upnp::Event::NewExternalAddr(addr)) => {
                info!("UPnP mapped external address {}", addr);
            }
            EdgeMeshBehaviourEvent::Upnp(upnp::Event::GatewayNotFound) => {
                debug!("No UPnP gateway found");
            }
            _ => {}
        }
    }

    fn on_nat_status(&mut self, status: autonat::NatStatus) {
        if self.force_private {
            return;
        }
        let reachability = match status {
            autonat::NatStatus::Public(_) => Reachability::Public,
            autonat::NatStatus::Private => Reachability::Private,
            autonat::NatStatus::Unknown => Reachability::Unknown,
        };
        if !self.autorelay.set_reachability(reachability) {
            return;
        }
        info!("Reachability is now {}", reachability);
        self.emit(NetworkEvent::ReachabilityChanged(reachability));
        match reachability {
            Reachability::Private => self.reserve_relays(),
            Reachability::Public => {
                for listener_id in self.autorelay.release_all() {
                    self.swarm.remove_listener(listener_id);
                }
            }
            Reachability::Unknown => {}
        }
    }

    fn handle_query_progress(&mut self, id: QueryId, result: QueryResult, last: bool) {
        match result {
            QueryResult::GetClosestPeers(result) => {
                let peers = match result {
                    Ok(ok) => ok.peers,
                    Err(kad::GetClosestPeersError::Timeout { peers, .. }) => peers,
                };
                let mut infos = Vec::with_capacity(peers.len());
                for peer in peers {
                    self.remember(peer.peer_id, peer.addrs);
                    infos.push(self.peer_info(peer.peer_id));
                }
                if let Some(PendingQuery::ClosestPeers(reply)) = self.queries.remove(&id) {
                    let _ = reply.send(Ok(infos));
                }
            }
            QueryResult::GetProviders(result) => {
                if let Some(PendingQuery::Providers { found, .. }) = self.queries.get_mut(&id) {
                    match result {
                        Ok(GetProvidersOk::FoundProviders { providers, .. }) => {
                            for provider in providers {
                                if !found.contains(&provider) {
                                    found.push(provider);
                                }
                            }
                        }
                        Ok(GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                        Err(e) => debug!("Provider lookup ended: {}", e),
                    }
                }
                if last {
                    if let Some(PendingQuery::Providers { found, reply }) = self.queries.remove(&id) {
                        let infos = found.into_iter().map(|p| self.peer_info(p)).collect();
                        let _ = reply.send(Ok(infos));
                    }
                }
            }
            QueryResult::StartProviding(result) => match result {
                Ok(ok) => debug!("Provider record published for {:?}", ok.key),
                Err(e) => warn!("Failed to publish provider record: {}", e),
            },
            QueryResult::Bootstrap(result) => {
                if let Err(e) = result {
                    debug!("DHT bootstrap: {}", e);
                }
            }
            _ => {}
        }
    }
}
