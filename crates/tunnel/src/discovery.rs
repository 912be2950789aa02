//! Peer discovery
//!
//! Candidates come from mDNS (local network) and from provider records under
//! the rendezvous tag (DHT). A candidate is only admitted to the node-peer map
//! once it completes the discovery handshake, which trades node names over
//! [`DISCOVERY_PROTOCOL`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use edgemesh_core::{DiscoveryKind, TunnelError};
use edgemesh_network::{
    add_circuit_addrs, read_message, write_message, DiscoveryMessage, DiscoveryType, HostHandle,
    IncomingStreams, NetworkEvent, PeerAddrInfo, PeerId, Stream, DISCOVERY_PROTOCOL,
};
use futures::{AsyncWriteExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bootstrap::SharedRelayMap;
use crate::peers::NodePeerMap;
use crate::tunnel::SharedConfig;

/// Bound of one handshake, either side
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How long wide-area rounds skip a provider after a failed handshake
pub const HANDSHAKE_BACKOFF: Duration = Duration::from_secs(5 * 60);

/// Providers whose last background handshake failed.
///
/// Client-only nodes advertise the rendezvous tag but never answer the
/// discovery protocol, so without this every round would retry them.
#[derive(Clone, Default)]
pub(crate) struct FailedHandshakes {
    retry_after: Arc<Mutex<HashMap<PeerId, Instant>>>,
}

impl FailedHandshakes {
    /// Returns true for the first failure since the last success
    pub(crate) fn record(&self, peer_id: PeerId, now: Instant) -> bool {
        self.retry_after
            .lock()
            .insert(peer_id, now + HANDSHAKE_BACKOFF)
            .is_none()
    }

    pub(crate) fn is_backing_off(&self, peer_id: &PeerId, now: Instant) -> bool {
        self.retry_after
            .lock()
            .get(peer_id)
            .is_some_and(|until| *until > now)
    }

    pub(crate) fn clear(&self, peer_id: &PeerId) {
        self.retry_after.lock().remove(peer_id);
    }
}

#[derive(Clone)]
pub(crate) struct Discoverer {
    pub(crate) host: HostHandle,
    pub(crate) peers: NodePeerMap,
    pub(crate) relays: SharedRelayMap,
    pub(crate) node_name: String,
    pub(crate) failed: FailedHandshakes,
}

impl Discoverer {
    /// Run the initiator side of the handshake against `info`.
    /// Returns the node name the peer answered with.
    pub(crate) async fn handshake(
        &self,
        kind: DiscoveryKind,
        info: PeerAddrInfo,
    ) -> Result<String, TunnelError> {
        let peer_id = info.peer_id;
        if peer_id == self.host.peer_id() {
            return Err(TunnelError::HandshakeFailed {
                peer: peer_id.to_string(),
                reason: "peer is this node".to_string(),
            });
        }

        let exchange = async {
            self.host.connect(peer_id, info.addrs).await?;
            let mut stream = self.host.open_stream(peer_id, DISCOVERY_PROTOCOL).await?;

            write_message(&mut stream, &DiscoveryMessage::connect(kind, &self.node_name)).await?;
            let reply: DiscoveryMessage = read_message(&mut stream).await?;
            let _ = stream.close().await;

            if reply.msg_type != DiscoveryType::Success {
                return Err(handshake_failed(peer_id, "expected SUCCESS"));
            }
            if reply.node_name.is_empty() {
                return Err(handshake_failed(peer_id, "empty node name"));
            }
            self.peers.insert(&reply.node_name, peer_id);
            Ok::<_, TunnelError>(reply.node_name)
        };

        let node_name = timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .map_err(|_| TunnelError::Timeout)??;
        info!("[{}] Discovered node {} as {}", kind, node_name, peer_id);
        Ok(node_name)
    }

    fn spawn_handshake(&self, kind: DiscoveryKind, info: PeerAddrInfo) {
        let discoverer = self.clone();
        tokio::spawn(async move {
            let peer_id = info.peer_id;
            match discoverer.handshake(kind, info).await {
                Ok(_) => discoverer.failed.clear(&peer_id),
                Err(e) => {
                    if discoverer.failed.record(peer_id, Instant::now()) {
                        warn!("[{}] Handshake with {} failed: {}", kind, peer_id, e);
                    } else {
                        debug!("[{}] Handshake with {} failed again: {}", kind, peer_id, e);
                    }
                }
            }
        });
    }

    /// Answer handshakes until cancelled
    pub(crate) async fn run_responder(
        self,
        mut incoming: IncomingStreams,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = incoming.next() => {
                    let Some((peer_id, stream)) = next else {
                        break;
                    };
                    let discoverer = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = discoverer.respond(peer_id, stream).await {
                            warn!("Discovery request from {} failed: {}", peer_id, e);
                        }
                    });
                }
            }
        }
        debug!("Discovery responder stopped");
    }

    async fn respond(&self, peer_id: PeerId, mut stream: Stream) -> Result<(), TunnelError> {
        let exchange = async {
            let request: DiscoveryMessage = read_message(&mut stream).await?;
            if request.msg_type != DiscoveryType::Connect {
                return Err(handshake_failed(peer_id, "expected CONNECT"));
            }
            if request.node_name.is_empty() {
                return Err(handshake_failed(peer_id, "empty node name"));
            }
            let reply = DiscoveryMessage::success(request.protocol, &self.node_name);
            write_message(&mut stream, &reply).await?;
            let _ = stream.close().await;

            self.peers.insert(&request.node_name, peer_id);
            Ok::<_, TunnelError>(request)
        };

        let request = timeout(HANDSHAKE_TIMEOUT, exchange)
            .await
            .map_err(|_| TunnelError::Timeout)??;
        info!(
            "[{}] Node {} ({}) discovered us",
            request.protocol, request.node_name, peer_id
        );
        Ok(())
    }

    /// Consume host events, handshaking with every mDNS peer.
    ///
    /// mDNS announcements carry no rendezvous tag, so any tunnel node on the
    /// LAN that answers the handshake is admitted. Only a private network
    /// key keeps separate meshes on one LAN apart.
    pub(crate) async fn run_event_loop(
        self,
        mut events: mpsc::Receiver<NetworkEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(NetworkEvent::LocalPeerDiscovered(info)) => {
                        if info.peer_id == self.host.peer_id() {
                            continue;
                        }
                        debug!("[MDNS] Found peer {}", info);
                        self.spawn_handshake(DiscoveryKind::Mdns, info);
                    }
                    Some(NetworkEvent::ReachabilityChanged(reachability)) => {
                        info!("Reachability is now {}", reachability);
                    }
                    Some(NetworkEvent::RelayReservationAccepted(relay)) => {
                        info!("Holding a relay reservation on {}", relay);
                    }
                    None => break,
                },
            }
        }
        debug!("Host event loop stopped");
    }

    /// One wide-area round: advertise the rendezvous tag, then handshake with
    /// every unmapped provider
    pub(crate) async fn discover_wide_area(&self, rendezvous: &str) {
        if let Err(e) = self.host.advertise(rendezvous).await {
            debug!("[DHT] Advertising {} failed: {}", rendezvous, e);
        }

        let providers = match self.host.find_providers(rendezvous).await {
            Ok(providers) => providers,
            Err(e) => {
                warn!("[DHT] Provider lookup for {} failed: {}", rendezvous, e);
                return;
            }
        };

        let local = self.host.peer_id();
        let now = Instant::now();
        for mut info in providers {
            if info.peer_id == local || self.peers.contains_peer(&info.peer_id) {
                continue;
            }
            if self.failed.is_backing_off(&info.peer_id, now) {
                trace!("[DHT] Skipping {} after a failed handshake", info.peer_id);
                continue;
            }
            {
                let relays = self.relays.read();
                if !relays.is_relay_peer(&info.peer_id) {
                    add_circuit_addrs(&mut info, &relays);
                }
            }
            debug!("[DHT] Found peer {}", info);
            self.spawn_handshake(DiscoveryKind::Dht, info);
        }
    }

    /// Repeat wide-area rounds until cancelled. Period and tag are re-read
    /// every round so a reload takes effect.
    pub(crate) async fn run_wide_area(self, config: SharedConfig, cancel: CancellationToken) {
        loop {
            let (rendezvous, period) = {
                let config = config.read();
                (config.rendezvous.clone(), config.dht_discovery_interval())
            };
            self.discover_wide_area(&rendezvous).await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
        }
        debug!("Wide-area discovery stopped");
    }
}

fn handshake_failed(peer_id: PeerId, reason: &str) -> TunnelError {
    TunnelError::HandshakeFailed {
        peer: peer_id.to_string(),
        reason: reason.to_string(),
    }
}
