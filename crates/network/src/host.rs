//! Host handle
//!
//! The swarm lives in a single driver task. Everything else talks to it
//! through a cloneable [`HostHandle`] that sends commands over a channel and
//! waits for the reply on a oneshot.

use libp2p::identity::Keypair;
use libp2p::{Multiaddr, PeerId, Stream, StreamProtocol};
use libp2p_stream::IncomingStreams;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::autorelay::Reachability;
use crate::driver::SwarmDriver;
use crate::node::{build_swarm, NetworkConfig, NetworkError};
use crate::relay_map::PeerAddrInfo;

const COMMAND_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 256;

type Reply<T> = oneshot::Sender<T>;

/// Requests handled by the swarm driver
#[derive(Debug)]
pub enum HostCommand {
    Connect {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
        reply: Reply<Result<(), NetworkError>>,
    },
    IsConnected {
        peer_id: PeerId,
        reply: Reply<bool>,
    },
    AddAddresses {
        peer_id: PeerId,
        addrs: Vec<Multiaddr>,
    },
    Addresses {
        peer_id: PeerId,
        reply: Reply<Vec<Multiaddr>>,
    },
    ClosestPeers {
        key: PeerId,
        reply: Reply<Result<Vec<PeerAddrInfo>, NetworkError>>,
    },
    Advertise {
        namespace: String,
        reply: Reply<Result<(), NetworkError>>,
    },
    FindProviders {
        namespace: String,
        reply: Reply<Result<Vec<PeerAddrInfo>, NetworkError>>,
    },
    ConnectionAddrs {
        peer_id: PeerId,
        reply: Reply<Option<(Multiaddr, Multiaddr)>>,
    },
    ListenAddrs {
        reply: Reply<Vec<Multiaddr>>,
    },
    SetRelays {
        relays: Vec<PeerAddrInfo>,
    },
    SetRelayService {
        enabled: bool,
        external_addrs: Vec<Multiaddr>,
    },
    Shutdown,
}

/// Events surfaced by the driver
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A peer was found on the local network
    LocalPeerDiscovered(PeerAddrInfo),
    ReachabilityChanged(Reachability),
    RelayReservationAccepted(PeerId),
}

/// Cloneable access to the running swarm
#[derive(Clone)]
pub struct HostHandle {
    local_peer_id: PeerId,
    commands: mpsc::Sender<HostCommand>,
    candidates: mpsc::Sender<PeerAddrInfo>,
    control: libp2p_stream::Control,
}

/// Build the swarm and spawn its driver on the current tokio runtime
pub fn spawn_host(
    keypair: Keypair,
    config: NetworkConfig,
) -> Result<(HostHandle, mpsc::Receiver<NetworkEvent>), NetworkError> {
    let swarm = build_swarm(keypair, &config)?;
    let local_peer_id = *swarm.local_peer_id();
    let control = swarm.behaviour().stream_control();

    let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (candidate_tx, candidate_rx) = mpsc::channel(config.max_candidates.max(1));
    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);

    let driver = SwarmDriver::new(swarm, &config, command_rx, candidate_rx, event_tx);
    tokio::spawn(driver.run());

    let handle = HostHandle {
        local_peer_id,
        commands: command_tx,
        candidates: candidate_tx,
        control,
    };
    Ok((handle, event_rx))
}

impl HostHandle {
    pub fn peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> HostCommand,
    ) -> Result<T, NetworkError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| NetworkError::Shutdown)?;
        rx.await.map_err(|_| NetworkError::Shutdown)
    }

    async fn send(&self, command: HostCommand) -> Result<(), NetworkError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| NetworkError::Shutdown)
    }

    /// Connect to `peer_id`, adding `addrs` to what is already known.
    /// Resolves once a connection exists or the dial failed; callers bound
    /// the wait with their own timeout.
    pub async fn connect(&self, peer_id: PeerId, addrs: Vec<Multiaddr>) -> Result<(), NetworkError> {
        self.request(|reply| HostCommand::Connect {
            peer_id,
            addrs,
            reply,
        })
        .await?
    }

    pub async fn is_connected(&self, peer_id: PeerId) -> bool {
        self.request(|reply| HostCommand::IsConnected { peer_id, reply })
            .await
            .unwrap_or(false)
    }

    pub async fn add_addresses(&self, peer_id: PeerId, addrs: Vec<Multiaddr>) -> Result<(), NetworkError> {
        self.send(HostCommand::AddAddresses { peer_id, addrs }).await
    }

    /// Every address known for `peer_id`
    pub async fn addresses(&self, peer_id: PeerId) -> Vec<Multiaddr> {
        self.request(|reply| HostCommand::Addresses { peer_id, reply })
            .await
            .unwrap_or_default()
    }

    /// DHT peers closest to `key`
    pub async fn closest_peers(&self, key: PeerId) -> Result<Vec<PeerAddrInfo>, NetworkError> {
        self.request(|reply| HostCommand::ClosestPeers { key, reply })
            .await?
    }

    /// Publish a provider record for `namespace`
    pub async fn advertise(&self, namespace: &str) -> Result<(), NetworkError> {
        let namespace = namespace.to_string();
        self.request(|reply| HostCommand::Advertise { namespace, reply })
            .await?
    }

    /// Every provider of `namespace` the DHT knows about
    pub async fn find_providers(&self, namespace: &str) -> Result<Vec<PeerAddrInfo>, NetworkError> {
        let namespace = namespace.to_string();
        self.request(|reply| HostCommand::FindProviders { namespace, reply })
            .await?
    }

    /// `(local, remote)` addresses of a live connection to `peer_id`
    pub async fn connection_addrs(&self, peer_id: PeerId) -> Option<(Multiaddr, Multiaddr)> {
        self.request(|reply| HostCommand::ConnectionAddrs { peer_id, reply })
            .await
            .ok()
            .flatten()
    }

    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.request(|reply| HostCommand::ListenAddrs { reply })
            .await
            .unwrap_or_default()
    }

    /// Replace the protected relay set
    pub async fn set_relays(&self, relays: Vec<PeerAddrInfo>) -> Result<(), NetworkError> {
        self.send(HostCommand::SetRelays { relays }).await
    }

    pub async fn set_relay_service(
        &self,
        enabled: bool,
        external_addrs: Vec<Multiaddr>,
    ) -> Result<(), NetworkError> {
        self.send(HostCommand::SetRelayService {
            enabled,
            external_addrs,
        })
        .await
    }

    /// Offer a relay candidate; returns false when the queue is full
    pub fn offer_relay_candidate(&self, info: PeerAddrInfo) -> bool {
        match self.candidates.try_send(info) {
            Ok(()) => true,
            Err(e) => {
                debug!("Relay candidate dropped: {}", e);
                false
            }
        }
    }

    pub async fn open_stream(&self, peer_id: PeerId, protocol: StreamProtocol) -> Result<Stream, NetworkError> {
        self.control
            .clone()
            .open_stream(peer_id, protocol)
            .await
            .map_err(|e| NetworkError::Stream {
                peer_id,
                reason: e.to_string(),
            })
    }

    /// Register as the handler of `protocol`
    pub fn accept(&self, protocol: StreamProtocol) -> Result<IncomingStreams, NetworkError> {
        self.control
            .clone()
            .accept(protocol.clone())
            .map_err(|e| NetworkError::Config(format!("{protocol}: {e}")))
    }

    /// Stop the driver, closing every connection
    pub async fn shutdown(&self) {
        let _ = self.send(HostCommand::Shutdown).await;
    }
}
