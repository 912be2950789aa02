//! Swarm construction

use std::time::Duration;

use edgemesh_core::{TransportKind, TunnelError};
use libp2p::identity::Keypair;
use libp2p::pnet::PreSharedKey;
use libp2p::{noise, yamux, Multiaddr, PeerId, Swarm, SwarmBuilder};
use thiserror::Error;
use tracing::info;

use crate::behaviour::{BehaviourOptions, EdgeMeshBehaviour};
use crate::conn_manager::ConnManagerConfig;
use crate::relay_map::PeerAddrInfo;
use crate::transport::{build_transport, BoxError};

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Invalid network configuration: {0}")]
    Config(String),

    #[error("Interface lookup failed: {0}")]
    Interfaces(String),

    #[error("Transport setup failed: {0}")]
    Transport(String),

    #[error("Behaviour setup failed: {0}")]
    Behaviour(String),

    #[error("Failed to listen on {addr}: {reason}")]
    Listen { addr: Multiaddr, reason: String },

    #[error("Failed to connect to {peer_id}: {reason}")]
    Dial { peer_id: PeerId, reason: String },

    #[error("Failed to open stream to {peer_id}: {reason}")]
    Stream { peer_id: PeerId, reason: String },

    #[error("DHT operation failed: {0}")]
    Dht(String),

    #[error("Network host has shut down")]
    Shutdown,
}

impl From<NetworkError> for TunnelError {
    fn from(e: NetworkError) -> Self {
        match e {
            NetworkError::Shutdown => TunnelError::Shutdown,
            NetworkError::Config(reason) => TunnelError::InvalidConfig(reason),
            other => TunnelError::NetworkError(other.to_string()),
        }
    }
}

/// Network configuration
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub transport: TransportKind,
    /// Addresses to listen on
    pub listen_addrs: Vec<Multiaddr>,
    /// Private network key for TCP and WebSocket
    pub psk: Option<PreSharedKey>,
    /// Serve circuits for other peers
    pub relay_service: bool,
    /// Addresses announced as externally reachable (relay nodes)
    pub external_addrs: Vec<Multiaddr>,
    /// Skip NAT probing and reserve relay slots right away
    pub force_private: bool,
    /// Known relays; protected from trimming and used to seed the DHT
    pub relays: Vec<PeerAddrInfo>,
    /// Bound of the relay candidate queue
    pub max_candidates: usize,
    pub enable_mdns: bool,
    pub enable_hole_punch: bool,
    pub enable_nat_port_map: bool,
    pub conn_manager: ConnManagerConfig,
    pub idle_connection_timeout: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::Tcp,
            listen_addrs: Vec::new(),
            psk: None,
            relay_service: false,
            external_addrs: Vec::new(),
            force_private: false,
            relays: Vec::new(),
            max_candidates: 5,
            enable_mdns: true,
            enable_hole_punch: true,
            enable_nat_port_map: true,
            conn_manager: ConnManagerConfig::default(),
            idle_connection_timeout: Duration::from_secs(60),
        }
    }
}

impl NetworkConfig {
    pub fn behaviour_options(&self) -> BehaviourOptions {
        BehaviourOptions {
            enable_mdns: self.enable_mdns,
            enable_hole_punch: self.enable_hole_punch,
            enable_nat_port_map: self.enable_nat_port_map,
            enable_autonat: !self.force_private,
            relay_service: self.relay_service,
        }
    }
}

/// Build the swarm and start listening on the configured addresses
pub fn build_swarm(
    keypair: Keypair,
    config: &NetworkConfig,
) -> Result<Swarm<EdgeMeshBehaviour>, NetworkError> {
    if config.transport == TransportKind::Quic && config.psk.is_some() {
        return Err(NetworkError::Config(
            "QUIC cannot be used with a pre-shared key".to_string(),
        ));
    }

    let options = config.behaviour_options();
    let transport_kind = config.transport;
    let psk = config.psk;

    let mut swarm = SwarmBuilder::with_existing_identity(keypair)
        .with_tokio()
        .with_other_transport(|key| build_transport(key, transport_kind, psk))
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_relay_client(noise::Config::new, yamux::Config::default)
        .map_err(|e| NetworkError::Transport(e.to_string()))?
        .with_behaviour(|key, relay_client| {
            EdgeMeshBehaviour::new(key, relay_client, &options).map_err(|e| Box::new(e) as BoxError)
        })
        .map_err(|e| NetworkError::Behaviour(e.to_string()))?
        .with_swarm_config(|cfg| cfg.with_idle_connection_timeout(config.idle_connection_timeout))
        .build();

    for addr in &config.listen_addrs {
        swarm.listen_on(addr.clone()).map_err(|e| NetworkError::Listen {
            addr: addr.clone(),
            reason: e.to_string(),
        })?;
    }
    if config.relay_service {
        for addr in &config.external_addrs {
            swarm.add_external_address(addr.clone());
        }
    }
    for relay in &config.relays {
        for addr in &relay.addrs {
            swarm.behaviour_mut().kademlia.add_address(&relay.peer_id, addr.clone());
        }
    }

    info!(
        "Built {} swarm {} (relay service: {}, forced private: {})",
        config.transport,
        swarm.local_peer_id(),
        config.relay_service,
        config.force_private
    );
    Ok(swarm)
}
