//! Network behaviour for EdgeMesh
//!
//! Combines the DHT, identify, local discovery, relay client/service,
//! hole punching, NAT probing, UPnP and raw stream protocols into one
//! swarm behaviour. Optional parts sit behind `Toggle`.

use std::num::NonZeroUsize;
use std::time::Duration;

use libp2p::identity::Keypair;
use libp2p::kad::store::MemoryStore;
use libp2p::swarm::behaviour::toggle::Toggle;
use libp2p::swarm::NetworkBehaviour;
use libp2p::{autonat, dcutr, identify, kad, mdns, relay, upnp, PeerId, StreamProtocol};

use crate::NetworkError;

/// Kademlia protocol name
pub const KADEMLIA_PROTOCOL: StreamProtocol = StreamProtocol::new("/edgemesh/kad/1.0.0");

/// Identify protocol version
pub const IDENTIFY_PROTOCOL_VERSION: &str = "/edgemesh/id/1.0.0";

const KAD_PARALLELISM: usize = 10;

/// Which optional behaviours to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BehaviourOptions {
    pub enable_mdns: bool,
    pub enable_hole_punch: bool,
    pub enable_nat_port_map: bool,
    /// NAT probing; off when reachability is forced private
    pub enable_autonat: bool,
    pub relay_service: bool,
}

impl Default for BehaviourOptions {
    fn default() -> Self {
        Self {
            enable_mdns: true,
            enable_hole_punch: true,
            enable_nat_port_map: true,
            enable_autonat: true,
            relay_service: false,
        }
    }
}

#[derive(NetworkBehaviour)]
pub struct EdgeMeshBehaviour {
    pub kademlia: kad::Behaviour<MemoryStore>,
    pub identify: identify::Behaviour,
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    pub relay_client: relay::client::Behaviour,
    pub relay_server: Toggle<relay::Behaviour>,
    pub dcutr: Toggle<dcutr::Behaviour>,
    pub autonat: Toggle<autonat::Behaviour>,
    pub upnp: Toggle<upnp::tokio::Behaviour>,
    pub stream: libp2p_stream::Behaviour,
}

impl EdgeMeshBehaviour {
    pub fn new(
        keypair: &Keypair,
        relay_client: relay::client::Behaviour,
        options: &BehaviourOptions,
    ) -> Result<Self, NetworkError> {
        let peer_id = keypair.public().to_peer_id();

        let mut kad_config = kad::Config::new(KADEMLIA_PROTOCOL);
        if let Some(parallelism) = NonZeroUsize::new(KAD_PARALLELISM) {
            kad_config.set_parallelism(parallelism);
        }
        kad_config.set_query_timeout(Duration::from_secs(60));
        let mut kademlia =
            kad::Behaviour::with_config(peer_id, MemoryStore::new(peer_id), kad_config);
        kademlia.set_mode(Some(kad::Mode::Server));

        let identify = identify::Behaviour::new(
            identify::Config::new(IDENTIFY_PROTOCOL_VERSION.to_string(), keypair.public())
                .with_agent_version(format!("edgemesh/{}", env!("CARGO_PKG_VERSION"))),
        );

        let mdns = if options.enable_mdns {
            let behaviour = mdns::tokio::Behaviour::new(mdns::Config::default(), peer_id)
                .map_err(|e| NetworkError::Behaviour(format!("mdns: {e}")))?;
            Some(behaviour)
        } else {
            None
        };

        Ok(Self {
            kademlia,
            identify,
            mdns: Toggle::from(mdns),
            relay_client,
            relay_server: Toggle::from(
                options.relay_service.then(|| relay_service(peer_id)),
            ),
            dcutr: Toggle::from(options.enable_hole_punch.then(|| dcutr::Behaviour::new(peer_id))),
            autonat: Toggle::from(
                options
                    .enable_autonat
                    .then(|| autonat::Behaviour::new(peer_id, autonat::Config::default())),
            ),
            upnp: Toggle::from(options.enable_nat_port_map.then(upnp::tokio::Behaviour::default)),
            stream: libp2p_stream::Behaviour::new(),
        })
    }

    /// Handle for opening and accepting raw protocol streams
    pub fn stream_control(&self) -> libp2p_stream::Control {
        self.stream.new_control()
    }

    /// Start or stop serving circuits for other peers.
    ///
    /// Only connections established afterwards pick up the change.
    pub fn set_relay_service(&mut self, local_peer_id: PeerId, enabled: bool) {
        if self.relay_server.is_enabled() == enabled {
            return;
        }
        self.relay_server = Toggle::from(enabled.then(|| relay_service(local_peer_id)));
    }
}

/// Relay service without circuit duration or byte limits
pub fn relay_service(local_peer_id: PeerId) -> relay::Behaviour {
    relay::Behaviour::new(local_peer_id, relay_service_config())
}

fn relay_service_config() -> relay::Config {
    relay::Config {
        max_reservations: 1024,
        max_reservations_per_peer: 8,
        reservation_duration: Duration::from_secs(60 * 60),
        max_circuits: 1024,
        max_circuits_per_peer: 64,
        max_circuit_duration: Duration::from_secs(365 * 24 * 60 * 60),
        max_circuit_bytes: u64::MAX,
        reservation_rate_limiters: Vec::new(),
        circuit_src_rate_limiters: Vec::new(),
        ..Default::default()
    }
}
