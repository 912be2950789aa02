//! EdgeMesh Network
//!
//! libp2p host for the tunnel overlay.
//!
//! ## Features
//!
//! - Encrypted, multiplexed TCP / WebSocket / QUIC transports
//! - Optional private network (pre-shared key)
//! - Kademlia DHT in server mode, local discovery via mDNS
//! - NAT traversal (circuit relay v2, DCUtR, AutoNAT, UPnP)
//! - Raw protocol streams via libp2p-stream
//! - Framed discovery and proxy messages

mod autorelay;
mod behaviour;
mod conn_manager;
mod driver;
mod host;
mod interfaces;
mod node;
mod protocol;
mod relay_map;
mod transport;

pub use autorelay::{Reachability, DESIRED_RELAYS, RESERVATION_BACKOFF};
pub use behaviour::{BehaviourOptions, EdgeMeshBehaviour, EdgeMeshBehaviourEvent, KADEMLIA_PROTOCOL};
pub use conn_manager::ConnManagerConfig;
pub use host::{spawn_host, HostCommand, HostHandle, NetworkEvent};
pub use interfaces::{get_ips_from_interfaces, select_interface_ips, DEFAULT_FILTERED_INTERFACES};
pub use node::{build_swarm, NetworkConfig, NetworkError};
pub use protocol::{
    read_message, write_message, DiscoveryMessage, DiscoveryType, ProxyMessage, ProxyType,
    DISCOVERY_PROTOCOL, MAX_MESSAGE_SIZE, PROXY_PROTOCOL,
};
pub use relay_map::{
    add_circuit_addrs, append_multiaddr, circuit_addr, filter_circuit_addrs,
    filter_private_addrs, generate_relay_map, is_circuit_addr, is_public_addr,
    transport_multiaddr, PeerAddrInfo, RelayInfo, RelayMap,
};
pub use transport::build_transport;
pub use libp2p_stream::IncomingStreams;

// Re-export commonly used libp2p types
pub use libp2p::pnet::PreSharedKey;
pub use libp2p::{Multiaddr, PeerId, Stream, StreamProtocol};
