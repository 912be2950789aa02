//! Relay map and multiaddress helpers
//!
//! The relay map is keyed by node name. It starts from the static relay
//! configuration and is refreshed with addresses learned from the DHT.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use edgemesh_core::{RelayNode, TransportKind};
use edgemesh_keystore::peer_id_from_node_name;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use tracing::warn;

/// A peer and the addresses it may be reached on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAddrInfo {
    pub peer_id: PeerId,
    pub addrs: Vec<Multiaddr>,
}

impl PeerAddrInfo {
    pub fn new(peer_id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        Self { peer_id, addrs }
    }
}

impl fmt::Display for PeerAddrInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}: [", self.peer_id)?;
        for (i, addr) in self.addrs.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{addr}")?;
        }
        f.write_str("]}")
    }
}

/// A node willing to relay traffic for others
pub type RelayInfo = PeerAddrInfo;

/// Node name → relay info
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayMap {
    relays: BTreeMap<String, RelayInfo>,
}

impl RelayMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, node_name: impl Into<String>, info: RelayInfo) {
        self.relays.insert(node_name.into(), info);
    }

    pub fn get(&self, node_name: &str) -> Option<&RelayInfo> {
        self.relays.get(node_name)
    }

    pub fn remove(&mut self, node_name: &str) -> Option<RelayInfo> {
        self.relays.remove(node_name)
    }

    pub fn contains(&self, node_name: &str) -> bool {
        self.relays.contains_key(node_name)
    }

    pub fn len(&self) -> usize {
        self.relays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RelayInfo)> {
        self.relays.iter()
    }

    /// Snapshot of every relay, for use outside a lock
    pub fn relays(&self) -> Vec<(String, RelayInfo)> {
        self.relays
            .iter()
            .map(|(name, info)| (name.clone(), info.clone()))
            .collect()
    }

    /// Whether any relay advertises a publicly routable address
    pub fn contains_public_ip(&self) -> bool {
        self.relays
            .values()
            .flat_map(|info| info.addrs.iter())
            .any(is_public_addr)
    }

    pub fn is_relay_peer(&self, peer_id: &PeerId) -> bool {
        self.relays.values().any(|info| &info.peer_id == peer_id)
    }

    /// Merge addresses learned for `node_name` into the map.
    ///
    /// Private and circuit addresses are dropped first. A node without an
    /// entry is only inserted when something survives the filter. Returns
    /// whether the map changed.
    pub fn refresh(&mut self, node_name: &str, info: PeerAddrInfo) -> bool {
        let addrs = filter_circuit_addrs(filter_private_addrs(info.addrs));
        match self.relays.get_mut(node_name) {
            Some(existing) => {
                let before = existing.addrs.len();
                for addr in addrs {
                    append_multiaddr(&mut existing.addrs, addr);
                }
                existing.addrs.len() != before
            }
            None if addrs.is_empty() => false,
            None => {
                self.relays
                    .insert(node_name.to_string(), PeerAddrInfo::new(info.peer_id, addrs));
                true
            }
        }
    }
}

/// Build the relay map from static configuration.
///
/// Nodes whose name or addresses cannot be converted are logged and skipped.
pub fn generate_relay_map(nodes: &[RelayNode], transport: TransportKind, port: u16) -> RelayMap {
    let mut map = RelayMap::new();
    for node in nodes {
        let peer_id = match peer_id_from_node_name(&node.node_name) {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to generate peer id from {:?}: {}", node.node_name, e);
                continue;
            }
        };
        let addrs: Result<Vec<Multiaddr>, _> = node
            .advertise_address
            .iter()
            .map(|ip| ip.parse::<IpAddr>().map(|ip| transport_multiaddr(transport, ip, port)))
            .collect();
        match addrs {
            Ok(addrs) => map.insert(node.node_name.clone(), PeerAddrInfo::new(peer_id, addrs)),
            Err(e) => warn!(
                "Failed to convert advertise addresses {:?} of {}: {}",
                node.advertise_address, node.node_name, e
            ),
        }
    }
    map
}

/// Listen/dial address for `ip:port` on the given transport
pub fn transport_multiaddr(transport: TransportKind, ip: IpAddr, port: u16) -> Multiaddr {
    let base = Multiaddr::empty().with(Protocol::from(ip));
    match transport {
        TransportKind::Tcp => base.with(Protocol::Tcp(port)),
        TransportKind::Ws => base
            .with(Protocol::Tcp(port))
            .with(Protocol::Ws(Cow::Borrowed("/"))),
        TransportKind::Quic => base.with(Protocol::Udp(port)).with(Protocol::QuicV1),
    }
}

/// `<relay_addr>/p2p/<relay_id>/p2p-circuit`
pub fn circuit_addr(relay_addr: &Multiaddr, relay_id: PeerId) -> Multiaddr {
    let mut addr = relay_addr.clone();
    if !matches!(addr.iter().last(), Some(Protocol::P2p(id)) if id == relay_id) {
        addr.push(Protocol::P2p(relay_id));
    }
    addr.with(Protocol::P2pCircuit)
}

/// Append a circuit address through every relay (other than the peer itself)
pub fn add_circuit_addrs(info: &mut PeerAddrInfo, relays: &RelayMap) {
    for relay in relays.relays.values() {
        if relay.peer_id == info.peer_id {
            continue;
        }
        for addr in &relay.addrs {
            append_multiaddr(&mut info.addrs, circuit_addr(addr, relay.peer_id));
        }
    }
}

/// Push `addr` unless an equal address is already present
pub fn append_multiaddr(addrs: &mut Vec<Multiaddr>, addr: Multiaddr) {
    if !addrs.contains(&addr) {
        addrs.push(addr);
    }
}

/// Keep only publicly routable addresses
pub fn filter_private_addrs(addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
    addrs.into_iter().filter(is_public_addr).collect()
}

/// Drop relayed addresses
pub fn filter_circuit_addrs(addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
    addrs.into_iter().filter(|a| !is_circuit_addr(a)).collect()
}

pub fn is_circuit_addr(addr: &Multiaddr) -> bool {
    addr.iter().any(|p| matches!(p, Protocol::P2pCircuit))
}

/// Whether the address' host part is publicly routable
pub fn is_public_addr(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => is_public_ipv4(ip),
        Some(Protocol::Ip6(ip)) => is_public_ipv6(ip),
        Some(Protocol::Dns(host)) | Some(Protocol::Dns4(host)) | Some(Protocol::Dns6(host)) => {
            host != "localhost" && !host.ends_with(".localhost")
        }
        _ => false,
    }
}

fn is_public_ipv4(ip: Ipv4Addr) -> bool {
    let octets = ip.octets();
    let shared = octets[0] == 100 && (octets[1] & 0xc0) == 64;
    !(ip.is_private()
        || ip.is_loopback()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        || ip.is_documentation()
        || octets[0] == 0
        || shared)
}

fn is_public_ipv6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    let unique_local = (first & 0xfe00) == 0xfc00;
    let link_local = (first & 0xffc0) == 0xfe80;
    !(ip.is_loopback() || ip.is_unspecified() || unique_local || link_local)
}
