//! Configuration types

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Result, TunnelError};

/// Default rendezvous tag shared by every mesh member
pub const DEFAULT_RENDEZVOUS: &str = "EDGEMESH_PLAYGOUND";

/// Default location of the pre-shared key file
pub const DEFAULT_PSK_PATH: &str = "/etc/edgemesh/psk";

/// Default tunnel listen port
pub const DEFAULT_LISTEN_PORT: u16 = 20006;

/// Tunnel configuration (`modules.edgeTunnel` in the settings file)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelConfig {
    /// Run the tunnel at all
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Whether this node serves streams or only opens them
    #[serde(default)]
    pub mode: TunnelMode,

    /// Kubernetes node name; the peer identity is derived from it
    #[serde(default)]
    pub node_name: String,

    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    #[serde(default)]
    pub transport: TransportKind,

    /// Namespace tag advertised by both discovery mechanisms
    #[serde(default = "default_rendezvous")]
    pub rendezvous: String,

    #[serde(default)]
    pub relay_nodes: Vec<RelayNode>,

    /// Relay candidates buffered for relay selection
    #[serde(default = "default_max_candidates")]
    pub max_candidates: usize,

    /// Seconds between relay reconnect rounds
    #[serde(default = "default_heartbeat_period")]
    pub heartbeat_period: u64,

    /// Seconds between relay finder rounds
    #[serde(default = "default_finder_period")]
    pub finder_period: u64,

    /// Seconds between wide-area discovery rounds
    #[serde(default = "default_dht_discovery_period")]
    pub dht_discovery_period: u64,

    #[serde(default = "default_true")]
    pub enable_mdns: bool,

    #[serde(default = "default_true")]
    pub enable_hole_punch: bool,

    /// Ask the gateway for a port mapping (UPnP)
    #[serde(default = "default_true")]
    pub enable_nat_port_map: bool,

    /// Verbose libp2p logging
    #[serde(default)]
    pub enable_ipfs_log: bool,

    #[serde(default)]
    pub psk: PskConfig,

    #[serde(default)]
    pub tunnel_limit_config: TunnelLimitConfig,

    /// Comma-separated interface names to listen on (empty = all unfiltered)
    #[serde(default)]
    pub listen_interfaces: String,

    /// Comma-separated interface name prefixes to skip, on top of the defaults
    #[serde(default)]
    pub extra_filtered_interfaces: String,
}

fn default_true() -> bool {
    true
}

fn default_listen_port() -> u16 {
    DEFAULT_LISTEN_PORT
}

fn default_rendezvous() -> String {
    DEFAULT_RENDEZVOUS.to_string()
}

fn default_max_candidates() -> usize {
    5
}

fn default_heartbeat_period() -> u64 {
    120
}

fn default_finder_period() -> u64 {
    60
}

fn default_dht_discovery_period() -> u64 {
    60
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enable: true,
            mode: TunnelMode::default(),
            node_name: String::new(),
            listen_port: default_listen_port(),
            transport: TransportKind::default(),
            rendezvous: default_rendezvous(),
            relay_nodes: Vec::new(),
            max_candidates: default_max_candidates(),
            heartbeat_period: default_heartbeat_period(),
            finder_period: default_finder_period(),
            dht_discovery_period: default_dht_discovery_period(),
            enable_mdns: true,
            enable_hole_punch: true,
            enable_nat_port_map: true,
            enable_ipfs_log: false,
            psk: PskConfig::default(),
            tunnel_limit_config: TunnelLimitConfig::default(),
            listen_interfaces: String::new(),
            extra_filtered_interfaces: String::new(),
        }
    }
}

impl TunnelConfig {
    /// Port the host actually binds: client-only nodes use `listen_port + 1`
    /// so they can share a machine with a server instance.
    pub fn effective_listen_port(&self) -> u16 {
        match self.mode {
            TunnelMode::ServerAndClient => self.listen_port,
            TunnelMode::ClientOnly => self.listen_port.saturating_add(1),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period)
    }

    pub fn finder_interval(&self) -> Duration {
        Duration::from_secs(self.finder_period)
    }

    pub fn dht_discovery_interval(&self) -> Duration {
        Duration::from_secs(self.dht_discovery_period)
    }

    /// Check the fields the host cannot start without
    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            return Err(TunnelError::InvalidConfig("nodeName is empty".to_string()));
        }
        if self.rendezvous.is_empty() {
            return Err(TunnelError::InvalidConfig("rendezvous is empty".to_string()));
        }
        if self.mode == TunnelMode::ClientOnly && self.listen_port == u16::MAX {
            return Err(TunnelError::InvalidConfig(
                "listenPort leaves no room for the client-only port".to_string(),
            ));
        }
        if self.heartbeat_period == 0 || self.finder_period == 0 || self.dht_discovery_period == 0 {
            return Err(TunnelError::InvalidConfig(
                "heartbeatPeriod, finderPeriod and dhtDiscoveryPeriod must be positive".to_string(),
            ));
        }
        if self.psk.enable && self.transport == TransportKind::Quic {
            return Err(TunnelError::InvalidConfig(
                "a pre-shared key cannot be used with the quic transport".to_string(),
            ));
        }
        if self.psk.enable && self.psk.path.is_empty() {
            return Err(TunnelError::InvalidConfig("psk.path is empty".to_string()));
        }
        self.tunnel_limit_config.validate()
    }
}

/// Running mode of the tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TunnelMode {
    /// Accept discovery and proxy streams, and open them
    #[default]
    ServerAndClient,
    /// Only open streams; no stream handlers are registered
    ClientOnly,
}

/// Transport the host listens and dials on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Tcp,
    Ws,
    Quic,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Ws => "ws",
            Self::Quic => "quic",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TunnelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "ws" => Ok(Self::Ws),
            "quic" => Ok(Self::Quic),
            other => Err(TunnelError::InvalidConfig(format!(
                "unsupported transport {other:?}, expected one of tcp, ws, quic"
            ))),
        }
    }
}

/// A statically configured relay node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RelayNode {
    pub node_name: String,
    /// IPs the relay is reachable on from other nodes
    #[serde(default)]
    pub advertise_address: Vec<String>,
}

/// Private network pre-shared key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PskConfig {
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_psk_path")]
    pub path: String,
}

fn default_psk_path() -> String {
    DEFAULT_PSK_PATH.to_string()
}

impl Default for PskConfig {
    fn default() -> Self {
        Self {
            enable: true,
            path: default_psk_path(),
        }
    }
}

/// Stream-count limits for the proxy protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelLimitConfig {
    /// When false every limit below is ignored
    #[serde(default = "default_true")]
    pub enable: bool,
    #[serde(default = "default_base_stream")]
    pub tunnel_base_stream_in: usize,
    #[serde(default = "default_base_stream")]
    pub tunnel_base_stream_out: usize,
    #[serde(default = "default_peer_base_stream")]
    pub tunnel_peer_base_stream_in: usize,
    #[serde(default = "default_peer_base_stream")]
    pub tunnel_peer_base_stream_out: usize,
}

fn default_base_stream() -> usize {
    10240
}

fn default_peer_base_stream() -> usize {
    1024
}

impl Default for TunnelLimitConfig {
    fn default() -> Self {
        Self {
            enable: true,
            tunnel_base_stream_in: default_base_stream(),
            tunnel_base_stream_out: default_base_stream(),
            tunnel_peer_base_stream_in: default_peer_base_stream(),
            tunnel_peer_base_stream_out: default_peer_base_stream(),
        }
    }
}

impl TunnelLimitConfig {
    fn validate(&self) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        let limits = [
            self.tunnel_base_stream_in,
            self.tunnel_base_stream_out,
            self.tunnel_peer_base_stream_in,
            self.tunnel_peer_base_stream_out,
        ];
        if limits.contains(&0) {
            return Err(TunnelError::InvalidConfig(
                "stream limits must be positive when tunnelLimitConfig is enabled".to_string(),
            ));
        }
        Ok(())
    }
}
