//! The tunnel facade
//!
//! [`EdgeTunnel`] builds the host from a [`TunnelConfig`], keeps relays
//! connected, runs discovery, and hands out proxy streams. It is passed
//! explicitly to whatever needs proxy streams, usually as a
//! [`ProxyStreamProvider`] trait object.

use std::sync::Arc;

use async_trait::async_trait;
use edgemesh_core::{DiscoveryKind, ProxyOptions, TunnelConfig, TunnelError, TunnelMode};
use edgemesh_keystore::{keypair_from_node_name, load_psk};
use edgemesh_network::{
    generate_relay_map, get_ips_from_interfaces, spawn_host, transport_multiaddr, HostHandle,
    Multiaddr, NetworkConfig, NetworkEvent, PeerAddrInfo, PeerId, RelayMap, DISCOVERY_PROTOCOL,
    PROXY_PROTOCOL,
};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::bootstrap::{
    bootstrap_connect, heartbeat_round, run_heartbeat, HeartbeatPolicy, RetryPolicy,
    SharedRelayMap,
};
use crate::conn::StreamConn;
use crate::discovery::{Discoverer, FailedHandshakes};
use crate::finder::run_relay_finder;
use crate::limit::{StreamLimiter, StreamUsage};
use crate::peers::NodePeerMap;
use crate::proxy::ProxyService;

/// Tunnel configuration shared with the background loops
pub type SharedConfig = Arc<RwLock<TunnelConfig>>;

/// Source of proxy streams, injected into the components that forward traffic
#[async_trait]
pub trait ProxyStreamProvider: Send + Sync {
    async fn get_proxy_stream(&self, opts: ProxyOptions) -> Result<StreamConn, TunnelError>;
}

/// A running tunnel node
pub struct EdgeTunnel {
    node_name: String,
    config: SharedConfig,
    host: HostHandle,
    peers: NodePeerMap,
    relays: SharedRelayMap,
    limiter: StreamLimiter,
    discoverer: Discoverer,
    proxy: ProxyService,
    events: Mutex<Option<mpsc::Receiver<NetworkEvent>>>,
    bootstrap_policy: RetryPolicy,
    heartbeat_policy: HeartbeatPolicy,
    cancel: CancellationToken,
}

impl EdgeTunnel {
    /// Build the host for `config`. Must be called inside a tokio runtime.
    ///
    /// Nothing is dialed until [`EdgeTunnel::start`].
    pub fn new(config: TunnelConfig) -> Result<Self, TunnelError> {
        config.validate()?;

        let keypair = keypair_from_node_name(&config.node_name)
            .map_err(|e| TunnelError::Identity(e.to_string()))?;
        let psk = if config.psk.enable {
            let psk = load_psk(&config.psk.path)
                .map_err(|e| TunnelError::InvalidConfig(format!("psk: {e}")))?;
            info!("Private network enabled, psk fingerprint {}", psk.fingerprint());
            Some(psk)
        } else {
            None
        };

        let relay_map =
            generate_relay_map(&config.relay_nodes, config.transport, config.listen_port);
        let is_relay = relay_map.contains(&config.node_name);
        let relay_service = is_relay && config.mode == TunnelMode::ServerAndClient;
        let force_private = !is_relay && !relay_map.contains_public_ip();

        let port = config.effective_listen_port();
        let listen_addrs: Vec<Multiaddr> =
            get_ips_from_interfaces(&config.listen_interfaces, &config.extra_filtered_interfaces)?
                .into_iter()
                .map(|ip| transport_multiaddr(config.transport, ip, port))
                .collect();
        if listen_addrs.is_empty() {
            return Err(TunnelError::InvalidConfig(
                "no usable interface to listen on".to_string(),
            ));
        }

        let network_config = NetworkConfig {
            transport: config.transport,
            listen_addrs,
            psk,
            relay_service,
            external_addrs: relay_external_addrs(&relay_map, &config.node_name, relay_service),
            force_private,
            relays: relay_map.iter().map(|(_, info)| info.clone()).collect(),
            max_candidates: config.max_candidates.max(relay_map.len()),
            enable_mdns: config.enable_mdns,
            enable_hole_punch: config.enable_hole_punch,
            enable_nat_port_map: config.enable_nat_port_map,
            ..Default::default()
        };
        let (host, events) = spawn_host(keypair, network_config)?;

        let peers = NodePeerMap::new();
        let relays: SharedRelayMap = Arc::new(RwLock::new(relay_map));
        let limiter = StreamLimiter::new(config.tunnel_limit_config.clone());
        let node_name = config.node_name.clone();

        info!(
            "Tunnel {} ({}) created in {:?} mode (relay: {}, forced private: {})",
            node_name,
            host.peer_id(),
            config.mode,
            relay_service,
            force_private
        );

        Ok(Self {
            discoverer: Discoverer {
                host: host.clone(),
                peers: peers.clone(),
                relays: relays.clone(),
                node_name: node_name.clone(),
                failed: FailedHandshakes::default(),
            },
            proxy: ProxyService {
                host: host.clone(),
                peers: peers.clone(),
                relays: relays.clone(),
                limiter: limiter.clone(),
            },
            node_name,
            config: Arc::new(RwLock::new(config)),
            host,
            peers,
            relays,
            limiter,
            events: Mutex::new(Some(events)),
            bootstrap_policy: RetryPolicy::default(),
            heartbeat_policy: HeartbeatPolicy::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_bootstrap_policy(mut self, policy: RetryPolicy) -> Self {
        self.bootstrap_policy = policy;
        self
    }

    pub fn with_heartbeat_policy(mut self, policy: HeartbeatPolicy) -> Self {
        self.heartbeat_policy = policy;
        self
    }

    /// Register stream handlers, connect to relays and launch the background
    /// loops. Client-only nodes serve neither protocol.
    pub async fn start(&self) -> Result<(), TunnelError> {
        let events = self
            .events
            .lock()
            .take()
            .ok_or_else(|| TunnelError::InvalidConfig("tunnel already started".to_string()))?;
        let mode = self.config.read().mode;

        if mode == TunnelMode::ServerAndClient {
            let discovery_streams = self.host.accept(DISCOVERY_PROTOCOL)?;
            let proxy_streams = self.host.accept(PROXY_PROTOCOL)?;
            tokio::spawn(
                self.discoverer
                    .clone()
                    .run_responder(discovery_streams, self.cancel.clone()),
            );
            tokio::spawn(self.proxy.clone().run_responder(proxy_streams, self.cancel.clone()));
        }

        let local = self.host.peer_id();
        tokio::select! {
            _ = self.cancel.cancelled() => return Err(TunnelError::Shutdown),
            result = bootstrap_connect(&self.host, local, &self.relays, self.bootstrap_policy) => {
                if let Err(e) = result {
                    warn!("Relay bootstrap: {}", e);
                    self.sync_relays().await;
                }
            }
        }

        tokio::spawn(self.discoverer.clone().run_event_loop(events, self.cancel.clone()));
        tokio::spawn(
            self.discoverer
                .clone()
                .run_wide_area(self.config.clone(), self.cancel.clone()),
        );
        tokio::spawn(run_relay_finder(
            self.host.clone(),
            self.relays.clone(),
            self.peers.clone(),
            self.config.clone(),
            self.cancel.clone(),
        ));
        tokio::spawn(run_heartbeat(
            self.host.clone(),
            self.relays.clone(),
            self.config.clone(),
            self.heartbeat_policy,
            self.cancel.clone(),
        ));

        info!("Tunnel {} started", self.node_name);
        Ok(())
    }

    /// Push the current relay map to the host
    async fn sync_relays(&self) {
        let relays: Vec<PeerAddrInfo> =
            self.relays.read().iter().map(|(_, info)| info.clone()).collect();
        if let Err(e) = self.host.set_relays(relays).await {
            warn!("Failed to update host relay set: {}", e);
        }
    }

    /// Apply a changed configuration.
    ///
    /// The relay map is regenerated, the relay service follows membership in
    /// it, and relays are reconnected in the background. Identity, transport,
    /// ports, private network and interface settings only change on restart.
    pub async fn reload(&self, new_config: TunnelConfig) -> Result<(), TunnelError> {
        new_config.validate()?;
        let old = self.config.read().clone();
        let merged = merge_reloadable(&old, new_config);

        let relay_map =
            generate_relay_map(&merged.relay_nodes, merged.transport, merged.listen_port);
        let relay_service =
            merged.mode == TunnelMode::ServerAndClient && relay_map.contains(&self.node_name);
        let external_addrs = relay_external_addrs(&relay_map, &self.node_name, relay_service);

        *self.relays.write() = relay_map;
        *self.config.write() = merged;

        self.host.set_relay_service(relay_service, external_addrs).await?;
        self.sync_relays().await;

        let host = self.host.clone();
        let relays = self.relays.clone();
        let policy = self.heartbeat_policy;
        tokio::spawn(async move {
            let local = host.peer_id();
            heartbeat_round(&host, local, &relays, policy).await;
        });

        info!("Tunnel {} reloaded (relay: {})", self.node_name, relay_service);
        Ok(())
    }

    /// Handshake with `info` and map its node name
    pub async fn discover(
        &self,
        kind: DiscoveryKind,
        info: PeerAddrInfo,
    ) -> Result<String, TunnelError> {
        self.discoverer.handshake(kind, info).await
    }

    /// Open a proxy stream to a backend behind another node
    pub async fn get_proxy_stream(&self, opts: &ProxyOptions) -> Result<StreamConn, TunnelError> {
        if self.cancel.is_cancelled() {
            return Err(TunnelError::Shutdown);
        }
        self.proxy.get_proxy_stream(opts).await
    }

    /// Stop every loop and close all connections
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.host.shutdown().await;
        info!("Tunnel {} shut down", self.node_name);
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn peer_id(&self) -> PeerId {
        self.host.peer_id()
    }

    pub async fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.host.listen_addrs().await
    }

    pub fn node_peer_map(&self) -> NodePeerMap {
        self.peers.clone()
    }

    /// Snapshot of the relay map
    pub fn relay_map(&self) -> RelayMap {
        self.relays.read().clone()
    }

    pub fn stream_usage(&self) -> StreamUsage {
        self.limiter.usage()
    }

    pub fn config(&self) -> TunnelConfig {
        self.config.read().clone()
    }

    pub fn host(&self) -> &HostHandle {
        &self.host
    }
}

impl Drop for EdgeTunnel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[async_trait]
impl ProxyStreamProvider for EdgeTunnel {
    async fn get_proxy_stream(&self, opts: ProxyOptions) -> Result<StreamConn, TunnelError> {
        EdgeTunnel::get_proxy_stream(self, &opts).await
    }
}

fn relay_external_addrs(
    relays: &RelayMap,
    node_name: &str,
    relay_service: bool,
) -> Vec<Multiaddr> {
    if !relay_service {
        return Vec::new();
    }
    relays.get(node_name).map(|info| info.addrs.clone()).unwrap_or_default()
}

/// `new` with every field that needs a restart taken from `old`
fn merge_reloadable(old: &TunnelConfig, new: TunnelConfig) -> TunnelConfig {
    let fixed = [
        ("nodeName", old.node_name != new.node_name),
        ("mode", old.mode != new.mode),
        ("listenPort", old.listen_port != new.listen_port),
        ("transport", old.transport != new.transport),
        ("psk", old.psk != new.psk),
        ("tunnelLimitConfig", old.tunnel_limit_config != new.tunnel_limit_config),
        ("listenInterfaces", old.listen_interfaces != new.listen_interfaces),
        (
            "extraFilteredInterfaces",
            old.extra_filtered_interfaces != new.extra_filtered_interfaces,
        ),
        ("enableMdns", old.enable_mdns != new.enable_mdns),
        ("enableHolePunch", old.enable_hole_punch != new.enable_hole_punch),
        ("enableNatPortMap", old.enable_nat_port_map != new.enable_nat_port_map),
    ];
    for (field, changed) in fixed {
        if changed {
            warn!("{} changed; the new value takes effect after restart", field);
        }
    }

    TunnelConfig {
        node_name: old.node_name.clone(),
        mode: old.mode,
        listen_port: old.listen_port,
        transport: old.transport,
        psk: old.psk.clone(),
        tunnel_limit_config: old.tunnel_limit_config.clone(),
        listen_interfaces: old.listen_interfaces.clone(),
        extra_filtered_interfaces: old.extra_filtered_interfaces.clone(),
        enable_mdns: old.enable_mdns,
        enable_hole_punch: old.enable_hole_punch,
        enable_nat_port_map: old.enable_nat_port_map,
        ..new
    }
}
