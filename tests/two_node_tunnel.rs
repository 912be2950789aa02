//! Two-node tunnel tests over loopback TCP
//!
//! Both nodes run in server-and-client mode on ephemeral ports with no
//! relays; peers learn about each other through explicit discovery calls.
//!
//! Run with: cargo test -p edgemesh-tests --test two_node_tunnel

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};
use tokio::time::timeout;

use edgemesh_core::{DiscoveryKind, ProxyOptions, PskConfig, TunnelConfig, TunnelError};
use edgemesh_keystore::{generate_psk, peer_id_from_node_name, save_psk};
use edgemesh_network::{Multiaddr, PeerAddrInfo};
use edgemesh_tunnel::{EdgeTunnel, ProxyStreamProvider};

// =========================================================================
// Helpers
// =========================================================================

fn node_config(node_name: &str) -> TunnelConfig {
    TunnelConfig {
        node_name: node_name.to_string(),
        listen_port: 0,
        listen_interfaces: "lo".to_string(),
        enable_mdns: false,
        enable_hole_punch: false,
        enable_nat_port_map: false,
        psk: PskConfig {
            enable: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

/// `node_config` with a private network key read from `path`
fn psk_config(node_name: &str, path: &std::path::Path) -> TunnelConfig {
    TunnelConfig {
        psk: PskConfig {
            enable: true,
            path: path.display().to_string(),
        },
        ..node_config(node_name)
    }
}

async fn start_node(config: TunnelConfig) -> EdgeTunnel {
    let tunnel = EdgeTunnel::new(config).expect("tunnel builds");
    timeout(Duration::from_secs(10), tunnel.start())
        .await
        .expect("start within timeout")
        .expect("tunnel starts");
    tunnel
}

async fn listen_addrs(tunnel: &EdgeTunnel) -> Vec<Multiaddr> {
    timeout(Duration::from_secs(5), async {
        loop {
            let addrs = tunnel.listen_addrs().await;
            if !addrs.is_empty() {
                return addrs;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("listen address within timeout")
}

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(10), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// `node-a` and `node-b`, with b having discovered a
async fn discovered_pair(
    a_config: TunnelConfig,
    b_config: TunnelConfig,
) -> (EdgeTunnel, EdgeTunnel) {
    let a = start_node(a_config).await;
    let b = start_node(b_config).await;
    let info = PeerAddrInfo::new(a.peer_id(), listen_addrs(&a).await);
    let name = b.discover(DiscoveryKind::Mdns, info).await.expect("handshake");
    assert_eq!(name, a.node_name());
    (a, b)
}

async fn tcp_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    port
}

async fn closed_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

// =========================================================================
// Discovery
// =========================================================================

#[tokio::test]
async fn test_handshake_is_idempotent() {
    let a = start_node(node_config("node-a")).await;
    let b = start_node(node_config("node-b")).await;
    let info = PeerAddrInfo::new(a.peer_id(), listen_addrs(&a).await);

    for _ in 0..2 {
        let name = b.discover(DiscoveryKind::Mdns, info.clone()).await.unwrap();
        assert_eq!(name, "node-a");
    }
    assert_eq!(b.node_peer_map().get("node-a"), Some(a.peer_id()));
    assert_eq!(b.node_peer_map().len(), 1);

    let a_peers = a.node_peer_map();
    let b_id = b.peer_id();
    wait_for("responder mapping", || a_peers.get("node-b") == Some(b_id)).await;
    assert_eq!(a_peers.len(), 1);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_self_discovery_is_rejected() {
    let a = start_node(node_config("node-a")).await;
    let info = PeerAddrInfo::new(a.peer_id(), listen_addrs(&a).await);

    assert!(matches!(
        a.discover(DiscoveryKind::Dht, info).await,
        Err(TunnelError::HandshakeFailed { .. })
    ));
    assert!(a.node_peer_map().is_empty());
    a.shutdown().await;
}

#[tokio::test]
async fn test_mismatched_psk_handshake_fails() {
    let dir = tempfile::tempdir().unwrap();
    let (a_key, b_key) = (dir.path().join("a.psk"), dir.path().join("b.psk"));
    save_psk(&a_key, &generate_psk()).unwrap();
    save_psk(&b_key, &generate_psk()).unwrap();

    let a = start_node(psk_config("node-a", &a_key)).await;
    let b = start_node(psk_config("node-b", &b_key)).await;
    let info = PeerAddrInfo::new(a.peer_id(), listen_addrs(&a).await);

    // the private network upgrade fails before any discovery message
    assert!(b.discover(DiscoveryKind::Mdns, info).await.is_err());
    assert!(!b.host().is_connected(a.peer_id()).await);
    assert!(a.node_peer_map().is_empty());
    assert!(b.node_peer_map().is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

// =========================================================================
// Proxy streams
// =========================================================================

#[tokio::test]
async fn test_tcp_proxy_round_trip() {
    let (a, b) = discovered_pair(node_config("node-a"), node_config("node-b")).await;
    let port = tcp_echo_backend().await;

    let mut conn = b
        .get_proxy_stream(&ProxyOptions::new("tcp", "node-a", "127.0.0.1", port as i32))
        .await
        .expect("proxy stream");
    assert_eq!(conn.peer_id(), a.peer_id());
    assert_eq!(conn.remote_addr().network(), "/libp2p/tunnel-proxy/1.0.0");
    assert_eq!(b.stream_usage().outbound, 1);

    let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    conn.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), conn.read_exact(&mut echoed))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(echoed, payload);

    drop(conn);
    assert_eq!(b.stream_usage().total(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_shared_psk_nodes_proxy() {
    let dir = tempfile::tempdir().unwrap();
    let key = dir.path().join("mesh.psk");
    save_psk(&key, &generate_psk()).unwrap();

    let (a, b) = discovered_pair(psk_config("node-a", &key), psk_config("node-b", &key)).await;
    let port = tcp_echo_backend().await;

    let mut conn = b
        .get_proxy_stream(&ProxyOptions::new("tcp", "node-a", "127.0.0.1", port as i32))
        .await
        .expect("proxy stream over private network");
    let payload = vec![0x5au8; 2048];
    conn.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), conn.read_exact(&mut echoed))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(echoed, payload);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_udp_proxy_round_trip() {
    let (a, b) = discovered_pair(node_config("node-a"), node_config("node-b")).await;

    let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = backend.recv_from(&mut buf).await {
            let _ = backend.send_to(&buf[..n], from).await;
        }
    });

    let mut conn = b
        .get_proxy_stream(&ProxyOptions::new("udp", "node-a", "127.0.0.1", port as i32))
        .await
        .expect("proxy stream");

    let datagram = vec![7u8; 1200];
    conn.write_all(&datagram).await.unwrap();
    let mut echoed = vec![0u8; datagram.len()];
    timeout(Duration::from_secs(10), conn.read_exact(&mut echoed))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(echoed, datagram);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_backend_is_rejected() {
    let (a, b) = discovered_pair(node_config("node-a"), node_config("node-b")).await;
    let port = closed_port().await;

    let result = b
        .get_proxy_stream(&ProxyOptions::new("tcp", "node-a", "127.0.0.1", port as i32))
        .await;
    match result {
        Err(TunnelError::ProxyRejected { node_name, target }) => {
            assert_eq!(node_name, "node-a");
            assert_eq!(target, format!("tcp://127.0.0.1:{port}"));
        }
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }

    // no stream left open on either side
    assert_eq!(b.stream_usage().total(), 0);
    wait_for("responder permit release", || a.stream_usage().total() == 0).await;

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_unsupported_protocol_is_rejected() {
    let (a, b) = discovered_pair(node_config("node-a"), node_config("node-b")).await;

    let result = b
        .get_proxy_stream(&ProxyOptions::new("sctp", "node-a", "127.0.0.1", 9))
        .await;
    assert!(matches!(result, Err(TunnelError::ProxyRejected { .. })));
    assert_eq!(b.stream_usage().total(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_outbound_stream_limit() {
    let mut b_config = node_config("node-b");
    b_config.tunnel_limit_config.tunnel_peer_base_stream_out = 1;
    let (a, b) = discovered_pair(node_config("node-a"), b_config).await;
    let port = tcp_echo_backend().await;
    let opts = ProxyOptions::new("tcp", "node-a", "127.0.0.1", port as i32);

    let first = b.get_proxy_stream(&opts).await.expect("first stream");
    assert!(matches!(
        b.get_proxy_stream(&opts).await,
        Err(TunnelError::StreamLimitExceeded(_))
    ));

    drop(first);
    let second = b.get_proxy_stream(&opts).await.expect("slot freed");
    drop(second);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_undiscovered_node_uses_derived_identity() {
    let a = start_node(node_config("node-a")).await;
    let b = start_node(node_config("node-b")).await;
    b.host()
        .add_addresses(a.peer_id(), listen_addrs(&a).await)
        .await
        .unwrap();
    let port = tcp_echo_backend().await;

    let provider: &dyn ProxyStreamProvider = &b;
    let mut conn = provider
        .get_proxy_stream(ProxyOptions::new("tcp", "node-a", "127.0.0.1", port as i32))
        .await
        .expect("proxy stream");
    assert_eq!(
        b.node_peer_map().get("node-a"),
        Some(peer_id_from_node_name("node-a").unwrap())
    );

    conn.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    conn.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");

    a.shutdown().await;
    b.shutdown().await;
}
