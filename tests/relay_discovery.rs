//! Relay bootstrap and wide-area discovery over loopback
//!
//! A server-and-client relay and a client-only edge share one relay list.
//! The edge finds the relay through bootstrap, learns its node name through
//! the DHT rendezvous round, and proxies a connection through it. A private
//! node reachable only through a relay circuit is proxied to as well.
//!
//! Run with: cargo test -p edgemesh-tests --test relay_discovery

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use edgemesh_core::{ProxyOptions, PskConfig, RelayNode, TunnelConfig, TunnelMode};
use edgemesh_keystore::peer_id_from_node_name;
use edgemesh_network::{is_circuit_addr, PeerAddrInfo};
use edgemesh_tunnel::{EdgeTunnel, RetryPolicy};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_test_writer()
        .try_init();
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

fn relay_list() -> Vec<RelayNode> {
    vec![RelayNode {
        node_name: "relay-1".to_string(),
        advertise_address: vec!["127.0.0.1".to_string()],
    }]
}

fn node_config(node_name: &str, mode: TunnelMode, listen_port: u16) -> TunnelConfig {
    TunnelConfig {
        node_name: node_name.to_string(),
        mode,
        listen_port,
        relay_nodes: relay_list(),
        listen_interfaces: "lo".to_string(),
        heartbeat_period: 1,
        finder_period: 1,
        dht_discovery_period: 1,
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

async fn wait_for(what: &str, mut check: impl FnMut() -> bool) {
    timeout(Duration::from_secs(30), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test]
async fn test_edge_discovers_relay_and_proxies_through_it() {
    init_tracing();
    let port = free_port().await;

    let relay_config = node_config("relay-1", TunnelMode::ServerAndClient, port);
    let relay = EdgeTunnel::new(relay_config).unwrap();
    assert_eq!(relay.peer_id(), peer_id_from_node_name("relay-1").unwrap());
    relay.start().await.unwrap();

    // client-only nodes bind listen_port + 1, so both fit on one host
    let edge = EdgeTunnel::new(node_config("edge-1", TunnelMode::ClientOnly, port)).unwrap();
    timeout(Duration::from_secs(30), edge.start())
        .await
        .expect("bootstrap within timeout")
        .unwrap();
    assert!(edge.host().is_connected(relay.peer_id()).await);
    assert!(edge.relay_map().contains("relay-1"));

    let edge_peers = edge.node_peer_map();
    let relay_id = relay.peer_id();
    wait_for("edge to map relay-1", || edge_peers.get("relay-1") == Some(relay_id)).await;

    let relay_peers = relay.node_peer_map();
    let edge_id = edge.peer_id();
    wait_for("relay to map edge-1", || relay_peers.get("edge-1") == Some(edge_id)).await;

    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = backend.accept().await {
            let (mut reader, mut writer) = socket.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
    });

    let opts = ProxyOptions::new("tcp", "relay-1", "127.0.0.1", backend_port as i32);
    let mut conn = edge.get_proxy_stream(&opts).await.expect("proxy through relay");
    conn.write_all(b"ping over the mesh").await.unwrap();
    let mut buf = [0u8; 18];
    timeout(Duration::from_secs(10), conn.read_exact(&mut buf))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(&buf, b"ping over the mesh");
    drop(conn);

    // client-only nodes serve no proxy streams
    let back = ProxyOptions::new("tcp", "edge-1", "127.0.0.1", backend_port as i32);
    assert!(relay.get_proxy_stream(&back).await.is_err());

    edge.shutdown().await;
    relay.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_relay_is_dropped_after_bootstrap() {
    init_tracing();
    let port = free_port().await;

    let edge = EdgeTunnel::new(node_config("edge-2", TunnelMode::ClientOnly, port))
        .unwrap()
        .with_bootstrap_policy(RetryPolicy {
            interval: Duration::from_millis(200),
            deadline: Duration::from_millis(500),
        });
    assert!(edge.relay_map().contains("relay-1"));

    timeout(Duration::from_secs(10), edge.start())
        .await
        .expect("bootstrap gives up in time")
        .unwrap();
    assert!(edge.relay_map().is_empty());

    edge.shutdown().await;
}

#[tokio::test]
async fn test_reload_adds_relay() {
    init_tracing();
    let port = free_port().await;

    let mut config = node_config("edge-3", TunnelMode::ServerAndClient, port);
    config.relay_nodes.clear();
    let edge = EdgeTunnel::new(config.clone()).unwrap();
    edge.start().await.unwrap();
    assert!(edge.relay_map().is_empty());

    config.relay_nodes = relay_list();
    config.heartbeat_period = 30;
    edge.reload(config).await.unwrap();
    assert!(edge.relay_map().contains("relay-1"));
    assert_eq!(edge.config().heartbeat_period, 30);

    edge.shutdown().await;
}

#[tokio::test]
async fn test_private_node_is_reached_through_relay_circuit() {
    init_tracing();
    let port = free_port().await;

    let relay = EdgeTunnel::new(node_config("relay-1", TunnelMode::ServerAndClient, port)).unwrap();
    relay.start().await.unwrap();

    // rounds stay quiet so the client never learns a direct address for node-a
    let mut client_config = node_config("edge-4", TunnelMode::ClientOnly, port);
    client_config.finder_period = 3600;
    client_config.dht_discovery_period = 3600;
    let client = EdgeTunnel::new(client_config).unwrap();
    client.start().await.unwrap();
    assert!(client.host().is_connected(relay.peer_id()).await);

    // no public relay address is known, so node-a starts out private
    let mut private_config = node_config("node-a", TunnelMode::ServerAndClient, 0);
    private_config.relay_nodes.clear();
    let private = EdgeTunnel::new(private_config).unwrap();
    private.start().await.unwrap();

    let relay_info = PeerAddrInfo::new(relay.peer_id(), relay.listen_addrs().await);
    assert!(private.host().offer_relay_candidate(relay_info));

    let host = private.host().clone();
    let circuit = timeout(Duration::from_secs(30), async {
        loop {
            let addrs = host.listen_addrs().await;
            if let Some(addr) = addrs.into_iter().find(is_circuit_addr) {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("relay reservation within timeout");
    assert!(circuit.to_string().contains(&relay.peer_id().to_string()));

    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = backend.accept().await {
            let (mut reader, mut writer) = socket.split();
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
        }
    });

    let opts = ProxyOptions::new("tcp", "node-a", "127.0.0.1", backend_port as i32);
    let mut conn = client.get_proxy_stream(&opts).await.expect("proxy over circuit");
    assert_eq!(conn.peer_id(), private.peer_id());
    assert!(conn.remote_addr().addr().contains("p2p-circuit"));

    let payload: Vec<u8> = (0..2048u32).map(|i| (i % 253) as u8).collect();
    conn.write_all(&payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    timeout(Duration::from_secs(10), conn.read_exact(&mut echoed))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(echoed, payload);
    drop(conn);

    private.shutdown().await;
    client.shutdown().await;
    relay.shutdown().await;
}
