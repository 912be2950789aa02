//! Proxy stream negotiation
//!
//! The initiator asks a remote node to dial a backend on its behalf; once the
//! responder answers SUCCESS the stream carries raw application bytes.
//!
//! ```text
//! initiator                          responder
//!   | -- CONNECT {proto, node, ip, port} -> |  dial backend (3 attempts)
//!   | <- SUCCESS / FAILED ----------------- |
//!   | <========= relayed bytes ==========> |  backend socket
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use edgemesh_core::{L4Protocol, ProxyOptions, TunnelError};
use edgemesh_keystore::peer_id_from_node_name;
use edgemesh_network::{
    add_circuit_addrs, read_message, write_message, HostHandle, IncomingStreams, Multiaddr,
    PeerAddrInfo, PeerId, ProxyMessage, ProxyType, Stream, PROXY_PROTOCOL,
};
use futures::{AsyncWriteExt, StreamExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::SharedRelayMap;
use crate::conn::StreamConn;
use crate::copy::{proxy_conn, proxy_udp, UDP_IDLE_TIMEOUT};
use crate::limit::{Direction, StreamLimiter};
use crate::peers::NodePeerMap;

/// Bound of connect, stream open and reply on the initiator side
pub const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound of reading the CONNECT request on the responder side
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Backend dial attempts before answering FAILED
pub const DIAL_ATTEMPTS: usize = 3;

/// Pause between TCP dial attempts
pub const TCP_DIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Bound of one TCP dial attempt
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub(crate) struct ProxyService {
    pub(crate) host: HostHandle,
    pub(crate) peers: NodePeerMap,
    pub(crate) relays: SharedRelayMap,
    pub(crate) limiter: StreamLimiter,
}

impl ProxyService {
    /// Identity of `node_name`, synthesized and recorded when not yet discovered
    fn resolve(&self, node_name: &str) -> Result<PeerId, TunnelError> {
        if let Some(peer_id) = self.peers.get(node_name) {
            return Ok(peer_id);
        }
        let peer_id =
            peer_id_from_node_name(node_name).map_err(|e| TunnelError::Identity(e.to_string()))?;
        debug!("Node {} not discovered yet, using derived identity {}", node_name, peer_id);
        self.peers.insert(node_name, peer_id);
        Ok(peer_id)
    }

    /// Open a proxy stream to `opts.ip:opts.port` through node `opts.node_name`
    pub(crate) async fn get_proxy_stream(
        &self,
        opts: &ProxyOptions,
    ) -> Result<StreamConn, TunnelError> {
        let peer_id = self.resolve(&opts.node_name)?;

        let mut info = PeerAddrInfo::new(peer_id, self.host.addresses(peer_id).await);
        add_circuit_addrs(&mut info, &self.relays.read());

        let permit = self.limiter.acquire(peer_id, Direction::Outbound)?;

        let negotiate = async {
            self.host.connect(peer_id, info.addrs).await?;
            let mut stream = self.host.open_stream(peer_id, PROXY_PROTOCOL).await?;

            let request =
                ProxyMessage::connect(&opts.protocol, &opts.node_name, &opts.ip, opts.port);
            write_message(&mut stream, &request).await?;
            let reply: ProxyMessage = read_message(&mut stream).await?;
            Ok::<_, TunnelError>((stream, reply))
        };
        let (stream, reply) = timeout(NEGOTIATION_TIMEOUT, negotiate)
            .await
            .map_err(|_| TunnelError::Timeout)??;

        if reply.msg_type != ProxyType::Success {
            return Err(TunnelError::ProxyRejected {
                node_name: opts.node_name.clone(),
                target: opts.target(),
            });
        }

        let (local, remote) = self
            .host
            .connection_addrs(peer_id)
            .await
            .unwrap_or_else(|| (Multiaddr::empty(), Multiaddr::empty()));
        debug!("Proxy stream to {} via {} established", opts.target(), opts.node_name);
        Ok(StreamConn::new(stream, peer_id, &PROXY_PROTOCOL, &local, &remote, Some(permit)))
    }

    /// Serve proxy requests until cancelled
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
                    tokio::spawn(handle_proxy_stream(peer_id, stream, self.limiter.clone()));
                }
            }
        }
        debug!("Proxy responder stopped");
    }
}

/// A dialed backend
enum Backend {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

async fn handle_proxy_stream(peer_id: PeerId, mut stream: Stream, limiter: StreamLimiter) {
    // Dropping the stream without a reply resets it.
    let _permit = match limiter.acquire(peer_id, Direction::Inbound) {
        Ok(permit) => permit,
        Err(e) => {
            warn!("Refusing proxy stream from {}: {}", peer_id, e);
            return;
        }
    };

    let request: ProxyMessage = match timeout(REQUEST_TIMEOUT, read_message(&mut stream)).await {
        Ok(Ok(request)) => request,
        Ok(Err(e)) => {
            warn!("Bad proxy request from {}: {}", peer_id, e);
            return;
        }
        Err(_) => {
            warn!("Proxy request from {} timed out", peer_id);
            return;
        }
    };
    if request.msg_type != ProxyType::Connect {
        warn!("Unexpected {:?} proxy message from {}", request.msg_type, peer_id);
        return;
    }

    let target = format!("{}://{}:{}", request.protocol, request.ip, request.port);
    let backend = match dial_backend(&request.protocol, &request.ip, request.port).await {
        Ok(backend) => backend,
        Err(e) => {
            warn!("Failed to reach {} for {}: {}", target, peer_id, e);
            if let Err(e) = write_message(&mut stream, &request.reply(ProxyType::Failed)).await {
                debug!("Failed to send FAILED to {}: {}", peer_id, e);
            }
            let _ = stream.close().await;
            return;
        }
    };

    if let Err(e) = write_message(&mut stream, &request.reply(ProxyType::Success)).await {
        warn!("Failed to send SUCCESS to {}: {}", peer_id, e);
        return;
    }
    info!("Relaying {} for {}", target, peer_id);

    let result = match backend {
        Backend::Tcp(socket) => proxy_conn(stream.compat(), socket).await.map(|_| ()),
        Backend::Udp(socket) => proxy_udp(stream.compat(), socket, UDP_IDLE_TIMEOUT).await,
    };
    match result {
        Ok(()) => debug!("Relay of {} for {} finished", target, peer_id),
        Err(e) => debug!("Relay of {} for {} ended: {}", target, peer_id, e),
    }
}

async fn dial_backend(protocol: &str, ip: &str, port: i32) -> Result<Backend, TunnelError> {
    let protocol: L4Protocol = protocol.parse()?;
    let addr = backend_addr(ip, port)?;

    let mut last_error = None;
    for attempt in 1..=DIAL_ATTEMPTS {
        let result = match protocol {
            L4Protocol::Tcp => dial_tcp(addr).await.map(Backend::Tcp),
            L4Protocol::Udp => dial_udp(addr).await.map(Backend::Udp),
        };
        match result {
            Ok(backend) => return Ok(backend),
            Err(e) => {
                debug!("Dial {}://{} attempt {} failed: {}", protocol, addr, attempt, e);
                last_error = Some(e);
            }
        }
        if protocol == L4Protocol::Tcp && attempt < DIAL_ATTEMPTS {
            sleep(TCP_DIAL_BACKOFF).await;
        }
    }
    Err(last_error.map(TunnelError::Io).unwrap_or(TunnelError::Timeout))
}

fn backend_addr(ip: &str, port: i32) -> Result<SocketAddr, TunnelError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| invalid_input(format!("invalid backend ip {ip:?}")))?;
    let port =
        u16::try_from(port).map_err(|_| invalid_input(format!("invalid backend port {port}")))?;
    Ok(SocketAddr::new(ip, port))
}

fn invalid_input(message: String) -> TunnelError {
    TunnelError::Io(io::Error::new(io::ErrorKind::InvalidInput, message))
}

async fn dial_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    let stream = timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn dial_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let bind = if addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(addr).await?;
    Ok(socket)
}
