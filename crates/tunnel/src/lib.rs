//! EdgeMesh Tunnel
//!
//! Node-to-node tunnel on top of the EdgeMesh network host.
//!
//! ## Features
//!
//! - Deterministic node identities; nodes are addressed by name
//! - Relay bootstrap, relay finder and heartbeat
//! - mDNS and DHT discovery with a name-exchange handshake
//! - Proxy streams: a remote node dials a TCP/UDP backend and relays bytes
//! - Per-peer and global stream limits

mod bootstrap;
mod conn;
mod copy;
mod discovery;
mod finder;
mod limit;
mod peers;
mod proxy;
mod tunnel;

pub use bootstrap::{
    bootstrap_connect, heartbeat_round, Connector, HeartbeatPolicy, RetryPolicy, SharedRelayMap,
};
pub use conn::{StreamAddr, StreamConn};
pub use copy::{proxy_conn, proxy_udp, UDP_CHUNK_SIZE, UDP_IDLE_TIMEOUT};
pub use discovery::HANDSHAKE_TIMEOUT;
pub use finder::{apply_closest_peers, find_relays, FinderUpdate};
pub use limit::{Direction, StreamLimiter, StreamPermit, StreamUsage};
pub use peers::NodePeerMap;
pub use proxy::{
    DIAL_ATTEMPTS, NEGOTIATION_TIMEOUT, REQUEST_TIMEOUT, TCP_CONNECT_TIMEOUT, TCP_DIAL_BACKOFF,
};
pub use tunnel::{EdgeTunnel, ProxyStreamProvider, SharedConfig};
