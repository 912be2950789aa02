use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Handshake failed with {peer}: {reason}")]
    HandshakeFailed { peer: String, reason: String },

    #[error("Proxy to {target} on node {node_name} was rejected")]
    ProxyRejected { node_name: String, target: String },

    #[error("Unsupported protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Stream limit exceeded: {0}")]
    StreamLimitExceeded(String),

    #[error("Bootstrap incomplete: {failed} relay(s) unreachable")]
    BootstrapIncomplete { failed: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel is shut down")]
    Shutdown,

    #[error("Timeout")]
    Timeout,
}

pub type Result<T> = std::result::Result<T, TunnelError>;
