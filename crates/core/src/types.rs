use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TunnelError;

/// Layer-4 protocol a proxy stream is bridged to on the remote node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum L4Protocol {
    Tcp,
    Udp,
}

impl L4Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Udp => "udp",
        }
    }
}

impl fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for L4Protocol {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "udp" => Ok(Self::Udp),
            other => Err(TunnelError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// How a peer was found before the discovery handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryKind {
    /// Local-network multicast discovery
    #[serde(rename = "MDNS")]
    Mdns,
    /// Wide-area discovery through the DHT
    #[serde(rename = "DHT")]
    Dht,
}

impl DiscoveryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mdns => "MDNS",
            Self::Dht => "DHT",
        }
    }
}

impl fmt::Display for DiscoveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target of a proxy stream: which backend the remote node should dial
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyOptions {
    /// Protocol tag carried on the wire ("tcp" / "udp")
    pub protocol: String,
    /// Node that owns the backend
    pub node_name: String,
    /// Backend IP as seen from that node
    pub ip: String,
    /// Backend port
    pub port: i32,
}

impl ProxyOptions {
    pub fn new(
        protocol: impl Into<String>,
        node_name: impl Into<String>,
        ip: impl Into<String>,
        port: i32,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            node_name: node_name.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Backend address in `proto://ip:port` form, for logs and errors
    pub fn target(&self) -> String {
        format!("{}://{}:{}", self.protocol, self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l4_protocol_parse() {
        assert_eq!("tcp".parse::<L4Protocol>().unwrap(), L4Protocol::Tcp);
        assert_eq!("udp".parse::<L4Protocol>().unwrap(), L4Protocol::Udp);
        assert!(matches!(
            "sctp".parse::<L4Protocol>(),
            Err(TunnelError::UnsupportedProtocol(p)) if p == "sctp"
        ));
    }

    #[test]
    fn test_l4_protocol_is_case_sensitive() {
        assert!("TCP".parse::<L4Protocol>().is_err());
    }

    #[test]
    fn test_discovery_kind_tags() {
        assert_eq!(DiscoveryKind::Mdns.to_string(), "MDNS");
        assert_eq!(DiscoveryKind::Dht.to_string(), "DHT");
        let json = serde_json::to_string(&DiscoveryKind::Dht).unwrap();
        assert_eq!(json, "\"DHT\"");
    }

    #[test]
    fn test_proxy_options_target() {
        let opts = ProxyOptions::new("tcp", "node-a", "10.0.0.5", 8080);
        assert_eq!(opts.target(), "tcp://10.0.0.5:8080");
        assert_eq!(opts.node_name, "node-a");
    }
}
