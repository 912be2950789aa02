//! Tunnel stream protocols
//!
//! Two request/response protocols run over libp2p streams:
//! - Discovery: one CONNECT/SUCCESS exchange that maps a node name to a peer ID
//! - Proxy: one CONNECT/SUCCESS|FAILED exchange, after which the stream carries
//!   raw application bytes
//!
//! Every message is framed as `[u32 big-endian length][bincode payload]`.

use std::io;

use edgemesh_core::DiscoveryKind;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::StreamProtocol;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Discovery handshake protocol
pub const DISCOVERY_PROTOCOL: StreamProtocol =
    StreamProtocol::new("/libp2p/tunnel-discovery/1.0.0");

/// Proxy negotiation protocol
pub const PROXY_PROTOCOL: StreamProtocol = StreamProtocol::new("/libp2p/tunnel-proxy/1.0.0");

/// Largest accepted frame payload
pub const MAX_MESSAGE_SIZE: usize = 4096;

/// Discovery message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryType {
    Connect,
    Success,
}

/// Discovery handshake message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryMessage {
    pub msg_type: DiscoveryType,
    /// How the initiator found the responder
    pub protocol: DiscoveryKind,
    /// Node name of the sender
    pub node_name: String,
}

impl DiscoveryMessage {
    pub fn connect(kind: DiscoveryKind, node_name: impl Into<String>) -> Self {
        Self {
            msg_type: DiscoveryType::Connect,
            protocol: kind,
            node_name: node_name.into(),
        }
    }

    pub fn success(kind: DiscoveryKind, node_name: impl Into<String>) -> Self {
        Self {
            msg_type: DiscoveryType::Success,
            protocol: kind,
            node_name: node_name.into(),
        }
    }
}

/// Proxy message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyType {
    Connect,
    Success,
    Failed,
}

/// Proxy negotiation message
///
/// `protocol` stays a string on the wire so that an unknown protocol is
/// answered with FAILED instead of being a decode error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyMessage {
    pub msg_type: ProxyType,
    pub protocol: String,
    pub node_name: String,
    pub ip: String,
    pub port: i32,
}

impl ProxyMessage {
    pub fn connect(
        protocol: impl Into<String>,
        node_name: impl Into<String>,
        ip: impl Into<String>,
        port: i32,
    ) -> Self {
        Self {
            msg_type: ProxyType::Connect,
            protocol: protocol.into(),
            node_name: node_name.into(),
            ip: ip.into(),
            port,
        }
    }

    /// Reply to this request with `msg_type`, echoing the target
    pub fn reply(&self, msg_type: ProxyType) -> Self {
        Self {
            msg_type,
            ..self.clone()
        }
    }
}

/// Write one framed message
pub async fn write_message<W, M>(writer: &mut W, message: &M) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let payload =
        bincode::serialize(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("message of {} bytes exceeds {}", payload.len(), MAX_MESSAGE_SIZE),
        ));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await
}

/// Read one framed message
pub async fn read_message<R, M>(reader: &mut R) -> io::Result<M>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_MESSAGE_SIZE}"),
        ));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;

    #[test]
    fn test_protocol_ids() {
        assert_eq!(DISCOVERY_PROTOCOL.as_ref(), "/libp2p/tunnel-discovery/1.0.0");
        assert_eq!(PROXY_PROTOCOL.as_ref(), "/libp2p/tunnel-proxy/1.0.0");
    }

    #[tokio::test]
    async fn test_discovery_message_over_stream() {
        let mut buf = Cursor::new(Vec::new());
        let msg = DiscoveryMessage::connect(DiscoveryKind::Dht, "edge-1");
        write_message(&mut buf, &msg).await.unwrap();

        let bytes = buf.into_inner();
        let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        assert_eq!(len, bytes.len() - 4);

        let mut reader = Cursor::new(bytes);
        let decoded: DiscoveryMessage = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn test_proxy_reply_echoes_target() {
        let req = ProxyMessage::connect("udp", "edge-2", "10.0.0.9", 53);
        let failed = req.reply(ProxyType::Failed);
        assert_eq!(failed.msg_type, ProxyType::Failed);
        assert_eq!(failed.ip, "10.0.0.9");
        assert_eq!(failed.port, 53);

        let mut buf = Cursor::new(Vec::new());
        write_message(&mut buf, &failed).await.unwrap();
        let mut reader = Cursor::new(buf.into_inner());
        let decoded: ProxyMessage = read_message(&mut reader).await.unwrap();
        assert_eq!(decoded, failed);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let mut bytes = ((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes().to_vec();
        bytes.extend(vec![0u8; MAX_MESSAGE_SIZE + 1]);
        let mut reader = Cursor::new(bytes);
        let err = read_message::<_, ProxyMessage>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_oversized_message_not_written() {
        let msg = DiscoveryMessage::connect(DiscoveryKind::Mdns, "n".repeat(MAX_MESSAGE_SIZE));
        let mut buf = Cursor::new(Vec::new());
        let err = write_message(&mut buf, &msg).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(buf.into_inner().is_empty());
    }

    #[tokio::test]
    async fn test_truncated_frame_is_error() {
        let mut bytes = 10u32.to_be_bytes().to_vec();
        bytes.extend([1u8, 2, 3]);
        let mut reader = Cursor::new(bytes);
        let err = read_message::<_, DiscoveryMessage>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn test_wrong_message_type_is_error() {
        let mut buf = Cursor::new(Vec::new());
        write_message(&mut buf, &0xffu8).await.unwrap();
        let mut reader = Cursor::new(buf.into_inner());
        assert!(read_message::<_, ProxyMessage>(&mut reader).await.is_err());
    }
}
