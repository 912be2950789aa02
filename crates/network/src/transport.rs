//! Base transports
//!
//! TCP and WebSocket connections optionally pass through the private network
//! handshake before noise and yamux. QUIC brings its own security and
//! multiplexing and cannot be combined with a pre-shared key.

use std::error::Error;
use std::time::Duration;

use edgemesh_core::TransportKind;
use futures::{AsyncRead, AsyncWrite};
use libp2p::core::muxing::StreamMuxerBox;
use libp2p::core::transport::{Boxed, Transport};
use libp2p::core::upgrade::Version;
use libp2p::identity::Keypair;
use libp2p::pnet::{PnetConfig, PreSharedKey};
use libp2p::{noise, quic, tcp, websocket, yamux, PeerId};

/// Upper bound on the security and muxer negotiation of a new connection
pub const UPGRADE_TIMEOUT: Duration = Duration::from_secs(20);

pub type BoxError = Box<dyn Error + Send + Sync>;

/// Build the authenticated, multiplexed base transport for `kind`
pub fn build_transport(
    keypair: &Keypair,
    kind: TransportKind,
    psk: Option<PreSharedKey>,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, BoxError> {
    match kind {
        TransportKind::Tcp => upgrade(tcp_transport(), keypair, psk),
        TransportKind::Ws => upgrade(websocket::Config::new(tcp_transport()), keypair, psk),
        TransportKind::Quic => {
            if psk.is_some() {
                return Err("QUIC cannot be used with a pre-shared key".into());
            }
            Ok(quic::tokio::Transport::new(quic::Config::new(keypair))
                .map(|(peer_id, conn), _| (peer_id, StreamMuxerBox::new(conn)))
                .boxed())
        }
    }
}

fn tcp_transport() -> tcp::tokio::Transport {
    tcp::tokio::Transport::new(tcp::Config::default().nodelay(true))
}

fn upgrade<T>(
    transport: T,
    keypair: &Keypair,
    psk: Option<PreSharedKey>,
) -> Result<Boxed<(PeerId, StreamMuxerBox)>, BoxError>
where
    T: Transport + Send + Unpin + 'static,
    T::Output: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    T::Error: Send + Sync + 'static,
    T::Dial: Send + 'static,
    T::ListenerUpgrade: Send + 'static,
{
    let noise = noise::Config::new(keypair)?;
    let transport = match psk {
        Some(psk) => transport
            .and_then(move |socket, _| PnetConfig::new(psk).handshake(socket))
            .upgrade(Version::V1Lazy)
            .authenticate(noise)
            .multiplex(yamux::Config::default())
            .timeout(UPGRADE_TIMEOUT)
            .boxed(),
        None => transport
            .upgrade(Version::V1Lazy)
            .authenticate(noise)
            .multiplex(yamux::Config::default())
            .timeout(UPGRADE_TIMEOUT)
            .boxed(),
    };
    Ok(transport)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgemesh_keystore::generate_psk;

    #[tokio::test]
    async fn test_quic_with_psk_is_rejected() {
        let keypair = Keypair::generate_ed25519();
        assert!(build_transport(&keypair, TransportKind::Quic, Some(generate_psk())).is_err());
    }

    #[tokio::test]
    async fn test_all_kinds_build() {
        let keypair = Keypair::generate_ed25519();
        assert!(build_transport(&keypair, TransportKind::Tcp, None).is_ok());
        assert!(build_transport(&keypair, TransportKind::Tcp, Some(generate_psk())).is_ok());
        assert!(build_transport(&keypair, TransportKind::Ws, Some(generate_psk())).is_ok());
        assert!(build_transport(&keypair, TransportKind::Quic, None).is_ok());
    }
}
