//! Stream-to-connection adapter
//!
//! [`StreamConn`] lets a negotiated proxy stream stand in for a plain socket:
//! tokio `AsyncRead`/`AsyncWrite`, plus local and remote logical addresses.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use libp2p::{Multiaddr, PeerId, Stream, StreamProtocol};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};

use crate::limit::StreamPermit;

/// Logical address of one end of a stream
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamAddr {
    network: String,
    addr: String,
}

impl StreamAddr {
    pub fn new(protocol: &StreamProtocol, addr: &Multiaddr) -> Self {
        Self {
            network: protocol.to_string(),
            addr: addr.to_string(),
        }
    }

    /// Protocol id the stream was negotiated on
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Multiaddress of this end of the underlying connection
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

impl fmt::Display for StreamAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.addr)
    }
}

/// A proxy stream that behaves like a connected socket
pub struct StreamConn {
    inner: Compat<Stream>,
    peer_id: PeerId,
    local: StreamAddr,
    remote: StreamAddr,
    _permit: Option<StreamPermit>,
}

impl StreamConn {
    pub fn new(
        stream: Stream,
        peer_id: PeerId,
        protocol: &StreamProtocol,
        local: &Multiaddr,
        remote: &Multiaddr,
        permit: Option<StreamPermit>,
    ) -> Self {
        Self {
            inner: stream.compat(),
            peer_id,
            local: StreamAddr::new(protocol, local),
            remote: StreamAddr::new(protocol, remote),
            _permit: permit,
        }
    }

    pub fn local_addr(&self) -> &StreamAddr {
        &self.local
    }

    pub fn remote_addr(&self) -> &StreamAddr {
        &self.remote
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }
}

impl fmt::Debug for StreamConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamConn")
            .field("peer_id", &self.peer_id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

impl AsyncRead for StreamConn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for StreamConn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
