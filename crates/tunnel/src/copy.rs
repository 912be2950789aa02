//! Byte relays between a proxy stream and a backend socket

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tracing::debug;

/// Largest stream read forwarded as one datagram
pub const UDP_CHUNK_SIZE: usize = 4096;

/// A UDP relay with no traffic in either direction for this long is closed
pub const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_DATAGRAM_SIZE: usize = 65535;

/// Copy bytes both ways until either direction ends, then shut down both
/// write halves. Returns bytes copied `(a -> b, b -> a)` for the direction
/// that finished; the other is reported as 0.
pub async fn proxy_conn<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let result = tokio::select! {
        r = tokio::io::copy(&mut a_read, &mut b_write) => r.map(|n| (n, 0)),
        r = tokio::io::copy(&mut b_read, &mut a_write) => r.map(|n| (0, n)),
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;
    result
}

/// Forward stream chunks as datagrams on a connected `socket`, and datagrams
/// back as stream writes, until the stream ends or `idle` passes quietly.
pub async fn proxy_udp<S>(stream: S, socket: UdpSocket, idle: Duration) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut chunk = vec![0u8; UDP_CHUNK_SIZE];
    let mut datagram = vec![0u8; MAX_DATAGRAM_SIZE];

    let result = loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                let n = match read {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                if let Err(e) = socket.send(&chunk[..n]).await {
                    break Err(e);
                }
            }
            recv = socket.recv(&mut datagram) => {
                let n = match recv {
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                if let Err(e) = writer.write_all(&datagram[..n]).await {
                    break Err(e);
                }
            }
            _ = tokio::time::sleep(idle) => {
                debug!("UDP relay idle for {:?}, closing", idle);
                break Ok(());
            }
        }
    };

    let _ = writer.shutdown().await;
    result
}
