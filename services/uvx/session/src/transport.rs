//! TCP transport helpers shared by the server and the client.
//!
//! This module provides listener and dialer setup plus the per-connection
//! I/O loop that moves bytes between a socket and its owning actor.

use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::debug;

/// Size of the per-connection read buffer
pub const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Create a TCP listener bound to the given address with an explicit backlog
pub fn listen_tcp(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Connect to a TCP address
pub async fn connect_tcp(addr: SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr).await
}

/// Opens outbound TCP streams for the client reconnector
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    /// Open a stream to `addr`
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream>;
}

/// Plain TCP dialer
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: SocketAddr) -> io::Result<TcpStream> {
        connect_tcp(addr).await
    }
}

/// Why a stream's I/O loop stopped
#[derive(Debug)]
pub(crate) enum StreamEnd {
    /// The owner asked for the stream to close
    Stopped,
    /// Peer closed its side
    Eof,
    /// Read or write failed
    Failed(io::Error),
    /// The owner is gone and will never consume reads
    Abandoned,
}

/// Move bytes between `stream` and its owner until one side gives up.
///
/// Reads are handed to `on_read`, which returns `false` once the owner can
/// no longer accept them. Each outbound buffer is dropped as soon as its
/// write completes. The stream itself is left open for the caller to close.
pub(crate) async fn pump_stream<F>(
    stream: &mut TcpStream,
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
    stop: &Notify,
    mut on_read: F,
) -> StreamEnd
where
    F: FnMut(Bytes) -> bool,
{
    let (mut reader, mut writer) = stream.split();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        tokio::select! {
            biased;

            _ = stop.notified() => return StreamEnd::Stopped,

            Some(data) = outbound.recv() => {
                if let Err(e) = writer.write_all(&data).await {
                    return StreamEnd::Failed(e);
                }
            }

            read = reader.read(&mut buf) => match read {
                Ok(0) => return StreamEnd::Eof,
                Ok(n) => {
                    if !on_read(Bytes::copy_from_slice(&buf[..n])) {
                        return StreamEnd::Abandoned;
                    }
                }
                Err(e) => return StreamEnd::Failed(e),
            },
        }
    }
}

/// Flush and close the write side, ignoring errors from an already dead peer
pub(crate) async fn close_stream(mut stream: TcpStream) {
    if let Err(e) = stream.shutdown().await {
        debug!("shutdown after close: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_tcp_listen_connect() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr, 16).unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let stream = TcpDialer.dial(bound_addr).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), bound_addr);
    }

    #[tokio::test]
    async fn test_pump_echoes_and_reports_eof() {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = listen_tcp(addr, 16).unwrap();
        let bound_addr = listener.local_addr().unwrap();

        let mut peer = connect_tcp(bound_addr).await.unwrap();
        let (mut stream, _) = listener.accept().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let pump = tokio::spawn(async move {
            pump_stream(&mut stream, &mut rx, &stop, |data| seen_tx.send(data).is_ok()).await
        });

        peer.write_all(b"ping").await.unwrap();
        assert_eq!(&seen_rx.recv().await.unwrap()[..], b"ping");

        tx.send(Bytes::from_static(b"pong")).unwrap();
        let mut reply = [0u8; 4];
        peer.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"pong");

        drop(peer);
        assert!(matches!(pump.await.unwrap(), StreamEnd::Eof));
    }
}
