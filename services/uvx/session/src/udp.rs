//! Fire-and-forget UDP transport.
//!
//! One task owns the socket. It hands every inbound datagram to the
//! [`DatagramHandler`] and writes queued outbound datagrams. Sends copy the
//! payload, so callers can reuse their buffer as soon as `send_to` returns.

use crate::endpoint::Endpoint;
use crate::error::{Result, SessionError};
use bitflags::bitflags;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default transport name used in log lines
pub const DEFAULT_UDP_NAME: &str = "xudp";

bitflags! {
    /// Per-datagram receive flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DatagramFlags: u32 {
        /// The datagram filled the receive buffer and may have been cut short
        const PARTIAL = 0x01;
    }
}

/// Configuration for a [`UdpTransport`]
#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// Name used in log lines
    pub name: String,
    /// Size of the receive buffer; longer datagrams are truncated
    pub recv_buffer_size: usize,
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_UDP_NAME.to_string(),
            recv_buffer_size: 64 * 1024,
        }
    }
}

/// Receives datagrams. Runs on the transport task and must not block.
#[allow(unused_variables)]
pub trait DatagramHandler: Send + 'static {
    /// One datagram arrived from `from`
    fn on_recv(&mut self, udp: &UdpHandle, data: &[u8], from: SocketAddr, flags: DatagramFlags) {}
}

/// Ignores everything it receives
impl DatagramHandler for () {}

/// Handle to a running UDP transport
#[derive(Clone, Debug)]
pub struct UdpHandle {
    name: Arc<str>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    outbound: mpsc::UnboundedSender<(Bytes, SocketAddr)>,
    shutdown: mpsc::UnboundedSender<()>,
}

impl UdpHandle {
    /// Transport name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound local address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Queue a copy of `data` for `to`
    pub fn send_to(&self, to: SocketAddr, data: &[u8]) -> Result<()> {
        self.outbound
            .send((Bytes::copy_from_slice(data), to))
            .map_err(|_| SessionError::Closed("udp transport"))
    }

    /// Queue a copy of `data` for a textual address
    pub fn send_to_ip(&self, ip: &str, port: u16, data: &[u8]) -> Result<()> {
        let to = Endpoint::resolve(ip, port)?;
        self.send_to(to.socket_addr(), data)
    }

    /// Allow or forbid sending to broadcast addresses
    pub fn set_broadcast(&self, on: bool) -> Result<()> {
        self.socket.set_broadcast(on)?;
        Ok(())
    }

    /// Stop receiving and sending. Queued datagrams are dropped.
    ///
    /// Dropping the last handle has the same effect.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn downgrade(&self) -> WeakUdpHandle {
        WeakUdpHandle {
            name: self.name.clone(),
            socket: self.socket.clone(),
            local_addr: self.local_addr,
            outbound: self.outbound.downgrade(),
            shutdown: self.shutdown.downgrade(),
        }
    }
}

/// The transport task's view of its handle; does not keep it alive
struct WeakUdpHandle {
    name: Arc<str>,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    outbound: mpsc::WeakUnboundedSender<(Bytes, SocketAddr)>,
    shutdown: mpsc::WeakUnboundedSender<()>,
}

impl WeakUdpHandle {
    fn upgrade(&self) -> Option<UdpHandle> {
        Some(UdpHandle {
            name: self.name.clone(),
            socket: self.socket.clone(),
            local_addr: self.local_addr,
            outbound: self.outbound.upgrade()?,
            shutdown: self.shutdown.upgrade()?,
        })
    }
}

/// UDP transport entry point
pub struct UdpTransport;

impl UdpTransport {
    /// Bind and start receiving.
    ///
    /// With no endpoint the socket binds `0.0.0.0` on an ephemeral port,
    /// which suits a send-mostly client.
    pub async fn start<H: DatagramHandler>(
        bind: Option<Endpoint>,
        config: UdpConfig,
        handler: H,
    ) -> Result<UdpHandle> {
        let addr = bind.unwrap_or_else(Endpoint::unspecified_v4).socket_addr();
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| SessionError::Bind { addr, source })?;
        let local_addr = socket.local_addr()?;
        info!("[uvx-udp] {} bound to {}", config.name, local_addr);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let handle = UdpHandle {
            name: Arc::from(config.name.as_str()),
            socket: Arc::new(socket),
            local_addr,
            outbound: outbound_tx,
            shutdown: shutdown_tx,
        };

        tokio::spawn(run(
            config,
            handler,
            handle.downgrade(),
            outbound_rx,
            shutdown_rx,
        ));
        Ok(handle)
    }
}

async fn run<H: DatagramHandler>(
    config: UdpConfig,
    mut handler: H,
    handle: WeakUdpHandle,
    mut outbound: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
    mut shutdown: mpsc::UnboundedReceiver<()>,
) {
    let socket = handle.socket.clone();
    let mut buf = vec![0u8; config.recv_buffer_size.max(1)];

    loop {
        tokio::select! {
            // an explicit shutdown, or the last handle was dropped
            _ = shutdown.recv() => break,

            Some((data, to)) = outbound.recv() => {
                match socket.send_to(&data, to).await {
                    Ok(n) if n < data.len() => {
                        warn!("[uvx-udp] {} short send to {}: {} of {} bytes", config.name, to, n, data.len());
                    }
                    Ok(_) => {}
                    Err(e) => warn!("[uvx-udp] {} send to {} failed: {}", config.name, to, e),
                }
            }

            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    let mut flags = DatagramFlags::empty();
                    if n == buf.len() {
                        flags |= DatagramFlags::PARTIAL;
                    }
                    let Some(handle) = handle.upgrade() else {
                        break;
                    };
                    handler.on_recv(&handle, &buf[..n], from, flags);
                }
                Err(e) => warn!("[uvx-udp] {} receive error: {}", config.name, e),
            },
        }
    }

    debug!("[uvx-udp] {} shut down", config.name);
}
