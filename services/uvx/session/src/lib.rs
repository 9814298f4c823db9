//! TCP/UDP sessions and the loge log emitter for uvx.
//!
//! This crate provides the event-driven connection layer: a TCP server
//! that tracks connections and evicts idle ones, a TCP client that
//! reconnects on its heartbeat, a UDP transport, and a log emitter that
//! sends loge records over UDP.
//!
//! ## Features
//!
//! - **TCP Server**: connection table in recency order, heartbeat, idle eviction
//! - **TCP Client**: one timer for heartbeat and reconnect
//! - **UDP Transport**: copy-on-send datagrams with a receive callback
//! - **Log Emitter**: `loge!` records to a fixed destination
//!
//! Every component runs as a single tokio task and invokes its handler
//! from that task only.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use uvx_session::{Connection, Endpoint, ServerConfig, ServerHandler, TcpServer};
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_recv(&mut self, conn: &Arc<Connection>, data: &[u8]) {
//!         let _ = conn.send(data);
//!     }
//! }
//!
//! # async fn example() -> uvx_session::Result<()> {
//! let bind = Endpoint::resolve("0.0.0.0", 9000)?;
//! let server = TcpServer::start(bind, ServerConfig::default(), Echo)?;
//! println!("listening on {}", server.local_addr());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod client;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod log;
pub mod server;
pub mod transport;
pub mod udp;

// Re-export main types
pub use client::{ClientConfig, ClientHandle, ClientHandler, ClientState, TcpClient};
pub use connection::{ConnId, Connection, ConnectionTable};
pub use endpoint::{Endpoint, Family};
pub use error::{Result, SessionError};
pub use log::{LogEmitter, DEFAULT_LOG_NAME};
pub use server::{ServerConfig, ServerHandle, ServerHandler, TcpServer};
pub use transport::{connect_tcp, listen_tcp, Dialer, TcpDialer};
pub use udp::{DatagramFlags, DatagramHandler, UdpConfig, UdpHandle, UdpTransport};

pub use uvx_wire::Level;
