//! Session layer error types.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use uvx_wire::WireError;

/// Result alias used throughout the session crate
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors raised by endpoints, transports and sessions
#[derive(Error, Debug)]
pub enum SessionError {
    /// Textual address could not be parsed
    #[error("cannot resolve address {addr:?} (port {port})")]
    Resolve {
        /// Address text as given
        addr: String,
        /// Port as given
        port: u16,
    },

    /// Socket could not be bound
    #[error("bind {addr} failed: {source}")]
    Bind {
        /// Requested local address
        addr: SocketAddr,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Listener could not be started
    #[error("listen on {addr} failed: {source}")]
    Listen {
        /// Requested local address
        addr: SocketAddr,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Any other socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The component or connection has already shut down
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Record could not be encoded
    #[error(transparent)]
    Wire(#[from] WireError),
}
