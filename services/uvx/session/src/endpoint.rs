//! Textual address resolution.

use crate::error::{Result, SessionError};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Address family of an [`Endpoint`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    /// IPv4
    V4,
    /// IPv6
    V6,
}

/// Resolved bind or connect target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    addr: SocketAddr,
}

impl Endpoint {
    /// Resolve a textual IP and port.
    ///
    /// An address containing `:` is parsed as IPv6 (surrounding brackets are
    /// accepted), anything else as dotted IPv4. No name lookup is done.
    pub fn resolve(ip: &str, port: u16) -> Result<Self> {
        let text = ip.trim();
        let parsed = if text.contains(':') {
            let bare = text.trim_start_matches('[').trim_end_matches(']');
            bare.parse::<Ipv6Addr>().ok().map(IpAddr::V6)
        } else {
            text.parse::<Ipv4Addr>().ok().map(IpAddr::V4)
        };

        match parsed {
            Some(ip) => Ok(Self {
                addr: SocketAddr::new(ip, port),
            }),
            None => Err(SessionError::Resolve {
                addr: ip.to_string(),
                port,
            }),
        }
    }

    /// `0.0.0.0:0`, binds to any interface on an ephemeral port
    pub fn unspecified_v4() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
        }
    }

    /// Socket address form
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Address family
    pub fn family(&self) -> Family {
        match self.addr {
            SocketAddr::V4(_) => Family::V4,
            SocketAddr::V6(_) => Family::V6,
        }
    }

    /// IP part
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    /// Port part
    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl From<Endpoint> for SocketAddr {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.addr
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SocketAddr already brackets IPv6
        write!(f, "{}", self.addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_v4() {
        let ep = Endpoint::resolve("127.0.0.1", 8080).unwrap();
        assert_eq!(ep.family(), Family::V4);
        assert_eq!(ep.port(), 8080);
        assert_eq!(ep.to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_resolve_v6() {
        let ep = Endpoint::resolve("::1", 9000).unwrap();
        assert_eq!(ep.family(), Family::V6);
        assert_eq!(ep.to_string(), "[::1]:9000");

        let bracketed = Endpoint::resolve("[fe80::1]", 1).unwrap();
        assert_eq!(bracketed.family(), Family::V6);
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(matches!(
            Endpoint::resolve("localhost", 80),
            Err(SessionError::Resolve { port: 80, .. })
        ));
        assert!(Endpoint::resolve("1.2.3", 80).is_err());
        assert!(Endpoint::resolve(":::", 80).is_err());
    }

    #[test]
    fn test_unspecified() {
        let ep = Endpoint::unspecified_v4();
        assert!(ep.ip().is_unspecified());
        assert_eq!(ep.port(), 0);
        assert_eq!(SocketAddr::from(ep), ep.socket_addr());
    }
}
