//! Log emitter: loge records over UDP.
//!
//! [`LogEmitter`] encodes a record into a stack buffer and hands it to a
//! [`UdpTransport`] bound to an ephemeral port. Records can also be encoded
//! ahead of time with `serialize` and sent later with `send_serialized`.

use crate::endpoint::{Endpoint, Family};
use crate::error::Result;
use crate::udp::{UdpConfig, UdpHandle, UdpTransport};
use std::net::{Ipv6Addr, SocketAddr};
use tracing::debug;
use uvx_wire::{Emitter, Level, Payload, MAX_RECORD_SIZE};

/// Default emitter name for log senders
pub const DEFAULT_LOG_NAME: &str = "xlog";

/// Sends loge records to one fixed destination
#[derive(Debug)]
pub struct LogEmitter {
    emitter: Emitter,
    udp: UdpHandle,
    target: SocketAddr,
}

impl LogEmitter {
    /// Bind an ephemeral UDP socket and prepare to send to `target`.
    ///
    /// `name` is checked against the emitter name budget.
    pub async fn start(target: Endpoint, name: &str) -> Result<Self> {
        let emitter = Emitter::new(name)?;
        let bind = match target.family() {
            Family::V4 => Endpoint::unspecified_v4(),
            Family::V6 => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0).into(),
        };
        let config = UdpConfig {
            name: name.to_string(),
            ..Default::default()
        };
        let udp = UdpTransport::start(Some(bind), config, ()).await?;

        Ok(Self {
            emitter,
            udp,
            target: target.socket_addr(),
        })
    }

    /// Destination address
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Local address records are sent from
    pub fn local_addr(&self) -> SocketAddr {
        self.udp.local_addr()
    }

    /// Emitter identity
    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    /// Turn sending on or off. A disabled emitter produces nothing.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.emitter.set_enabled(enabled);
    }

    /// Encode and send a text record; returns the bytes sent (0 when disabled)
    pub fn send(&self, level: Level, tags: &str, msg: &str, file: &str, line: u32) -> Result<usize> {
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let len = self.serialize(&mut buf, level, tags, msg, file, line)?;
        self.send_encoded(&buf[..len])
    }

    /// Encode and send a binary record.
    ///
    /// Returns 0 when disabled or when `data` does not fit in one record.
    pub fn send_binary(
        &self,
        level: Level,
        tags: &str,
        data: &[u8],
        file: &str,
        line: u32,
    ) -> Result<usize> {
        let mut buf = [0u8; MAX_RECORD_SIZE];
        let len = self.serialize_binary(&mut buf, level, tags, data, file, line)?;
        self.send_encoded(&buf[..len])
    }

    /// Encode a text record into `buf` without sending it
    pub fn serialize(
        &self,
        buf: &mut [u8],
        level: Level,
        tags: &str,
        msg: &str,
        file: &str,
        line: u32,
    ) -> Result<usize> {
        Ok(self
            .emitter
            .encode(buf, level, tags, Payload::Text(msg), file, line)?)
    }

    /// Encode a binary record into `buf` without sending it
    pub fn serialize_binary(
        &self,
        buf: &mut [u8],
        level: Level,
        tags: &str,
        data: &[u8],
        file: &str,
        line: u32,
    ) -> Result<usize> {
        Ok(self
            .emitter
            .encode(buf, level, tags, Payload::Binary(data), file, line)?)
    }

    /// Send a record produced by `serialize`
    pub fn send_serialized(&self, record: &[u8]) -> Result<usize> {
        if !self.emitter.enabled() {
            return Ok(0);
        }
        self.send_encoded(record)
    }

    /// Stop the underlying transport
    pub fn shutdown(&self) {
        self.udp.shutdown();
    }

    fn send_encoded(&self, record: &[u8]) -> Result<usize> {
        if record.is_empty() {
            return Ok(0);
        }
        self.udp.send_to(self.target, record)?;
        debug!("[uvx-log] {} sent {} byte record to {}", self.emitter.name(), record.len(), self.target);
        Ok(record.len())
    }
}

/// Format and send a text record, capturing the call site.
///
/// ```ignore
/// loge!(emitter, Level::INFO, "net,conn", "accepted {} peers", n)?;
/// ```
#[macro_export]
macro_rules! loge {
    ($emitter:expr, $level:expr, $tags:expr, $($arg:tt)+) => {
        $emitter.send(
            $level,
            $tags,
            &::std::format!($($arg)+),
            ::std::file!(),
            ::std::line!(),
        )
    };
}

/// Format a text record into a buffer, capturing the call site
#[macro_export]
macro_rules! loge_serialize {
    ($emitter:expr, $buf:expr, $level:expr, $tags:expr, $($arg:tt)+) => {
        $emitter.serialize(
            $buf,
            $level,
            $tags,
            &::std::format!($($arg)+),
            ::std::file!(),
            ::std::line!(),
        )
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::udp::{DatagramFlags, DatagramHandler};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time::timeout;
    use uvx_wire::{shorten_path, LogRecord, HEADER_SIZE};

    struct Collect(mpsc::UnboundedSender<Vec<u8>>);

    impl DatagramHandler for Collect {
        fn on_recv(&mut self, _udp: &UdpHandle, data: &[u8], _from: SocketAddr, _flags: DatagramFlags) {
            let _ = self.0.send(data.to_vec());
        }
    }

    async fn log_server() -> (UdpHandle, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let bind = Endpoint::resolve("127.0.0.1", 0).unwrap();
        let udp = UdpTransport::start(Some(bind), UdpConfig::default(), Collect(tx))
            .await
            .unwrap();
        (udp, rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_loge_macro_delivers_record() {
        let (server, mut rx) = log_server().await;
        let emitter = LogEmitter::start(server.local_addr().into(), "tester")
            .await
            .unwrap();

        let (sent, line) = (loge!(emitter, Level::WARN, "net,io", "lost {} packets", 3).unwrap(), line!());
        let datagram = next(&mut rx).await;
        assert_eq!(sent, datagram.len());

        let record = LogRecord::parse(&datagram).unwrap();
        assert_eq!(record.level(), Level::WARN);
        assert_eq!(record.name().unwrap(), "tester");
        assert_eq!(record.tags().unwrap(), "net,io");
        assert_eq!(record.message().unwrap(), "lost 3 packets");
        assert_eq!(record.file().unwrap(), shorten_path(file!()));
        assert_eq!(record.header().line, line as i32);
        assert_eq!(record.header().pid, std::process::id() as i32);
    }

    #[tokio::test]
    async fn test_serialize_then_send() {
        let (server, mut rx) = log_server().await;
        let emitter = LogEmitter::start(server.local_addr().into(), DEFAULT_LOG_NAME)
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let len = loge_serialize!(emitter, &mut buf, Level::INFO, "", "batched").unwrap();
        assert!(len > HEADER_SIZE);
        assert_eq!(emitter.send_serialized(&buf[..len]).unwrap(), len);

        let datagram = next(&mut rx).await;
        assert_eq!(&datagram[..], &buf[..len]);
        assert_eq!(LogRecord::parse(&datagram).unwrap().message().unwrap(), "batched");
    }

    #[tokio::test]
    async fn test_binary_records() {
        let (server, mut rx) = log_server().await;
        let emitter = LogEmitter::start(server.local_addr().into(), "bin")
            .await
            .unwrap();

        let blob = [0u8, 1, 2, 0, 255];
        assert!(emitter.send_binary(Level::DEBUG, "raw", &blob, file!(), line!()).unwrap() > 0);
        let datagram = next(&mut rx).await;
        assert_eq!(LogRecord::parse(&datagram).unwrap().message_bytes().unwrap(), &blob);

        // too large for a single record: nothing is sent
        let big = vec![7u8; MAX_RECORD_SIZE];
        assert_eq!(emitter.send_binary(Level::DEBUG, "raw", &big, file!(), line!()).unwrap(), 0);
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_emitter_sends_nothing() {
        let (server, mut rx) = log_server().await;
        let mut emitter = LogEmitter::start(server.local_addr().into(), "quiet")
            .await
            .unwrap();
        emitter.set_enabled(false);

        assert_eq!(loge!(emitter, Level::ERROR, "", "dropped").unwrap(), 0);
        let mut buf = [0u8; 128];
        assert_eq!(loge_serialize!(emitter, &mut buf, Level::ERROR, "", "dropped").unwrap(), 0);
        assert_eq!(emitter.send_serialized(&buf).unwrap(), 0);
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

        emitter.set_enabled(true);
        assert!(loge!(emitter, Level::ERROR, "", "back").unwrap() > 0);
        assert_eq!(
            LogRecord::parse(&next(&mut rx).await).unwrap().message().unwrap(),
            "back"
        );
    }

    #[tokio::test]
    async fn test_dropped_emitter_releases_socket() {
        let (server, _rx) = log_server().await;
        let emitter = LogEmitter::start(server.local_addr().into(), "brief")
            .await
            .unwrap();
        let local = emitter.local_addr();
        drop(emitter);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(tokio::net::UdpSocket::bind(local).await.is_ok());
    }

    #[tokio::test]
    async fn test_name_budget_checked() {
        let target = Endpoint::resolve("127.0.0.1", 9).unwrap();
        assert!(LogEmitter::start(target, "a-name-that-is-far-too-long").await.is_err());
    }
}
