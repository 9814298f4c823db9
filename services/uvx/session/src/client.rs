//! TCP client with automatic reconnection.
//!
//! A client owns one outbound connection and one interval timer. The timer
//! has two jobs depending on state: while connected each tick is a
//! heartbeat, while disconnected each tick is a reconnect attempt. Ticks
//! during a pending connect are ignored. There is never more than one
//! connect attempt per heartbeat interval.
//!
//! ```text
//! Disconnected -> Connecting -> Connected -> Closing -> Disconnected
//!                     |                                     ^
//!                     +------------- connect failed --------+
//! ```

use crate::connection::lock;
use crate::endpoint::Endpoint;
use crate::error::{Result, SessionError};
use crate::transport::{close_stream, pump_stream, Dialer, StreamEnd, TcpDialer};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default client name used in log lines
pub const DEFAULT_CLIENT_NAME: &str = "xclient";

/// Configuration for a [`TcpClient`]
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Name used in log lines
    pub name: String,
    /// Reconnect on heartbeat ticks after the connection drops
    pub auto_connect: bool,
    /// Heartbeat and reconnect period; zero disables the timer
    pub heartbeat_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_CLIENT_NAME.to_string(),
            auto_connect: true,
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Connection state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No socket; the next tick may reconnect
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Connected and reading
    Connected,
    /// Close in progress
    Closing,
}

/// Client callbacks. Every method is optional.
///
/// Callbacks run on the client task and must not block.
#[allow(unused_variables)]
pub trait ClientHandler: Send + 'static {
    /// Connected to the server
    fn on_connect_ok(&mut self, client: &ClientHandle) {}
    /// A connect attempt failed; closing and closed callbacks follow
    fn on_connect_fail(&mut self, client: &ClientHandle, error: &io::Error) {}
    /// Bytes were read from the server
    fn on_recv(&mut self, client: &ClientHandle, data: &[u8]) {}
    /// The connection is about to be closed
    fn on_connection_closing(&mut self, client: &ClientHandle) {}
    /// The connection has closed
    fn on_connection_closed(&mut self, client: &ClientHandle) {}
    /// Heartbeat tick while connected. `index` counts from zero.
    fn on_heartbeat(&mut self, client: &ClientHandle, index: u64) {}
}

#[derive(Debug)]
struct Shared {
    state: Mutex<ClientState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
}

/// Handle to a running client
#[derive(Clone, Debug)]
pub struct ClientHandle {
    name: Arc<str>,
    target: SocketAddr,
    shared: Arc<Shared>,
    shutdown: mpsc::UnboundedSender<()>,
}

impl ClientHandle {
    /// Client name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server address
    pub fn target(&self) -> SocketAddr {
        self.target
    }

    /// Current state
    pub fn state(&self) -> ClientState {
        *lock(&self.shared.state)
    }

    /// Whether the client is connected
    pub fn is_connected(&self) -> bool {
        self.state() == ClientState::Connected
    }

    /// Queue a copy of `data` for the server
    pub fn send(&self, data: &[u8]) -> Result<()> {
        match lock(&self.shared.outbound).as_ref() {
            Some(tx) => tx
                .send(Bytes::copy_from_slice(data))
                .map_err(|_| SessionError::Closed("client connection")),
            None => Err(SessionError::Closed("client connection")),
        }
    }

    /// Close the connection and stop reconnecting.
    ///
    /// A live connection still goes through the closing and closed callbacks.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    fn set_state(&self, state: ClientState) {
        *lock(&self.shared.state) = state;
    }
}

/// TCP client entry point
pub struct TcpClient;

impl TcpClient {
    /// Start connecting to `target` over plain TCP
    pub fn connect<H: ClientHandler>(
        target: Endpoint,
        config: ClientConfig,
        handler: H,
    ) -> ClientHandle {
        Self::connect_with(TcpDialer, target, config, handler)
    }

    /// Start connecting to `target` using `dialer` for every attempt.
    ///
    /// The first attempt starts immediately; the timer's first tick comes
    /// one full interval later. The client keeps running until
    /// [`ClientHandle::shutdown`] is called.
    pub fn connect_with<D: Dialer, H: ClientHandler>(
        dialer: D,
        target: Endpoint,
        config: ClientConfig,
        handler: H,
    ) -> ClientHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let handle = ClientHandle {
            name: Arc::from(config.name.as_str()),
            target: target.socket_addr(),
            shared: Arc::new(Shared {
                state: Mutex::new(ClientState::Disconnected),
                outbound: Mutex::new(None),
            }),
            shutdown: shutdown_tx,
        };

        let heartbeat = (!config.heartbeat_interval.is_zero()).then(|| {
            let period = config.heartbeat_interval;
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        let actor = ClientActor {
            config,
            handler,
            dialer: Arc::new(dialer),
            handle: handle.clone(),
            events_tx,
            attempt: 0,
            stop: None,
            heartbeat_index: 0,
            stopping: false,
        };
        tokio::spawn(actor.run(heartbeat, shutdown_rx, events_rx));

        handle
    }
}

#[derive(Debug)]
enum ClientEvent {
    Connected(u64, TcpStream),
    ConnectFailed(u64, io::Error),
    Read(u64, Bytes),
    ReadFailed(u64, Option<io::Error>),
    Closed(u64),
}

struct ClientActor<H, D> {
    config: ClientConfig,
    handler: H,
    dialer: Arc<D>,
    handle: ClientHandle,
    events_tx: mpsc::UnboundedSender<ClientEvent>,
    attempt: u64,
    stop: Option<Arc<Notify>>,
    heartbeat_index: u64,
    stopping: bool,
}

impl<H: ClientHandler, D: Dialer> ClientActor<H, D> {
    async fn run(
        mut self,
        mut heartbeat: Option<Interval>,
        mut shutdown: mpsc::UnboundedReceiver<()>,
        mut events: mpsc::UnboundedReceiver<ClientEvent>,
    ) {
        self.start_connect();

        loop {
            tokio::select! {
                _ = shutdown.recv(), if !self.stopping => {
                    self.stopping = true;
                    match self.handle.state() {
                        ClientState::Connected => self.close(),
                        ClientState::Closing => {}
                        ClientState::Disconnected | ClientState::Connecting => break,
                    }
                }

                Some(event) = events.recv() => {
                    self.handle_event(event);
                    if self.stopping && self.handle.state() == ClientState::Disconnected {
                        break;
                    }
                }

                _ = async {
                    match heartbeat.as_mut() {
                        Some(timer) => timer.tick().await,
                        None => std::future::pending().await,
                    }
                } => self.on_tick(),
            }
        }

        self.handle.set_state(ClientState::Disconnected);
        info!("[uvx-client] {} stopped", self.config.name);
    }

    fn start_connect(&mut self) {
        self.attempt += 1;
        let attempt = self.attempt;
        let target = self.handle.target();
        self.handle.set_state(ClientState::Connecting);
        info!("[uvx-client] {} connecting to {} ...", self.config.name, target);

        let dialer = self.dialer.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let event = match dialer.dial(target).await {
                Ok(stream) => ClientEvent::Connected(attempt, stream),
                Err(e) => ClientEvent::ConnectFailed(attempt, e),
            };
            let _ = events.send(event);
        });
    }

    fn on_tick(&mut self) {
        match self.handle.state() {
            ClientState::Connected => {
                let index = self.heartbeat_index;
                self.heartbeat_index += 1;
                debug!("[uvx-client] {} on heartbeat (index {})", self.config.name, index);
                self.handler.on_heartbeat(&self.handle, index);
            }
            ClientState::Disconnected if self.config.auto_connect && !self.stopping => {
                self.start_connect();
            }
            _ => {}
        }
    }

    fn handle_event(&mut self, event: ClientEvent) {
        match event {
            ClientEvent::Connected(attempt, stream) if attempt == self.attempt => {
                if self.stopping {
                    self.handle.set_state(ClientState::Disconnected);
                    return;
                }
                info!("[uvx-client] {} connected to {}", self.config.name, self.handle.target());
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                let stop = Arc::new(Notify::new());
                *lock(&self.handle.shared.outbound) = Some(outbound_tx);
                self.stop = Some(stop.clone());
                self.handle.set_state(ClientState::Connected);
                self.handler.on_connect_ok(&self.handle);

                tokio::spawn(run_client_stream(
                    attempt,
                    stream,
                    outbound_rx,
                    stop,
                    self.events_tx.clone(),
                ));
            }
            ClientEvent::ConnectFailed(attempt, e) if attempt == self.attempt => {
                warn!(
                    "[uvx-client] {} connect to {} failed: {}",
                    self.config.name,
                    self.handle.target(),
                    e
                );
                self.handler.on_connect_fail(&self.handle, &e);
                self.handle.set_state(ClientState::Closing);
                self.handler.on_connection_closing(&self.handle);
                self.handle.set_state(ClientState::Disconnected);
                self.handler.on_connection_closed(&self.handle);
            }
            ClientEvent::Read(attempt, data) if attempt == self.attempt => {
                if self.handle.state() == ClientState::Connected {
                    self.handler.on_recv(&self.handle, &data);
                }
            }
            ClientEvent::ReadFailed(attempt, e) if attempt == self.attempt => {
                match e {
                    Some(e) => warn!("[uvx-client] {} read error: {}", self.config.name, e),
                    None => info!("[uvx-client] {} server closed the connection", self.config.name),
                }
                self.close();
            }
            ClientEvent::Closed(attempt) if attempt == self.attempt => {
                self.stop = None;
                self.handle.set_state(ClientState::Disconnected);
                self.handler.on_connection_closed(&self.handle);
            }
            stale => debug!("[uvx-client] {} ignoring stale {:?}", self.config.name, stale),
        }
    }

    fn close(&mut self) {
        if self.handle.state() != ClientState::Connected {
            return;
        }
        self.handle.set_state(ClientState::Closing);
        *lock(&self.handle.shared.outbound) = None;
        self.handler.on_connection_closing(&self.handle);
        if let Some(stop) = &self.stop {
            stop.notify_one();
        }
    }
}

async fn run_client_stream(
    attempt: u64,
    mut stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    stop: Arc<Notify>,
    events: mpsc::UnboundedSender<ClientEvent>,
) {
    let end = pump_stream(&mut stream, &mut outbound, &stop, |data| {
        events.send(ClientEvent::Read(attempt, data)).is_ok()
    })
    .await;

    let failure = match end {
        StreamEnd::Stopped | StreamEnd::Abandoned => None,
        StreamEnd::Eof => Some(None),
        StreamEnd::Failed(e) => Some(Some(e)),
    };
    if let Some(error) = failure {
        if events.send(ClientEvent::ReadFailed(attempt, error)).is_ok() {
            tokio::select! {
                _ = stop.notified() => {}
                _ = events.closed() => {}
            }
        }
    }

    close_stream(stream).await;
    let _ = events.send(ClientEvent::Closed(attempt));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::listen_tcp;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Ok,
        Fail,
        Closing,
        Closed,
        Recv(Vec<u8>),
        Heartbeat(u64),
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Seen>>>,
        greet: bool,
    }

    impl Recorder {
        fn events(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }

        fn count(&self, wanted: &Seen) -> usize {
            self.events().iter().filter(|e| *e == wanted).count()
        }

        fn push(&self, event: Seen) {
            self.seen.lock().unwrap().push(event);
        }
    }

    impl ClientHandler for Recorder {
        fn on_connect_ok(&mut self, client: &ClientHandle) {
            self.push(Seen::Ok);
            if self.greet {
                client.send(b"hi").unwrap();
            }
        }
        fn on_connect_fail(&mut self, _client: &ClientHandle, _error: &io::Error) {
            self.push(Seen::Fail);
        }
        fn on_recv(&mut self, _client: &ClientHandle, data: &[u8]) {
            self.push(Seen::Recv(data.to_vec()));
        }
        fn on_connection_closing(&mut self, _client: &ClientHandle) {
            self.push(Seen::Closing);
        }
        fn on_connection_closed(&mut self, _client: &ClientHandle) {
            self.push(Seen::Closed);
        }
        fn on_heartbeat(&mut self, _client: &ClientHandle, index: u64) {
            self.push(Seen::Heartbeat(index));
        }
    }

    /// Dialer that always fails and remembers when it was asked
    #[derive(Clone, Default)]
    struct RefusingDialer {
        attempts: Arc<Mutex<Vec<Instant>>>,
    }

    #[async_trait]
    impl Dialer for RefusingDialer {
        async fn dial(&self, _addr: SocketAddr) -> io::Result<TcpStream> {
            self.attempts.lock().unwrap().push(Instant::now());
            Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
        }
    }

    fn target() -> Endpoint {
        Endpoint::resolve("127.0.0.1", 9).unwrap()
    }

    async fn wait_for<F: Fn(&Recorder) -> bool>(recorder: &Recorder, done: F) {
        timeout(Duration::from_secs(5), async {
            while !done(recorder) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_attempt_per_interval() {
        let dialer = RefusingDialer::default();
        let recorder = Recorder::default();
        let config = ClientConfig {
            heartbeat_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let client = TcpClient::connect_with(dialer.clone(), target(), config, recorder.clone());

        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(recorder.count(&Seen::Fail), 3);
        assert_eq!(recorder.count(&Seen::Closing), 3);
        assert_eq!(recorder.count(&Seen::Closed), 3);
        assert_eq!(
            &recorder.events()[..4],
            &[Seen::Fail, Seen::Closing, Seen::Closed, Seen::Fail]
        );

        let attempts = dialer.attempts.lock().unwrap().clone();
        assert_eq!(attempts.len(), 3);
        for pair in attempts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(1));
        }
        assert!(!client.is_connected());
        assert!(client.send(b"nobody").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_reconnect_without_auto_connect() {
        let dialer = RefusingDialer::default();
        let recorder = Recorder::default();
        let config = ClientConfig {
            auto_connect: false,
            heartbeat_interval: Duration::from_secs(1),
            ..Default::default()
        };
        let client = TcpClient::connect_with(dialer.clone(), target(), config, recorder.clone());

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(dialer.attempts.lock().unwrap().len(), 1);
        assert_eq!(recorder.count(&Seen::Fail), 1);
        assert_eq!(client.state(), ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_recv_heartbeat_and_reconnect() {
        let listener = listen_tcp("127.0.0.1:0".parse().unwrap(), 8).unwrap();
        let addr = listener.local_addr().unwrap();

        let recorder = Recorder {
            greet: true,
            ..Default::default()
        };
        let config = ClientConfig {
            heartbeat_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let client = TcpClient::connect(addr.into(), config, recorder.clone());

        // First session: read the greeting, reply, then hang up.
        let (mut peer, _) = listener.accept().await.unwrap();
        let mut greeting = [0u8; 2];
        peer.read_exact(&mut greeting).await.unwrap();
        assert_eq!(&greeting, b"hi");
        peer.write_all(b"welcome").await.unwrap();

        wait_for(&recorder, |r| r.count(&Seen::Recv(b"welcome".to_vec())) == 1).await;
        wait_for(&recorder, |r| r.count(&Seen::Heartbeat(1)) == 1).await;
        assert!(client.is_connected());
        drop(peer);

        // The next tick reconnects.
        let (mut second, _) = listener.accept().await.unwrap();
        second.read_exact(&mut greeting).await.unwrap();
        wait_for(&recorder, |r| r.count(&Seen::Ok) == 2).await;

        let events = recorder.events();
        let closing = events.iter().position(|e| *e == Seen::Closing).unwrap();
        let closed = events.iter().position(|e| *e == Seen::Closed).unwrap();
        assert!(closing < closed);
        assert_eq!(recorder.count(&Seen::Fail), 0);

        client.shutdown();
        let mut buf = [0u8; 1];
        assert_eq!(second.read(&mut buf).await.unwrap(), 0);
        wait_for(&recorder, |r| r.count(&Seen::Closed) == 2).await;
        assert_eq!(client.state(), ClientState::Disconnected);
    }
}
