//! TCP server session manager.
//!
//! [`TcpServer::start`] binds a listener and spawns one actor task that owns
//! the [`ConnectionTable`], accepts connections, dispatches reads and drives
//! the heartbeat timer. Handler callbacks all run on that task, one at a
//! time. Socket I/O for each connection runs in its own task and reports
//! back to the actor through a channel.
//!
//! Close order for a connection is always: `on_connection_closing`, socket
//! close, `on_connection_closed`, removal from the table.

use crate::connection::{ConnId, Connection, ConnectionTable};
use crate::endpoint::Endpoint;
use crate::error::{Result, SessionError};
use crate::transport::{close_stream, listen_tcp, pump_stream, StreamEnd};
use bytes::Bytes;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Default server name used in log lines
pub const DEFAULT_SERVER_NAME: &str = "xserver";

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Configuration for a [`TcpServer`]
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Name used in log lines
    pub name: String,
    /// Expected number of concurrent connections (table sizing hint)
    pub expected_connections: usize,
    /// Listen backlog
    pub listen_backlog: u32,
    /// Size of each connection's zeroed extension block
    pub conn_extra_size: usize,
    /// Idle time after which a connection is closed; zero disables the sweep
    pub conn_timeout: Duration,
    /// Heartbeat period; zero disables the timer (and with it the sweep)
    pub heartbeat_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVER_NAME.to_string(),
            expected_connections: 1024,
            listen_backlog: 128,
            conn_extra_size: 0,
            conn_timeout: Duration::from_secs(180),
            heartbeat_interval: Duration::from_secs(60),
        }
    }
}

/// Server callbacks. Every method is optional.
///
/// Callbacks run on the server task and must not block.
#[allow(unused_variables)]
pub trait ServerHandler: Send + 'static {
    /// A connection was accepted and added to the table
    fn on_connect_ok(&mut self, conn: &Arc<Connection>) {}
    /// Accepting a connection failed; the listener keeps running
    fn on_connect_fail(&mut self, error: &io::Error) {}
    /// Bytes were read from a connection
    fn on_recv(&mut self, conn: &Arc<Connection>, data: &[u8]) {}
    /// A connection is about to be closed
    fn on_connection_closing(&mut self, conn: &Arc<Connection>) {}
    /// A connection's socket has closed; it leaves the table after this returns
    fn on_connection_closed(&mut self, conn: &Arc<Connection>) {}
    /// Heartbeat tick, before the idle sweep. `index` counts from zero.
    fn on_heartbeat(&mut self, table: &ConnectionTable, index: u64) {}
}

type Visitor = Box<dyn FnMut(&Arc<Connection>) + Send>;

enum ServerCommand {
    Iterate {
        visitor: Option<Visitor>,
        reply: oneshot::Sender<usize>,
    },
    DisconnectAll {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

#[derive(Debug)]
enum ConnEvent {
    Read(ConnId, Bytes),
    ReadFailed(ConnId, Option<io::Error>),
    Closed(ConnId),
}

/// Handle to a running server
#[derive(Clone, Debug)]
pub struct ServerHandle {
    name: String,
    local_addr: SocketAddr,
    commands: mpsc::UnboundedSender<ServerCommand>,
}

impl ServerHandle {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Visit every live connection in table order; returns the count.
    ///
    /// The visitor runs on the server task.
    pub async fn iterate_connections<F>(&self, visitor: Option<F>) -> Result<usize>
    where
        F: FnMut(&Arc<Connection>) + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let visitor = visitor.map(|f| Box::new(f) as Visitor);
        self.request(ServerCommand::Iterate { visitor, reply }, rx)
            .await
    }

    /// Number of live connections
    pub async fn connection_count(&self) -> Result<usize> {
        self.iterate_connections(None::<fn(&Arc<Connection>)>).await
    }

    /// Start closing every live connection; returns how many were closed
    pub async fn disconnect_all(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.request(ServerCommand::DisconnectAll { reply }, rx).await
    }

    /// Stop the heartbeat and close the listener.
    ///
    /// Live connections are not closed; their sockets stay open until the
    /// peer goes away. Call [`ServerHandle::disconnect_all`] first to close them.
    pub fn shutdown(&self) {
        let _ = self.commands.send(ServerCommand::Shutdown);
    }

    async fn request(
        &self,
        command: ServerCommand,
        rx: oneshot::Receiver<usize>,
    ) -> Result<usize> {
        self.commands
            .send(command)
            .map_err(|_| SessionError::Closed("server"))?;
        rx.await.map_err(|_| SessionError::Closed("server"))
    }
}

/// TCP server entry point
pub struct TcpServer;

impl TcpServer {
    /// Bind `bind`, start listening and spawn the server task.
    ///
    /// Dropping every [`ServerHandle`] has the same effect as
    /// [`ServerHandle::shutdown`].
    pub fn start<H: ServerHandler>(
        bind: Endpoint,
        config: ServerConfig,
        handler: H,
    ) -> Result<ServerHandle> {
        let addr = bind.socket_addr();
        let listener = listen_tcp(addr, config.listen_backlog)
            .map_err(|source| SessionError::Listen { addr, source })?;
        let local_addr = listener.local_addr()?;
        info!("[uvx-server] {} listening on {}", config.name, local_addr);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (close_tx, close_rx) = mpsc::unbounded_channel();

        let heartbeat = (!config.heartbeat_interval.is_zero()).then(|| {
            let period = config.heartbeat_interval;
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });

        let handle = ServerHandle {
            name: config.name.clone(),
            local_addr,
            commands: commands_tx,
        };

        let actor = ServerActor {
            table: ConnectionTable::with_capacity(config.expected_connections),
            config,
            handler,
            events_tx,
            close_tx,
            next_id: 1,
            heartbeat_index: 0,
        };
        tokio::spawn(actor.run(listener, heartbeat, commands_rx, events_rx, close_rx));

        Ok(handle)
    }
}

struct ServerActor<H> {
    config: ServerConfig,
    handler: H,
    table: ConnectionTable,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    close_tx: mpsc::UnboundedSender<ConnId>,
    next_id: ConnId,
    heartbeat_index: u64,
}

impl<H: ServerHandler> ServerActor<H> {
    async fn run(
        mut self,
        listener: TcpListener,
        mut heartbeat: Option<Interval>,
        mut commands: mpsc::UnboundedReceiver<ServerCommand>,
        mut events: mpsc::UnboundedReceiver<ConnEvent>,
        mut close_requests: mpsc::UnboundedReceiver<ConnId>,
    ) {
        let accept_backoff = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(accept_backoff);
        let mut accepting = true;

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(ServerCommand::Iterate { mut visitor, reply }) => {
                        if let Some(visit) = visitor.as_mut() {
                            self.table.iter().for_each(|conn| visit(conn));
                        }
                        let _ = reply.send(self.table.len());
                    }
                    Some(ServerCommand::DisconnectAll { reply }) => {
                        let conns: Vec<_> = self.table.iter().cloned().collect();
                        let closed = conns.iter().filter(|conn| self.disconnect(conn)).count();
                        let _ = reply.send(closed);
                    }
                    Some(ServerCommand::Shutdown) | None => break,
                },

                accepted = listener.accept(), if accepting => match accepted {
                    Ok((stream, peer)) => self.accept(stream, peer),
                    Err(e) => {
                        accepting = false;
                        accept_backoff.as_mut().reset(self.accept_failed(&e));
                    }
                },

                _ = &mut accept_backoff, if !accepting => accepting = true,

                Some(event) = events.recv() => self.handle_event(event),

                Some(id) = close_requests.recv() => {
                    if let Some(conn) = self.table.get(id).cloned() {
                        self.disconnect(&conn);
                    }
                }

                _ = async {
                    match heartbeat.as_mut() {
                        Some(timer) => timer.tick().await,
                        None => std::future::pending().await,
                    }
                } => self.on_heartbeat(),
            }
        }

        info!(
            "[uvx-server] {} shut down, {} connection(s) left open",
            self.config.name,
            self.table.len()
        );
    }

    fn accept(&mut self, stream: TcpStream, peer: SocketAddr) {
        let id = self.next_id;
        self.next_id += 1;
        info!("[uvx-server] {} on connection {} from {}", self.config.name, id, peer);

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            id,
            peer,
            self.config.conn_extra_size,
            outbound_tx,
            self.close_tx.clone(),
        ));
        self.table.insert(conn.clone(), Instant::now());
        self.handler.on_connect_ok(&conn);

        tokio::spawn(run_connection(
            conn,
            stream,
            outbound_rx,
            self.events_tx.clone(),
        ));
    }

    /// Report a failed accept; returns when accepting may resume
    fn accept_failed(&mut self, e: &io::Error) -> Instant {
        error!("[uvx-server] {} accept error: {}", self.config.name, e);
        self.handler.on_connect_fail(e);
        Instant::now() + ACCEPT_BACKOFF
    }

    fn handle_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Read(id, data) => {
                let Some(conn) = self.table.get(id) else {
                    return;
                };
                if conn.is_closing() {
                    return;
                }
                if let Some(conn) = self.table.touch(id, Instant::now()).cloned() {
                    self.handler.on_recv(&conn, &data);
                }
            }
            ConnEvent::ReadFailed(id, e) => {
                match e {
                    Some(e) => warn!("[uvx-server] {} read error on {}: {}", self.config.name, id, e),
                    None => debug!("[uvx-server] {} connection {} closed by peer", self.config.name, id),
                }
                if let Some(conn) = self.table.get(id).cloned() {
                    self.disconnect(&conn);
                }
            }
            ConnEvent::Closed(id) => {
                if let Some(conn) = self.table.get(id).cloned() {
                    self.handler.on_connection_closed(&conn);
                    self.table.remove(id);
                    debug!(
                        "[uvx-server] {} connection {} released ({} ref(s) left)",
                        self.config.name,
                        id,
                        conn.ref_count() - 1
                    );
                }
            }
        }
    }

    /// Start closing `conn`; returns `false` if it was already closing
    fn disconnect(&mut self, conn: &Arc<Connection>) -> bool {
        if !conn.begin_close() {
            return false;
        }
        self.handler.on_connection_closing(conn);
        conn.stop.notify_one();
        true
    }

    fn on_heartbeat(&mut self) {
        let index = self.heartbeat_index;
        self.heartbeat_index += 1;
        debug!("[uvx-server] {} on heartbeat (index {})", self.config.name, index);
        self.handler.on_heartbeat(&self.table, index);

        if self.config.conn_timeout.is_zero() {
            return;
        }
        for conn in self.table.expired(Instant::now(), self.config.conn_timeout) {
            if self.disconnect(&conn) {
                info!(
                    "[uvx-server] {} closing connection {} ({}) after {:?} of silence",
                    self.config.name,
                    conn.id(),
                    conn.peer_addr(),
                    conn.last_activity().elapsed()
                );
            }
        }
    }
}

/// Per-connection I/O task. Holds a reference until the close is reported.
async fn run_connection(
    conn: Arc<Connection>,
    mut stream: TcpStream,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let id = conn.id();
    let end = pump_stream(&mut stream, &mut outbound, &conn.stop, |data| {
        events.send(ConnEvent::Read(id, data)).is_ok()
    })
    .await;

    let failure = match end {
        StreamEnd::Stopped | StreamEnd::Abandoned => None,
        StreamEnd::Eof => Some(None),
        StreamEnd::Failed(e) => Some(Some(e)),
    };

    // Reading stopped on its own: let the server run the closing callback
    // before the socket goes away.
    if let Some(error) = failure {
        if events.send(ConnEvent::ReadFailed(id, error)).is_ok() {
            tokio::select! {
                _ = conn.stop.notified() => {}
                _ = events.closed() => {}
            }
        }
    }

    close_stream(stream).await;
    let _ = events.send(ConnEvent::Closed(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::connect_tcp;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq)]
    enum Seen {
        Accepted(ConnId),
        Recv(ConnId, Vec<u8>),
        Closing(ConnId),
        Closed(ConnId),
        Heartbeat(u64, usize),
        AcceptFailed,
    }

    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<Seen>>>,
        echo: bool,
    }

    impl Recorder {
        fn events(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }

        fn push(&self, event: Seen) {
            self.seen.lock().unwrap().push(event);
        }
    }

    impl ServerHandler for Recorder {
        fn on_connect_ok(&mut self, conn: &Arc<Connection>) {
            self.push(Seen::Accepted(conn.id()));
        }
        fn on_connect_fail(&mut self, _error: &io::Error) {
            self.push(Seen::AcceptFailed);
        }
        fn on_recv(&mut self, conn: &Arc<Connection>, data: &[u8]) {
            self.push(Seen::Recv(conn.id(), data.to_vec()));
            if self.echo {
                conn.send(data).unwrap();
            }
        }
        fn on_connection_closing(&mut self, conn: &Arc<Connection>) {
            self.push(Seen::Closing(conn.id()));
        }
        fn on_connection_closed(&mut self, conn: &Arc<Connection>) {
            self.push(Seen::Closed(conn.id()));
        }
        fn on_heartbeat(&mut self, table: &ConnectionTable, index: u64) {
            self.push(Seen::Heartbeat(index, table.len()));
        }
    }

    fn loopback() -> Endpoint {
        Endpoint::resolve("127.0.0.1", 0).unwrap()
    }

    async fn wait_for<F: Fn(&[Seen]) -> bool>(recorder: &Recorder, done: F) {
        timeout(Duration::from_secs(5), async {
            while !done(&recorder.events()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_echo_and_peer_close() {
        let recorder = Recorder {
            echo: true,
            ..Default::default()
        };
        let config = ServerConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        let server = TcpServer::start(loopback(), config, recorder.clone()).unwrap();

        let mut client = connect_tcp(server.local_addr()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut reply = [0u8; 5];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"hello");
        assert_eq!(server.connection_count().await.unwrap(), 1);

        drop(client);
        wait_for(&recorder, |seen| seen.contains(&Seen::Closed(1))).await;

        assert_eq!(
            recorder.events(),
            vec![
                Seen::Accepted(1),
                Seen::Recv(1, b"hello".to_vec()),
                Seen::Closing(1),
                Seen::Closed(1),
            ]
        );
        assert_eq!(server.connection_count().await.unwrap(), 0);
        server.shutdown();
    }

    #[tokio::test]
    async fn test_iterate_in_recency_order() {
        let recorder = Recorder::default();
        let config = ServerConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        let server = TcpServer::start(loopback(), config, recorder.clone()).unwrap();

        let mut clients = Vec::new();
        for n in 1..=3u64 {
            clients.push(connect_tcp(server.local_addr()).await.unwrap());
            wait_for(&recorder, |seen| seen.contains(&Seen::Accepted(n))).await;
        }

        clients[0].write_all(b"x").await.unwrap();
        wait_for(&recorder, |seen| seen.contains(&Seen::Recv(1, b"x".to_vec()))).await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = order.clone();
        let count = server
            .iterate_connections(Some(move |conn: &Arc<Connection>| {
                sink.lock().unwrap().push(conn.id())
            }))
            .await
            .unwrap();

        assert_eq!(count, 3);
        assert_eq!(*order.lock().unwrap(), vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_idle_connection_evicted_once() {
        let recorder = Recorder::default();
        let config = ServerConfig {
            heartbeat_interval: Duration::from_millis(200),
            conn_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let server = TcpServer::start(loopback(), config, recorder.clone()).unwrap();

        let mut client = connect_tcp(server.local_addr()).await.unwrap();
        client.write_all(b"once").await.unwrap();

        // Server closes the silent connection; the client sees EOF.
        let mut buf = [0u8; 8];
        let n = timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        wait_for(&recorder, |seen| seen.contains(&Seen::Closed(1))).await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let events = recorder.events();
        let closed = events.iter().filter(|e| **e == Seen::Closed(1)).count();
        let closing = events.iter().filter(|e| **e == Seen::Closing(1)).count();
        assert_eq!((closing, closed), (1, 1));
        assert!(events.contains(&Seen::Heartbeat(0, 1)));
        assert_eq!(server.connection_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_close_from_handler_side() {
        let recorder = Recorder::default();
        let config = ServerConfig {
            heartbeat_interval: Duration::ZERO,
            conn_extra_size: 16,
            ..Default::default()
        };
        let server = TcpServer::start(loopback(), config, recorder.clone()).unwrap();
        let mut client = connect_tcp(server.local_addr()).await.unwrap();
        wait_for(&recorder, |seen| seen.contains(&Seen::Accepted(1))).await;

        let held = Arc::new(Mutex::new(None));
        let slot = held.clone();
        server
            .iterate_connections(Some(move |conn: &Arc<Connection>| {
                *slot.lock().unwrap() = Some(conn.clone());
            }))
            .await
            .unwrap();
        let conn = held.lock().unwrap().take().unwrap();
        assert_eq!(conn.with_extra(|extra| extra.len()), 16);

        conn.close().unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        wait_for(&recorder, |seen| seen.contains(&Seen::Closed(1))).await;

        // The table dropped its reference; ours keeps the connection alive.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(conn.ref_count(), 1);
        assert!(conn.send(b"late").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_accept_error_backs_off() {
        let recorder = Recorder::default();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (close_tx, _close_rx) = mpsc::unbounded_channel();
        let mut actor = ServerActor {
            config: ServerConfig::default(),
            handler: recorder.clone(),
            table: ConnectionTable::default(),
            events_tx,
            close_tx,
            next_id: 1,
            heartbeat_index: 0,
        };

        let now = Instant::now();
        let error = io::Error::new(io::ErrorKind::Other, "too many open files");
        assert_eq!(actor.accept_failed(&error), now + ACCEPT_BACKOFF);
        assert_eq!(recorder.events(), vec![Seen::AcceptFailed]);
    }

    #[tokio::test]
    async fn test_disconnect_all_then_shutdown() {
        let recorder = Recorder::default();
        let config = ServerConfig {
            heartbeat_interval: Duration::ZERO,
            ..Default::default()
        };
        let server = TcpServer::start(loopback(), config, recorder.clone()).unwrap();
        let _a = connect_tcp(server.local_addr()).await.unwrap();
        let _b = connect_tcp(server.local_addr()).await.unwrap();
        wait_for(&recorder, |seen| seen.contains(&Seen::Accepted(2))).await;

        assert_eq!(server.disconnect_all().await.unwrap(), 2);
        wait_for(&recorder, |seen| {
            seen.contains(&Seen::Closed(1)) && seen.contains(&Seen::Closed(2))
        })
        .await;

        server.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.connection_count().await.is_err());
    }
}
