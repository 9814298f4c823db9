//! uvx command-line tools.
//!
//! Small programs around the uvx session layer: a TCP server and client,
//! a UDP ping-pong peer, and a loge log sender and receiver.

#[macro_use]
mod logging;
mod config;

use clap::{Args as ClapArgs, Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use uvx_session::{
    loge, ClientHandle, ClientHandler, Connection, ConnectionTable, DatagramFlags,
    DatagramHandler, Endpoint, Family, Level, LogEmitter, ServerHandler, TcpClient, TcpServer,
    UdpHandle, UdpTransport,
};
use uvx_wire::{LogItem, LogRecord};

use config::{parse_endpoint, UvxConfig};
use logging::UvxLogFormatter;

/// Delay before a UDP peer answers
const PING_PONG_DELAY: Duration = Duration::from_secs(1);

/// Tags attached to benchmark records
const BENCH_TAGS: &str = "uvx,bench";

/// Event-driven TCP/UDP tools and loge logging
#[derive(Parser, Debug)]
#[command(name = "uvx", version, about = "Event-driven TCP/UDP tools and loge logging")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Configuration file path
    #[arg(long, default_value = "uvx.yaml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept TCP connections and print what arrives
    Server(ServerArgs),
    /// Keep a TCP connection to a server alive
    Client(ClientArgs),
    /// Count back and forth with another UDP peer
    UdpEcho(UdpEchoArgs),
    /// Send benchmark log records
    LogClient(LogClientArgs),
    /// Receive and print log records
    LogServer(LogServerArgs),
}

#[derive(ClapArgs, Debug)]
struct ServerArgs {
    /// Listen address, e.g. 0.0.0.0:8001
    #[arg(long)]
    listen: Option<String>,

    /// Heartbeat interval, e.g. 60s (0s disables)
    #[arg(long)]
    heartbeat: Option<humantime::Duration>,

    /// Idle timeout, e.g. 180s (0s disables)
    #[arg(long)]
    conn_timeout: Option<humantime::Duration>,

    /// Send received data back to the peer
    #[arg(long)]
    echo: bool,
}

#[derive(ClapArgs, Debug)]
struct ClientArgs {
    /// Server address, e.g. 127.0.0.1:8001
    #[arg(long)]
    connect: Option<String>,

    /// Heartbeat and reconnect interval, e.g. 60s
    #[arg(long)]
    heartbeat: Option<humantime::Duration>,

    /// Text sent after connecting and on every heartbeat
    #[arg(long)]
    message: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct UdpEchoArgs {
    /// Peer IP to start counting with; without it, wait for a peer
    peer: Option<String>,
}

#[derive(ClapArgs, Debug)]
struct LogClientArgs {
    /// Log server address, e.g. 127.0.0.1:19730
    #[arg(long)]
    target: Option<String>,

    /// Emitter name (at most 15 bytes)
    #[arg(long)]
    name: Option<String>,

    /// Records per round
    #[arg(long)]
    bench: Option<u32>,

    /// Time between rounds, e.g. 10s
    #[arg(long)]
    interval: Option<humantime::Duration>,
}

#[derive(ClapArgs, Debug)]
struct LogServerArgs {
    /// Listen address, e.g. 127.0.0.1:19730
    #[arg(long)]
    listen: Option<String>,

    /// Print records as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::new("info")
            .add_directive(format!("uvx={}", args.log_level).parse()?)
            .add_directive(format!("uvx_session={}", args.log_level).parse()?)
            .add_directive(format!("uvx_wire={}", args.log_level).parse()?),
    };

    let formatter = UvxLogFormatter::new("uvx".to_string());

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(true)
        .event_format(formatter)
        .init();

    info!("Starting uvx v{}", env!("CARGO_PKG_VERSION"));

    let config = UvxConfig::load_from_file(&args.config)?;

    match args.command {
        Command::Server(cmd) => run_server(&config, cmd).await,
        Command::Client(cmd) => run_client(&config, cmd).await,
        Command::UdpEcho(cmd) => run_udp_echo(&config, cmd).await,
        Command::LogClient(cmd) => run_log_client(&config, cmd).await,
        Command::LogServer(cmd) => run_log_server(&config, cmd).await,
    }
}

/// Prints connection events
struct ConsoleServer {
    echo: bool,
}

impl ServerHandler for ConsoleServer {
    fn on_connect_ok(&mut self, conn: &Arc<Connection>) {
        component_info!("server", "Connection {} from {}", conn.id(), conn.peer_addr());
    }

    fn on_connect_fail(&mut self, error: &std::io::Error) {
        component_warn!("server", "Accept failed: {}", error);
    }

    fn on_recv(&mut self, conn: &Arc<Connection>, data: &[u8]) {
        component_info!(
            "server",
            "Received {} bytes from {}: {}",
            data.len(),
            conn.id(),
            String::from_utf8_lossy(data)
        );
        if self.echo {
            if let Err(e) = conn.send(data) {
                component_warn!("server", "Echo to {} failed: {}", conn.id(), e);
            }
        }
    }

    fn on_connection_closing(&mut self, conn: &Arc<Connection>) {
        component_info!("server", "Connection {} closing", conn.id());
    }

    fn on_connection_closed(&mut self, conn: &Arc<Connection>) {
        component_info!("server", "Connection {} closed", conn.id());
    }

    fn on_heartbeat(&mut self, table: &ConnectionTable, index: u64) {
        component_debug!("server", "Heartbeat {}: {} connections", index, table.len());
    }
}

async fn run_server(config: &UvxConfig, args: ServerArgs) -> anyhow::Result<()> {
    let mut server_config = config.server_config();
    if let Some(heartbeat) = args.heartbeat {
        server_config.heartbeat_interval = heartbeat.into();
    }
    if let Some(timeout) = args.conn_timeout {
        server_config.conn_timeout = timeout.into();
    }

    let bind = parse_endpoint(args.listen.as_deref().unwrap_or(&config.server.listen))?;
    let server = TcpServer::start(bind, server_config, ConsoleServer { echo: args.echo })?;
    component_info!("server", "Listening on {}", server.local_addr());

    tokio::signal::ctrl_c().await?;

    let closed = server.disconnect_all().await?;
    component_info!("server", "Disconnected {} connections", closed);
    server.shutdown();
    Ok(())
}

/// Prints client events and optionally sends a message
struct ConsoleClient {
    message: Option<String>,
}

impl ConsoleClient {
    fn say(&self, client: &ClientHandle) {
        if let Some(message) = &self.message {
            if let Err(e) = client.send(message.as_bytes()) {
                component_warn!("client", "Send failed: {}", e);
            }
        }
    }
}

impl ClientHandler for ConsoleClient {
    fn on_connect_ok(&mut self, client: &ClientHandle) {
        component_info!("client", "Connected to {}", client.target());
        self.say(client);
    }

    fn on_connect_fail(&mut self, client: &ClientHandle, error: &std::io::Error) {
        component_warn!("client", "Connect to {} failed: {}", client.target(), error);
    }

    fn on_recv(&mut self, _client: &ClientHandle, data: &[u8]) {
        component_info!(
            "client",
            "Received {} bytes: {}",
            data.len(),
            String::from_utf8_lossy(data)
        );
    }

    fn on_connection_closing(&mut self, _client: &ClientHandle) {
        component_info!("client", "Connection closing");
    }

    fn on_connection_closed(&mut self, _client: &ClientHandle) {
        component_info!("client", "Connection closed");
    }

    fn on_heartbeat(&mut self, client: &ClientHandle, index: u64) {
        component_debug!("client", "Heartbeat {} ({:?})", index, client.state());
        self.say(client);
    }
}

async fn run_client(config: &UvxConfig, args: ClientArgs) -> anyhow::Result<()> {
    let mut client_config = config.client_config();
    if let Some(heartbeat) = args.heartbeat {
        client_config.heartbeat_interval = heartbeat.into();
    }

    let target = parse_endpoint(args.connect.as_deref().unwrap_or(&config.client.connect))?;
    let client = TcpClient::connect(
        target,
        client_config,
        ConsoleClient {
            message: args.message,
        },
    );

    tokio::signal::ctrl_c().await?;
    client.shutdown();
    Ok(())
}

/// Answers every number with the next one after a short pause
struct PingPong;

impl DatagramHandler for PingPong {
    fn on_recv(&mut self, udp: &UdpHandle, data: &[u8], from: SocketAddr, flags: DatagramFlags) {
        if flags.contains(DatagramFlags::PARTIAL) {
            component_warn!("udp", "Datagram from {} was truncated", from);
        }

        let Some(next) = next_count(data) else {
            component_warn!("udp", "Ignoring {} bytes from {}", data.len(), from);
            return;
        };
        component_info!("udp", "Received {} from {}", next - 1, from);

        let udp = udp.clone();
        tokio::spawn(async move {
            tokio::time::sleep(PING_PONG_DELAY).await;
            if let Err(e) = udp.send_to(from, next.to_string().as_bytes()) {
                component_warn!("udp", "Reply to {} failed: {}", from, e);
            }
        });
    }
}

/// The number to answer with, if `data` holds a decimal count
fn next_count(data: &[u8]) -> Option<u64> {
    std::str::from_utf8(data)
        .ok()?
        .trim_end_matches('\0')
        .trim()
        .parse::<u64>()
        .ok()?
        .checked_add(1)
}

async fn run_udp_echo(config: &UvxConfig, args: UdpEchoArgs) -> anyhow::Result<()> {
    let bind = parse_endpoint(&config.udp.bind)?;

    let udp = match args.peer {
        None => {
            let udp = UdpTransport::start(Some(bind), config.udp_config(), PingPong).await?;
            component_info!("udp", "Waiting for a peer on {}", udp.local_addr());
            udp
        }
        Some(peer) => {
            let peer = Endpoint::resolve(&peer, bind.port())?;
            let local = match peer.family() {
                Family::V4 => Endpoint::unspecified_v4(),
                Family::V6 => Endpoint::resolve("::", 0)?,
            };
            let udp = UdpTransport::start(Some(local), config.udp_config(), PingPong).await?;
            udp.send_to(peer.socket_addr(), b"1")?;
            component_info!("udp", "Sent 1 to {}", peer);
            udp
        }
    };

    tokio::signal::ctrl_c().await?;
    udp.shutdown();
    Ok(())
}

async fn run_log_client(config: &UvxConfig, args: LogClientArgs) -> anyhow::Result<()> {
    let target = parse_endpoint(args.target.as_deref().unwrap_or(&config.log.target))?;
    let name = args.name.unwrap_or_else(|| config.log.name.clone());
    let bench = args.bench.unwrap_or(config.log.bench);
    let interval: Duration = args
        .interval
        .map(Into::into)
        .unwrap_or_else(|| Duration::from_secs(config.log.interval_secs));

    let emitter = LogEmitter::start(target, &name).await?;
    component_info!(
        "log",
        "Sending {} records every {:?} to {} as {}",
        bench,
        interval,
        target,
        name
    );

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut round: u64 = 0;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = ticker.tick() => {
                round += 1;
                let mut bytes = 0;
                for i in 0..bench {
                    bytes += loge!(emitter, bench_level(i), BENCH_TAGS, "round {} record {} of {}", round, i + 1, bench)?;
                }
                component_debug!("log", "Round {}: {} records, {} bytes", round, bench, bytes);
            }
        }
    }

    emitter.shutdown();
    Ok(())
}

/// Level of the `i`th record in a round
fn bench_level(i: u32) -> Level {
    match i % 4 {
        0 => Level::DEBUG,
        1 => Level::INFO,
        2 => Level::WARN,
        _ => Level::ERROR,
    }
}

/// Prints every record it receives
struct LogPrinter {
    json: bool,
    count: u64,
}

impl DatagramHandler for LogPrinter {
    fn on_recv(&mut self, _udp: &UdpHandle, data: &[u8], from: SocketAddr, _flags: DatagramFlags) {
        let item = match LogRecord::parse(data).and_then(|record| record.to_item()) {
            Ok(item) => item,
            Err(e) => {
                component_warn!("log", "Bad record from {}: {}", from, e);
                return;
            }
        };
        self.count += 1;

        if self.json {
            match serde_json::to_string(&item) {
                Ok(line) => println!("{}", line),
                Err(e) => component_error!("log", "Cannot encode record: {}", e),
            }
        } else {
            component_info!("log", "#{} {}", self.count, describe(&item));
        }
    }
}

/// One-line summary of a record
fn describe(item: &LogItem) -> String {
    let time = chrono::DateTime::from_timestamp(i64::from(item.time), 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| item.time.to_string());
    format!(
        "[{}] {} {} pid={} tid={} {}:{} tags={} {}",
        item.level.label(),
        time,
        item.name,
        item.pid,
        item.tid,
        item.file,
        item.line,
        item.tags,
        item.message
    )
}

async fn run_log_server(config: &UvxConfig, args: LogServerArgs) -> anyhow::Result<()> {
    let bind = parse_endpoint(args.listen.as_deref().unwrap_or(&config.log.target))?;
    let printer = LogPrinter {
        json: args.json,
        count: 0,
    };
    let udp = UdpTransport::start(Some(bind), config.udp_config(), printer).await?;
    component_info!("log", "Receiving log records on {}", udp.local_addr());

    tokio::signal::ctrl_c().await?;
    udp.shutdown();
    Ok(())
}
