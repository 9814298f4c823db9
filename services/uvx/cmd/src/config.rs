//! Configuration handling for the uvx tools.
//!
//! Settings come from a YAML file, then environment variables, then
//! command-line flags (applied in `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use uvx_session::{ClientConfig, Endpoint, ServerConfig, UdpConfig};

/// Root configuration (matches the YAML layout)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UvxConfig {
    /// TCP server settings
    pub server: ServerSection,
    /// TCP client settings
    pub client: ClientSection,
    /// UDP echo settings
    pub udp: UdpSection,
    /// Log client/server settings
    pub log: LogSection,
}

/// `server:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address, `ip:port`
    pub listen: String,
    /// Expected number of connections
    pub expected_connections: usize,
    /// Listen backlog
    pub listen_backlog: u32,
    /// Per-connection extension block size
    pub conn_extra_size: usize,
    /// Idle timeout in seconds, 0 disables
    pub conn_timeout_secs: u64,
    /// Heartbeat interval in seconds, 0 disables
    pub heartbeat_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        let defaults = ServerConfig::default();
        Self {
            listen: "127.0.0.1:8001".to_string(),
            expected_connections: defaults.expected_connections,
            listen_backlog: defaults.listen_backlog,
            conn_extra_size: defaults.conn_extra_size,
            conn_timeout_secs: defaults.conn_timeout.as_secs(),
            heartbeat_secs: defaults.heartbeat_interval.as_secs(),
        }
    }
}

/// `client:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSection {
    /// Server address, `ip:port`
    pub connect: String,
    /// Reconnect after the connection drops
    pub auto_connect: bool,
    /// Heartbeat interval in seconds
    pub heartbeat_secs: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            connect: "127.0.0.1:8001".to_string(),
            auto_connect: defaults.auto_connect,
            heartbeat_secs: defaults.heartbeat_interval.as_secs(),
        }
    }
}

/// `udp:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpSection {
    /// Bind address of the echo peer that waits, `ip:port`
    pub bind: String,
    /// Receive buffer size in bytes
    pub recv_buffer_size: usize,
}

impl Default for UdpSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8008".to_string(),
            recv_buffer_size: UdpConfig::default().recv_buffer_size,
        }
    }
}

/// `log:` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSection {
    /// Log server address, `ip:port`
    pub target: String,
    /// Emitter name
    pub name: String,
    /// Records sent per round
    pub bench: u32,
    /// Seconds between rounds
    pub interval_secs: u64,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            target: "127.0.0.1:19730".to_string(),
            name: "xlog-test".to_string(),
            bench: 1,
            interval_secs: 10,
        }
    }
}

impl UvxConfig {
    /// Load configuration from file and environment variables.
    ///
    /// A missing file means defaults; a malformed one is an error.
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => {
                let config = serde_yaml::from_str::<UvxConfig>(&content)
                    .with_context(|| format!("failed to parse config file {:?}", path))?;
                info!("Loaded configuration from {:?}", path);
                config
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Apply `UVX_*` overrides from `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(listen) = lookup("UVX_LISTEN") {
            info!("Listen address overridden by environment: {}", listen);
            self.server.listen = listen;
        }

        if let Some(connect) = lookup("UVX_CONNECT") {
            info!("Connect address overridden by environment: {}", connect);
            self.client.connect = connect;
        }

        if let Some(secs) = lookup("UVX_HEARTBEAT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => {
                    self.server.heartbeat_secs = secs;
                    self.client.heartbeat_secs = secs;
                    info!("Heartbeat overridden by environment: {}s", secs);
                }
                Err(_) => warn!("Ignoring UVX_HEARTBEAT_SECS={:?}", secs),
            }
        }

        if let Some(secs) = lookup("UVX_CONN_TIMEOUT_SECS") {
            match secs.parse::<u64>() {
                Ok(secs) => {
                    self.server.conn_timeout_secs = secs;
                    info!("Connection timeout overridden by environment: {}s", secs);
                }
                Err(_) => warn!("Ignoring UVX_CONN_TIMEOUT_SECS={:?}", secs),
            }
        }

        if let Some(target) = lookup("UVX_LOG_TARGET") {
            info!("Log target overridden by environment: {}", target);
            self.log.target = target;
        }
    }

    /// Library server configuration
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            expected_connections: self.server.expected_connections,
            listen_backlog: self.server.listen_backlog,
            conn_extra_size: self.server.conn_extra_size,
            conn_timeout: Duration::from_secs(self.server.conn_timeout_secs),
            heartbeat_interval: Duration::from_secs(self.server.heartbeat_secs),
            ..Default::default()
        }
    }

    /// Library client configuration
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            auto_connect: self.client.auto_connect,
            heartbeat_interval: Duration::from_secs(self.client.heartbeat_secs),
            ..Default::default()
        }
    }

    /// Library UDP configuration
    pub fn udp_config(&self) -> UdpConfig {
        UdpConfig {
            recv_buffer_size: self.udp.recv_buffer_size,
            ..Default::default()
        }
    }
}

/// Parse `ip:port` (IPv6 as `[ip]:port`) into an endpoint
pub fn parse_endpoint(text: &str) -> Result<Endpoint> {
    let (ip, port) = text
        .trim()
        .rsplit_once(':')
        .with_context(|| format!("expected ip:port, got {:?}", text))?;
    let port = port
        .parse::<u16>()
        .with_context(|| format!("bad port in {:?}", text))?;
    Ok(Endpoint::resolve(ip, port)?)
}
