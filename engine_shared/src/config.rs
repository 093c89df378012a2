//! Configuration system.
//!
//! Loads engine configuration from JSON strings/files. Every field has a
//! default, so a partial file only overrides what it names.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::Path,
    time::Duration,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Port the host binds when none is configured.
pub const DEFAULT_HOST_PORT: u16 = 51234;

/// Networking settings consumed by the session layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Address clients send their connection request to.
    #[serde(default = "default_host_addr")]
    pub host_addr: IpAddr,
    /// Port the host binds and clients connect to.
    #[serde(default = "default_host_port")]
    pub host_port: u16,
    /// Silence after which a peer is sent a heartbeat request.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Unanswered heartbeat requests tolerated before eviction.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Cadence of the heartbeat check loop.
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Receive buffer size; datagrams larger than this are truncated by the OS.
    #[serde(default = "default_recv_buffer_bytes")]
    pub recv_buffer_bytes: usize,
}

fn default_host_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_host_port() -> u16 {
    DEFAULT_HOST_PORT
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    5
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_recv_buffer_bytes() -> usize {
    64 * 1024
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            host_addr: default_host_addr(),
            host_port: default_host_port(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            recv_buffer_bytes: default_recv_buffer_bytes(),
        }
    }
}

impl NetConfig {
    pub fn host_endpoint(&self) -> SocketAddr {
        SocketAddr::new(self.host_addr, self.host_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Applies an `--ip` style argument: `addr` or `addr:port`.
    ///
    /// An unparsable address falls back to loopback and an unparsable port
    /// to [`DEFAULT_HOST_PORT`], the same way the engine's launcher does.
    pub fn apply_ip_arg(&mut self, arg: &str) {
        if let Ok(endpoint) = arg.parse::<SocketAddr>() {
            self.host_addr = endpoint.ip();
            self.host_port = endpoint.port();
            return;
        }
        let (addr, port) = match arg.rsplit_once(':') {
            Some((addr, port)) if !addr.contains(':') => (addr, Some(port)),
            _ => (arg, None),
        };
        self.host_addr = addr.parse().unwrap_or_else(|_| default_host_addr());
        if let Some(port) = port {
            self.host_port = port.parse().unwrap_or(DEFAULT_HOST_PORT);
        }
    }
}

/// Root configuration shared by host/client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Fixed simulation tick rate.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: u32,
    #[serde(default)]
    pub net: NetConfig,
}

fn default_tick_hz() -> u32 {
    64
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_hz: default_tick_hz(),
            net: NetConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Parses config from JSON.
    pub fn from_json_str(s: &str) -> serde_json::Result<Self> {
        serde_json::from_str(s)
    }

    /// Reads and parses a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz.max(1) as f64)
    }
}
