//! Helpers shared by the loopback integration tests.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use engine_shared::config::EngineConfig;
use tokio::time::Instant;

/// Installs a test-writer subscriber. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

/// Config for a client that connects to `host`.
pub fn client_cfg(host: SocketAddr) -> EngineConfig {
    let mut cfg = EngineConfig::default();
    cfg.net.host_addr = host.ip();
    cfg.net.host_port = host.port();
    cfg
}

/// Short heartbeat settings so timeouts happen within a test.
pub fn fast_heartbeat(mut cfg: EngineConfig) -> EngineConfig {
    cfg.net.timeout_ms = 150;
    cfg.net.max_retries = 2;
    cfg.net.heartbeat_interval_ms = 20;
    cfg
}

pub fn loopback(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

/// Polls `cond` every few milliseconds until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
