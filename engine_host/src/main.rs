//! Standalone host binary.
//!
//! Usage:
//!   cargo run -p engine_host -- [--config engine.json] [--ip 0.0.0.0:51234] [--tick-hz 64]
//!
//! The host binds the UDP host port, hands out client IDs to connecting
//! peers, and evicts peers that stop answering heartbeats.
//!
//! Console commands:
//!   status         - Show session status and connected clients
//!   kick <id>      - Ask a client to disconnect
//!   quit           - Disconnect everyone and exit

use std::env;
use std::time::Duration;

use anyhow::Context;
use engine_host::GameHost;
use engine_shared::{config::EngineConfig, console};
use tokio::sync::mpsc;
use tracing::info;

fn parse_args() -> anyhow::Result<EngineConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = match args.iter().position(|a| a == "--config") {
        Some(i) if i + 1 < args.len() => EngineConfig::load(&args[i + 1])?,
        _ => EngineConfig::default(),
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--ip" if i + 1 < args.len() => {
                cfg.net.apply_ip_arg(&args[i + 1]);
                i += 2;
            }
            "--tick-hz" if i + 1 < args.len() => {
                cfg.tick_hz = args[i + 1].parse().unwrap_or(64);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(port = cfg.net.host_port, tick_hz = cfg.tick_hz, "Starting host");

    let mut host = GameHost::start(cfg).await.context("start host")?;
    let local = host.local_addr()?;
    info!(%local, "Host listening");

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    host.set_console_input(console_rx);

    console::spawn_stdin_reader(console_tx);

    println!("Host ready. Type 'status' for info, 'kick <id>' to drop a client, 'quit' to exit.");
    println!();

    host.run().await;
    host.shutdown(Duration::from_secs(1)).await;
    Ok(())
}
