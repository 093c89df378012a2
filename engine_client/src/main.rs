//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p engine_client -- [--config engine.json] [--ip 127.0.0.1:51234] [--tick-hz 64]
//!
//! The client connects to the host, reports the ID it was assigned, and keeps
//! the session alive until the host drops it or the user quits.
//!
//! Console commands:
//!   status      - Show client status
//!   disconnect  - Ask the host to drop this client
//!   quit        - Disconnect and exit

use std::env;
use std::time::Duration;

use anyhow::Context;
use engine_client::GameClient;
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
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(host = %cfg.net.host_endpoint(), "Starting client");

    let mut client = GameClient::connect(cfg).await.context("connect")?;
    println!("Connected as client {}.", client.client_id());

    // Set up console input channel.
    let (console_tx, console_rx) = mpsc::channel::<String>(32);
    client.set_console_input(console_rx);

    console::spawn_stdin_reader(console_tx);

    println!("Type 'status' for info, 'disconnect' to leave, 'quit' to exit.");
    println!();

    client.run().await;
    if !client.is_connected() {
        println!("Disconnected from host.");
    }
    client.disconnect(Duration::from_secs(1)).await;
    Ok(())
}
