//! Client implementation.
//!
//! The client maintains:
//! - A non-host [`SessionManager`] on an ephemeral port
//! - The handshake with the configured host (request, retry, acknowledge)
//! - A fixed-timestep tick that applies queued removals
//! - Console for user commands
//!
//! The protocol has no negative acknowledgement, so [`GameClient::connect`]
//! gives up on its own after the configured timeout.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use engine_shared::{
    config::EngineConfig,
    net::{PeerState, SessionHooks, SessionManager, HOST_CLIENT_ID},
};
use tokio::{
    sync::mpsc,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

/// How often an unanswered connection request is repeated.
pub const CONNECT_RETRY: Duration = Duration::from_millis(500);

/// Session events forwarded from hooks to the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The host acknowledged us and assigned this ID.
    Connected(u8),
    /// The host reported that another client left.
    PeerLeft(u8),
    /// The host asked us to disconnect.
    Kicked,
    /// The host stopped answering heartbeats.
    HostTimedOut,
}

/// High-level game client.
pub struct GameClient {
    pub cfg: EngineConfig,
    session: SessionManager,
    host: SocketAddr,
    events: mpsc::UnboundedReceiver<ClientEvent>,
    tick: u32,
    quit: bool,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameClient {
    /// Starts a session and performs the handshake with `cfg.net`'s host.
    ///
    /// Fails if the host has not acknowledged within `cfg.net.timeout_ms`.
    pub async fn connect(cfg: EngineConfig) -> anyhow::Result<Self> {
        let host = cfg.net.host_endpoint();
        info!(%host, "Connecting to host");

        let session = SessionManager::new(cfg.net.clone());
        let (tx, mut events) = mpsc::unbounded_channel();
        session.set_hooks(Self::hooks(tx));
        session
            .start_udp(false)
            .await
            .context("start client session")?;

        let deadline = Instant::now() + cfg.net.timeout();
        let mut retry = time::interval(CONNECT_RETRY);
        let client_id = loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if let ClientEvent::Connected(id) = event {
                        break id;
                    }
                }
                _ = retry.tick() => {
                    session.send_connection_request_to(host);
                }
                _ = time::sleep_until(deadline) => {
                    session.shutdown().await;
                    anyhow::bail!("host {host} did not acknowledge within {:?}", cfg.net.timeout());
                }
            }
        };

        info!(client_id, %host, "Connected to host");
        Ok(Self {
            cfg,
            session,
            host,
            events,
            tick: 0,
            quit: false,
            console_rx: None,
        })
    }

    fn hooks(tx: mpsc::UnboundedSender<ClientEvent>) -> SessionHooks {
        let (acked, alerted, kicked) = (tx.clone(), tx.clone(), tx.clone());
        SessionHooks::new()
            .after_connection_acknowledge(move |p| {
                if let Some(&id) = p.payload().first() {
                    let _ = acked.send(ClientEvent::Connected(id));
                }
            })
            .after_client_disconnect_alert(move |p| {
                if let Some(&id) = p.payload().first() {
                    let _ = alerted.send(ClientEvent::PeerLeft(id));
                }
            })
            .after_disconnect_request(move |_| {
                let _ = kicked.send(ClientEvent::Kicked);
            })
            .on_client_timeout(move |id| {
                if id == HOST_CLIENT_ID {
                    let _ = tx.send(ClientEvent::HostTimedOut);
                }
            })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// ID the host assigned to us.
    pub fn client_id(&self) -> u8 {
        self.session.client_id()
    }

    pub fn host_endpoint(&self) -> SocketAddr {
        self.host
    }

    /// True while the host is registered, including a pending disconnect.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.session.peer_state(self.host),
            PeerState::Connected | PeerState::AwaitingDisconnectAcknowledge
        )
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn should_quit(&self) -> bool {
        self.quit || !self.is_connected()
    }

    /// Executes one tick. Returns the events handled this tick.
    pub fn step(&mut self) -> Vec<ClientEvent> {
        self.process_console_commands();

        let mut handled = self.drain_events();
        self.session.update_network();
        handled.extend(self.drain_events());

        for event in &handled {
            match *event {
                ClientEvent::Connected(id) => debug!(client_id = id, "Late connection acknowledge"),
                ClientEvent::PeerLeft(id) => info!(client_id = id, "Peer left"),
                ClientEvent::Kicked => info!("Host asked us to disconnect"),
                ClientEvent::HostTimedOut => warn!(host = %self.host, "Host timed out"),
            }
        }

        self.tick += 1;
        handled
    }

    fn drain_events(&mut self) -> Vec<ClientEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Runs the client for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> Vec<ClientEvent> {
        let dt = self.cfg.tick_interval();
        let mut next = Instant::now();
        let mut events = Vec::new();

        for _ in 0..ticks {
            next += dt;
            events.extend(self.step());
            time::sleep_until(next).await;
        }
        events
    }

    /// Runs until `quit` or until the host is gone.
    pub async fn run(&mut self) {
        let dt = self.cfg.tick_interval();
        let mut next = Instant::now();
        while !self.should_quit() {
            self.step();
            next += dt;
            time::sleep_until(next).await;
        }
    }

    /// Asks the host to drop us, waits up to `grace` for the acknowledge, then closes.
    pub async fn disconnect(&mut self, grace: Duration) {
        if self.is_connected() && self.session.send_disconnect_request_to(self.host) {
            let deadline = Instant::now() + grace;
            while self.is_connected() && Instant::now() < deadline {
                self.step();
                time::sleep(self.cfg.tick_interval()).await;
            }
            if self.is_connected() {
                debug!(host = %self.host, "Disconnect not acknowledged, closing anyway");
            }
        }
        self.session.shutdown().await;
        info!(tick = self.tick, "Client shut down");
    }

    fn process_console_commands(&mut self) {
        let lines: Vec<String> = if let Some(ref mut rx) = self.console_rx {
            let mut collected = Vec::new();
            while let Ok(line) = rx.try_recv() {
                collected.push(line);
            }
            collected
        } else {
            Vec::new()
        };

        for line in lines {
            match self.exec_console(&line) {
                Ok(output) => output.iter().for_each(|l| println!("{l}")),
                Err(e) => println!("Error: {e:#}"),
            }
        }
    }

    /// Executes a console command.
    pub fn exec_console(&mut self, line: &str) -> anyhow::Result<Vec<String>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.is_empty() {
            return Ok(Vec::new());
        }

        match tokens[0] {
            "status" => {
                let mut out = vec![
                    format!("Online: {}", self.session.is_online()),
                    format!("Client ID: {}", self.client_id()),
                    format!("Host: {} {:?}", self.host, self.session.peer_state(self.host)),
                    format!("Tick: {}", self.tick),
                ];
                if let Some(local) = self.session.local_addr() {
                    out.push(format!("Local: {local}"));
                }
                Ok(out)
            }
            "disconnect" => {
                if !self.is_connected() {
                    return Ok(vec!["Not connected".to_string()]);
                }
                if self.session.send_disconnect_request_to(self.host) {
                    Ok(vec![format!("Disconnecting from {}", self.host)])
                } else {
                    anyhow::bail!("could not send disconnect request to {}", self.host)
                }
            }
            "quit" | "exit" => {
                self.quit = true;
                Ok(vec!["Quitting".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback_cfg(port: u16) -> EngineConfig {
        let mut cfg = EngineConfig::default();
        cfg.net.host_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        cfg.net.host_port = port;
        cfg.net.timeout_ms = 300;
        cfg
    }

    #[tokio::test]
    async fn connect_gives_up_without_host() -> anyhow::Result<()> {
        // Bound but silent, so the request is swallowed rather than refused.
        let silent = std::net::UdpSocket::bind("127.0.0.1:0")?;
        let cfg = loopback_cfg(silent.local_addr()?.port());

        let err = GameClient::connect(cfg).await.err().context("connect succeeded")?;
        assert!(err.to_string().contains("did not acknowledge"));
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn connect_status_disconnect() -> anyhow::Result<()> {
        let host = SessionManager::new(loopback_cfg(0).net);
        host.start_udp(true).await?;
        let port = host.local_addr().context("host offline")?.port();

        let mut client = GameClient::connect(loopback_cfg(port)).await?;
        assert_eq!(client.client_id(), 1);
        assert!(client.is_connected());
        assert_eq!(host.clients().len(), 1);

        let status = client.exec_console("status")?;
        assert!(status.contains(&"Client ID: 1".to_string()));
        assert!(status.contains(&format!("Host: 127.0.0.1:{port} Connected")));

        client.disconnect(Duration::from_secs(1)).await;
        assert!(!client.is_connected());
        assert!(!client.session().is_online());

        // The host queued our removal when it acknowledged.
        assert_eq!(host.update_network(), 1);
        assert!(host.clients().is_empty());
        host.shutdown().await;
        Ok(())
    }
}
