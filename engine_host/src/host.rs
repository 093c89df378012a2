//! Host implementation.
//!
//! The host owns a [`SessionManager`] bound to the host port and drives it
//! from a fixed-timestep loop. Each tick:
//! - console commands (status, kick, quit) run
//! - queued client removals are applied
//! - remaining clients receive a disconnect alert for anyone who left
//!
//! Session hooks run on the receive thread. They only forward events over a
//! channel; everything else happens on the tick.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::Duration,
};

use anyhow::Context;
use engine_shared::{
    config::EngineConfig,
    net::{SessionHooks, SessionManager, WeakSession},
};
use tokio::{sync::mpsc, time::Instant};
use tracing::{debug, info, warn};

/// Lifecycle events forwarded from session hooks to the tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Joined(u8),
    Left(u8),
    TimedOut(u8),
}

/// Dedicated host.
pub struct GameHost {
    pub cfg: EngineConfig,
    session: SessionManager,
    events: mpsc::UnboundedReceiver<HostEvent>,
    tick: u32,
    quit: bool,

    /// Channel for console commands from stdin.
    console_rx: Option<mpsc::Receiver<String>>,
}

impl GameHost {
    /// Binds the host port from `cfg` and starts the session.
    pub async fn start(cfg: EngineConfig) -> anyhow::Result<Self> {
        let session = SessionManager::new(cfg.net.clone());
        let (tx, events) = mpsc::unbounded_channel();
        session.set_hooks(Self::hooks(session.downgrade(), tx));
        session
            .start_udp(true)
            .await
            .context("start host session")?;

        Ok(Self {
            cfg,
            session,
            events,
            tick: 0,
            quit: false,
            console_rx: None,
        })
    }

    fn hooks(session: WeakSession, tx: mpsc::UnboundedSender<HostEvent>) -> SessionHooks {
        let (joined, left, acked) = (tx.clone(), tx.clone(), tx.clone());
        let (join_session, leave_session, ack_session) =
            (session.clone(), session.clone(), session);
        SessionHooks::new()
            .after_connection_request(move |p| {
                // The handler still holds the session lock, so the client is registered.
                if let Some(id) = client_id_of(&join_session, p.endpoint()) {
                    let _ = joined.send(HostEvent::Joined(id));
                }
            })
            .after_disconnect_request(move |p| {
                if let Some(id) = client_id_of(&leave_session, p.endpoint()) {
                    let _ = left.send(HostEvent::Left(id));
                }
            })
            // Clients we asked to leave (kick, shutdown) answer with an acknowledge.
            .after_disconnect_acknowledge(move |p| {
                if let Some(id) = client_id_of(&ack_session, p.endpoint()) {
                    let _ = acked.send(HostEvent::Left(id));
                }
            })
            .on_client_timeout(move |id| {
                let _ = tx.send(HostEvent::TimedOut(id));
            })
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.session.local_addr().context("host session is offline")
    }

    /// Sets the console input receiver.
    pub fn set_console_input(&mut self, rx: mpsc::Receiver<String>) {
        self.console_rx = Some(rx);
    }

    pub fn should_quit(&self) -> bool {
        self.quit || !self.session.is_online()
    }

    /// Executes one tick. Returns the events handled this tick.
    pub fn step(&mut self) -> Vec<HostEvent> {
        self.process_console_commands();

        let mut handled = self.drain_events();
        self.session.update_network();
        // Timeout hooks fire inside `update_network`.
        handled.extend(self.drain_events());

        for event in &handled {
            match *event {
                HostEvent::Joined(id) => info!(client_id = id, "Client joined"),
                HostEvent::Left(id) | HostEvent::TimedOut(id) => {
                    let told = self.session.send_client_disconnect_alert(id);
                    info!(client_id = id, event = ?event, alerted = told, "Client left");
                }
            }
        }

        self.tick += 1;
        handled
    }

    fn drain_events(&mut self) -> Vec<HostEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    /// Runs the host for a number of ticks.
    pub async fn run_for_ticks(&mut self, ticks: u32) -> Vec<HostEvent> {
        let dt = self.cfg.tick_interval();
        let mut next = Instant::now();
        let mut events = Vec::new();

        for _ in 0..ticks {
            next += dt;
            events.extend(self.step());
            tokio::time::sleep_until(next).await;
        }
        events
    }

    /// Runs until `quit` or until the session goes offline.
    pub async fn run(&mut self) {
        let dt = self.cfg.tick_interval();
        let mut next = Instant::now();
        while !self.should_quit() {
            self.step();
            next += dt;
            tokio::time::sleep_until(next).await;
        }
    }

    /// Asks every client to disconnect, gives them `grace` to answer, then closes.
    pub async fn shutdown(&mut self, grace: Duration) {
        let asked = self.session.send_disconnect_request();
        debug!(asked, "Asked clients to disconnect");

        let deadline = Instant::now() + grace;
        while !self.session.clients().is_empty() && Instant::now() < deadline {
            self.step();
            tokio::time::sleep(self.cfg.tick_interval()).await;
        }
        self.session.shutdown().await;
        info!(tick = self.tick, "Host shut down");
    }

    fn process_console_commands(&mut self) {
        // Collect lines first to avoid borrow conflict
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
                    format!("Tick: {}", self.tick),
                ];
                if let Some(local) = self.session.local_addr() {
                    out.push(format!("Listening: {local}"));
                }
                let mut clients = self.session.clients().snapshot();
                clients.sort_by_key(|(_, id)| *id);
                out.push(format!("Clients: {}", clients.len()));
                for (endpoint, id) in clients {
                    out.push(format!(
                        "  {id}: {endpoint} {:?} retries={}",
                        self.session.peer_state(endpoint),
                        self.session.heartbeat_retries(id).unwrap_or_default()
                    ));
                }
                Ok(out)
            }
            "kick" => {
                let Some(arg) = tokens.get(1) else {
                    return Ok(vec!["Usage: kick <client id>".to_string()]);
                };
                let id: u8 = arg.parse().context("client id must be 0-255")?;
                let Some(endpoint) = self.session.clients().try_get_key(&id) else {
                    return Ok(vec![format!("No client with id {id}")]);
                };
                if self.session.send_disconnect_request_to(endpoint) {
                    Ok(vec![format!("Asked client {id} ({endpoint}) to disconnect")])
                } else {
                    warn!(client_id = id, %endpoint, "Kick request could not be sent");
                    Ok(vec![format!("Failed to reach client {id}")])
                }
            }
            "quit" | "exit" => {
                info!("Host shutting down");
                self.quit = true;
                Ok(vec!["Shutting down".to_string()])
            }
            other => Ok(vec![format!("Unknown command: {other}")]),
        }
    }
}

fn client_id_of(session: &WeakSession, endpoint: SocketAddr) -> Option<u8> {
    session.upgrade()?.clients().try_get_value(&endpoint)
}

/// Helper for tests: host on an ephemeral loopback port.
pub async fn bind_ephemeral(mut cfg: EngineConfig) -> anyhow::Result<(GameHost, SocketAddr)> {
    cfg.net.host_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    cfg.net.host_port = 0;
    let host = GameHost::start(cfg).await?;
    let port = host.local_addr()?.port();
    Ok((host, SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)))
}
