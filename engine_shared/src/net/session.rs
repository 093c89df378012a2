//! UDP session manager.
//!
//! Owns the socket, the endpoint <-> client ID registry, the heartbeat timers
//! and the removal queues, and runs the connect/disconnect handshake.
//!
//! Three contexts touch this state:
//! - the receive loop, which dispatches every datagram to its packet handler;
//! - the heartbeat loop, which polls every timer on a fixed cadence;
//! - the main thread, which calls [`SessionManager::update_network`] once per tick.
//!
//! Locking happens in two layers. The session lock is a re-entrant mutex
//! around the timer map and handshake bookkeeping. It keeps the registry and
//! the timers in step. The registry ([`BijectiveMap`]) carries its own
//! reader-writer lock for its forward/reverse consistency. Order is always
//! session lock first, registry lock second. The registry never calls out
//! while locked, so the inversion cannot happen.
//!
//! Hooks and packet handlers run with the session lock held by the calling
//! thread. Because the lock is re-entrant they may call back into the session
//! (send, query, enqueue) without deadlocking.

use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    io,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU8, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use anyhow::Context;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use thiserror::Error;
use tokio::{
    net::UdpSocket,
    runtime::Handle,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::{bimap::BijectiveMap, config::NetConfig};

use super::{
    heartbeat::{HeartbeatTimer, HeartbeatVerdict},
    hooks::{Lifecycle, SessionHooks},
    packet::{encode, Packet, PacketKind},
    packet_type::{PacketTypeError, PacketTypeTable},
    removal::{RemovalCause, RemovalQueues},
};

/// ID under which a client registers the host it connected to. Also the
/// client ID of an instance that has not been assigned one.
pub const HOST_CLIENT_ID: u8 = 0;

/// Highest client ID. Also what allocation falls back to when every ID is taken.
pub const MAX_CLIENT_ID: u8 = u8::MAX;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("UDP session is already online")]
    AlreadyOnline,
    #[error("unknown packet type {0:?}")]
    UnknownPacketType(String),
    #[error(transparent)]
    PacketType(#[from] PacketTypeError),
}

/// Handshake state of a remote peer, as seen from this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unconnected,
    /// We sent a ConnectionRequest and have not been acknowledged yet.
    AwaitingAcknowledge,
    Connected,
    /// We sent a DisconnectRequest; the peer stays registered until it answers.
    AwaitingDisconnectAcknowledge,
}

/// State guarded by the session lock.
#[derive(Default)]
struct Roster {
    timers: HashMap<u8, HeartbeatTimer>,
    awaiting_ack: HashSet<SocketAddr>,
    awaiting_disconnect: HashSet<SocketAddr>,
}

/// Bound socket plus the runtime that owns it, so sends from outside the
/// runtime can still hand off a pending datagram.
#[derive(Clone)]
struct Link {
    socket: Arc<UdpSocket>,
    runtime: Handle,
}

struct Shared {
    config: RwLock<NetConfig>,
    roster: ReentrantMutex<RefCell<Roster>>,
    clients: BijectiveMap<SocketAddr, u8>,
    packet_types: RwLock<PacketTypeTable<SessionManager>>,
    hooks: RwLock<Arc<SessionHooks>>,
    removals: RemovalQueues,
    link: RwLock<Option<Link>>,
    cancel: Mutex<CancellationToken>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    client_id: AtomicU8,
    is_host: AtomicBool,
    is_online: AtomicBool,
}

/// Handle to one UDP session. Cheap to clone; clones share the session.
///
/// The background loops hold clones too, so a running session stays alive
/// until [`SessionManager::close_udp`] or [`SessionManager::shutdown`].
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

/// Non-owning handle for hooks that need to call back into their session
/// without keeping it alive.
#[derive(Clone)]
pub struct WeakSession {
    shared: Weak<Shared>,
}

impl WeakSession {
    pub fn upgrade(&self) -> Option<SessionManager> {
        self.shared.upgrade().map(|shared| SessionManager { shared })
    }
}

impl SessionManager {
    /// Creates an offline session with the built-in packet types registered.
    pub fn new(config: NetConfig) -> Self {
        let mut packet_types = PacketTypeTable::new();
        for kind in PacketKind::ALL {
            if let Err(e) = packet_types.register(kind.name(), kind.tag(), builtin_handler(kind)) {
                error!(error = %e, kind = kind.name(), "Failed to register built-in packet type");
            }
        }

        Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                roster: ReentrantMutex::new(RefCell::new(Roster::default())),
                clients: BijectiveMap::new().unwrap_or_else(|_| unreachable!()),
                packet_types: RwLock::new(packet_types),
                hooks: RwLock::new(Arc::new(SessionHooks::default())),
                removals: RemovalQueues::new(),
                link: RwLock::new(None),
                cancel: Mutex::new(CancellationToken::new()),
                tasks: Mutex::new(Vec::new()),
                client_id: AtomicU8::new(HOST_CLIENT_ID),
                is_host: AtomicBool::new(false),
                is_online: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakSession {
        WeakSession {
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn config(&self) -> NetConfig {
        self.shared.config.read().clone()
    }

    /// Replaces the network settings. Refused (returns `false`) while online.
    pub fn set_config(&self, config: NetConfig) -> bool {
        if self.is_online() {
            warn!("Network settings cannot change while the UDP session is online");
            return false;
        }
        *self.shared.config.write() = config;
        true
    }

    pub fn set_hooks(&self, hooks: SessionHooks) {
        *self.shared.hooks.write() = Arc::new(hooks);
    }

    fn hooks(&self) -> Arc<SessionHooks> {
        Arc::clone(&self.shared.hooks.read())
    }

    /// ID the host assigned to this instance. [`HOST_CLIENT_ID`] until then.
    pub fn client_id(&self) -> u8 {
        self.shared.client_id.load(Ordering::SeqCst)
    }

    pub fn is_host(&self) -> bool {
        self.shared.is_host.load(Ordering::SeqCst)
    }

    pub fn is_online(&self) -> bool {
        self.shared.is_online.load(Ordering::SeqCst)
    }

    /// Registered peers, endpoint <-> client ID.
    pub fn clients(&self) -> &BijectiveMap<SocketAddr, u8> {
        &self.shared.clients
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.link().and_then(|link| link.socket.local_addr().ok())
    }

    /// Client IDs queued for removal at the next [`Self::update_network`].
    pub fn pending_removals(&self) -> usize {
        self.shared.removals.len(RemovalCause::Timeout)
            + self.shared.removals.len(RemovalCause::Disconnect)
    }

    /// Retry count of a client's heartbeat timer, if it has one.
    pub fn heartbeat_retries(&self, client_id: u8) -> Option<u32> {
        let roster = self.shared.roster.lock();
        let retries = roster.borrow().timers.get(&client_id).map(HeartbeatTimer::retries);
        retries
    }

    pub fn peer_state(&self, endpoint: SocketAddr) -> PeerState {
        let roster = self.shared.roster.lock();
        let roster = roster.borrow();
        if self.shared.clients.contains_key(&endpoint) {
            if roster.awaiting_disconnect.contains(&endpoint) {
                PeerState::AwaitingDisconnectAcknowledge
            } else {
                PeerState::Connected
            }
        } else if roster.awaiting_ack.contains(&endpoint) {
            PeerState::AwaitingAcknowledge
        } else {
            PeerState::Unconnected
        }
    }

    /// Binds an extra packet type for the embedding application.
    pub fn register_packet_type<F>(&self, name: &str, tag: u8, handler: F) -> Result<(), SessionError>
    where
        F: Fn(&SessionManager, &Packet) + Send + Sync + 'static,
    {
        self.shared.packet_types.write().register(name, tag, handler)?;
        debug!(name, tag, "Registered packet type");
        Ok(())
    }

    pub fn packet_tag(&self, name: &str) -> Option<u8> {
        self.shared.packet_types.read().tag_of(name)
    }

    // ─── Lifecycle ───

    /// Binds the socket and spawns the receive and heartbeat loops.
    ///
    /// A host binds the configured host port, anything else an ephemeral one.
    /// Must be called from within a tokio runtime.
    pub async fn start_udp(&self, is_host: bool) -> anyhow::Result<()> {
        if self
            .shared
            .is_online
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SessionError::AlreadyOnline.into());
        }

        let cfg = self.config();
        let any: IpAddr = match cfg.host_addr {
            IpAddr::V4(_) => Ipv4Addr::UNSPECIFIED.into(),
            IpAddr::V6(_) => Ipv6Addr::UNSPECIFIED.into(),
        };
        let port = if is_host { cfg.host_port } else { 0 };
        let bound = match UdpSocket::bind(SocketAddr::new(any, port)).await {
            // Waiting for writability once lets the first `try_send_to` go straight out.
            Ok(socket) => match socket.writable().await {
                Ok(()) => socket.local_addr().map(|local| (Arc::new(socket), local)),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        let (socket, local) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                self.shared.is_online.store(false, Ordering::SeqCst);
                return Err(e).context("udp bind");
            }
        };

        *self.shared.link.write() = Some(Link {
            socket: Arc::clone(&socket),
            runtime: Handle::current(),
        });
        self.shared.is_host.store(is_host, Ordering::SeqCst);
        self.shared.client_id.store(HOST_CLIENT_ID, Ordering::SeqCst);

        let unbound = self.hooks().unbound();
        if !unbound.is_empty() {
            debug!(?unbound, "Session hooks left unbound, defaults apply");
        }

        let cancel = CancellationToken::new();
        *self.shared.cancel.lock() = cancel.clone();
        let receiver = tokio::spawn(receive_loop(self.clone(), socket, cancel.clone()));
        let heartbeat = tokio::spawn(heartbeat_loop(self.clone(), cancel));
        self.shared.tasks.lock().extend([receiver, heartbeat]);

        info!(%local, is_host, "UDP session started");
        Ok(())
    }

    /// Signals both loops to stop. Teardown happens as the receive loop exits.
    pub fn close_udp(&self) {
        debug!("Closing UDP session");
        self.shared.cancel.lock().cancel();
    }

    /// [`Self::close_udp`], then waits until teardown has finished.
    pub async fn shutdown(&self) {
        self.close_udp();
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Session task ended abnormally");
            }
        }
    }

    /// Applies queued removals. Call exactly once per simulation tick.
    ///
    /// Returns how many clients were removed.
    pub fn update_network(&self) -> usize {
        let mut removed = 0;
        while let Some((cause, client_id)) = self.shared.removals.pop_next() {
            let roster = self.shared.roster.lock();
            if self.remove_client(&roster, client_id, cause) {
                removed += 1;
            }
        }
        removed
    }

    /// Polls every heartbeat timer once. Driven by the heartbeat loop.
    pub fn check_heartbeats(&self, now: Instant) {
        let cfg = self.config();
        let timeout = cfg.timeout();
        let roster = self.shared.roster.lock();
        let verdicts: Vec<(u8, HeartbeatVerdict)> = roster
            .borrow_mut()
            .timers
            .values_mut()
            .map(|t| (t.client_id(), t.poll(now, timeout, cfg.max_retries)))
            .collect();

        for (client_id, verdict) in verdicts {
            match verdict {
                HeartbeatVerdict::Retry { attempt } => {
                    self.send_heartbeat_request(client_id);
                    debug!(
                        client_id,
                        attempt,
                        max_retries = cfg.max_retries,
                        "Sent heartbeat request"
                    );
                }
                HeartbeatVerdict::TimedOut { attempt } => {
                    self.send_heartbeat_request(client_id);
                    debug!(client_id, attempt, "Enqueueing client for removal");
                    self.shared.removals.push(RemovalCause::Timeout, client_id);
                }
                HeartbeatVerdict::Healthy | HeartbeatVerdict::Evicting => {}
            }
        }
    }

    /// Runs one datagram through the packet table as if it had just arrived.
    pub fn dispatch(&self, packet: Packet) {
        let Some(tag) = packet.tag() else {
            trace!(endpoint = %packet.endpoint(), "Empty datagram ignored");
            return;
        };
        let handler = self.shared.packet_types.read().handler(tag);
        let Some(handler) = handler else {
            warn!(tag, endpoint = %packet.endpoint(), "Unknown packet type received");
            return;
        };

        {
            let roster = self.shared.roster.lock();
            if let Some(client_id) = self.shared.clients.try_get_value(&packet.endpoint()) {
                if let Some(timer) = roster.borrow_mut().timers.get_mut(&client_id) {
                    timer.reset(Instant::now());
                }
            }
        }

        handler(self, &packet);
    }

    // ─── Sending ───

    fn link(&self) -> Option<Link> {
        self.shared.link.read().clone()
    }

    /// Sends an already-tagged datagram. Fire-and-forget; `false` if it could
    /// not be handed to the socket (offline, or the OS refused it).
    ///
    /// When the socket is momentarily not writable the send is finished on
    /// the session's runtime instead of being dropped.
    pub fn send_raw_to(&self, datagram: &[u8], endpoint: SocketAddr) -> bool {
        let Some(Link { socket, runtime }) = self.link() else {
            trace!(%endpoint, "UDP session offline, datagram dropped");
            return false;
        };
        match socket.try_send_to(datagram, endpoint) {
            Ok(_) => true,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let datagram = datagram.to_vec();
                runtime.spawn(async move {
                    if let Err(e) = socket.send_to(&datagram, endpoint).await {
                        warn!(error = %e, %endpoint, "UDP send failed");
                    }
                });
                true
            }
            Err(e) => {
                warn!(error = %e, %endpoint, "UDP send failed");
                false
            }
        }
    }

    pub fn send_to(&self, tag: u8, payload: &[u8], endpoint: SocketAddr) -> bool {
        self.send_raw_to(&encode(tag, payload), endpoint)
    }

    pub fn send_named_to(
        &self,
        name: &str,
        payload: &[u8],
        endpoint: SocketAddr,
    ) -> Result<bool, SessionError> {
        let tag = self.named_tag(name)?;
        Ok(self.send_to(tag, payload, endpoint))
    }

    /// Sends to every registered peer. Returns the number of datagrams sent.
    pub fn broadcast(&self, tag: u8, payload: &[u8]) -> usize {
        let datagram = encode(tag, payload);
        self.shared
            .clients
            .keys()
            .into_iter()
            .filter(|endpoint| self.send_raw_to(&datagram, *endpoint))
            .count()
    }

    pub fn broadcast_named(&self, name: &str, payload: &[u8]) -> Result<usize, SessionError> {
        let tag = self.named_tag(name)?;
        Ok(self.broadcast(tag, payload))
    }

    fn named_tag(&self, name: &str) -> Result<u8, SessionError> {
        self.packet_tag(name)
            .ok_or_else(|| SessionError::UnknownPacketType(name.to_string()))
    }

    fn send_kind_to(&self, kind: PacketKind, payload: &[u8], endpoint: SocketAddr) -> bool {
        self.send_to(kind.tag(), payload, endpoint)
    }

    /// Asks the configured host for a client ID.
    pub fn send_connection_request(&self) -> bool {
        let endpoint = self.config().host_endpoint();
        self.send_connection_request_to(endpoint)
    }

    pub fn send_connection_request_to(&self, endpoint: SocketAddr) -> bool {
        let roster = self.shared.roster.lock();
        let sent = self.send_kind_to(PacketKind::ConnectionRequest, &[], endpoint);
        if sent {
            roster.borrow_mut().awaiting_ack.insert(endpoint);
            debug!(%endpoint, "Sent connection request");
        }
        sent
    }

    /// Asks every registered peer to drop us. Returns the number of requests sent.
    pub fn send_disconnect_request(&self) -> usize {
        let roster = self.shared.roster.lock();
        let mut sent = 0;
        for endpoint in self.shared.clients.keys() {
            if self.send_kind_to(PacketKind::DisconnectRequest, &[], endpoint) {
                roster.borrow_mut().awaiting_disconnect.insert(endpoint);
                sent += 1;
            }
        }
        debug!(sent, "Sent disconnect requests");
        sent
    }

    pub fn send_disconnect_request_to(&self, endpoint: SocketAddr) -> bool {
        let roster = self.shared.roster.lock();
        let sent = self.send_kind_to(PacketKind::DisconnectRequest, &[], endpoint);
        if sent && self.shared.clients.contains_key(&endpoint) {
            roster.borrow_mut().awaiting_disconnect.insert(endpoint);
        }
        sent
    }

    /// Tells every registered peer that `client_id` has left.
    pub fn send_client_disconnect_alert(&self, client_id: u8) -> usize {
        debug!(client_id, "Sending disconnect alert");
        self.broadcast(PacketKind::ClientDisconnectAlert.tag(), &[client_id])
    }

    fn send_heartbeat_request(&self, client_id: u8) {
        match self.shared.clients.try_get_key(&client_id) {
            Some(endpoint) => {
                self.send_kind_to(PacketKind::HeartbeatRequest, &[client_id], endpoint);
            }
            None => warn!(
                client_id,
                "Heartbeat error: no endpoint registered for client"
            ),
        }
    }

    // ─── Registry ───

    /// Registers a peer and its heartbeat timer. Caller holds the session lock.
    fn add_client(&self, roster: &RefCell<Roster>, endpoint: SocketAddr, client_id: u8) -> bool {
        if self.shared.clients.add(endpoint, client_id).is_err() {
            warn!(
                %endpoint,
                client_id,
                client_count = self.shared.clients.len(),
                "Failed to add client, endpoint or ID already registered"
            );
            return false;
        }

        let mut roster = roster.borrow_mut();
        if roster.timers.contains_key(&client_id) {
            drop(roster);
            self.shared.clients.remove_key(&endpoint);
            warn!(%endpoint, client_id, "Failed to add client, stale heartbeat timer");
            return false;
        }
        roster
            .timers
            .insert(client_id, HeartbeatTimer::new(client_id, Instant::now()));
        roster.awaiting_ack.remove(&endpoint);
        info!(%endpoint, client_id, "Added client");
        true
    }

    /// Drops a peer from the registry and the timer map. Caller holds the session lock.
    fn remove_client(&self, roster: &RefCell<Roster>, client_id: u8, cause: RemovalCause) -> bool {
        let endpoint = self.shared.clients.remove_value(&client_id);
        let had_timer = {
            let mut roster = roster.borrow_mut();
            if let Some(endpoint) = endpoint {
                roster.awaiting_disconnect.remove(&endpoint);
            }
            roster.timers.remove(&client_id).is_some()
        };
        if endpoint.is_none() && !had_timer {
            debug!(client_id, "Client already removed");
            return false;
        }

        if cause == RemovalCause::Timeout {
            self.hooks().run_client_timeout(client_id);
        }
        info!(client_id, reason = cause.reason(), "Client disconnected");
        true
    }

    fn teardown(&self) {
        let roster = self.shared.roster.lock();
        self.shared.link.write().take();
        self.shared.clients.clear();
        {
            let mut roster = roster.borrow_mut();
            roster.timers.clear();
            roster.awaiting_ack.clear();
            roster.awaiting_disconnect.clear();
        }
        self.shared.removals.clear();
        self.shared.is_host.store(false, Ordering::SeqCst);
        self.shared.client_id.store(HOST_CLIENT_ID, Ordering::SeqCst);
        drop(roster);
        self.shared.is_online.store(false, Ordering::SeqCst);
        info!("UDP session closed");
    }

    // ─── Handlers ───

    fn receive_heartbeat_request(&self, packet: &Packet) {
        let endpoint = packet.endpoint();
        self.send_kind_to(PacketKind::HeartbeatAcknowledge, &[self.client_id()], endpoint);
        debug!(%endpoint, "Received heartbeat request, sent acknowledge");
    }

    fn receive_heartbeat_acknowledge(&self, packet: &Packet) {
        // The timer reset in `dispatch` is all an acknowledge is for.
        trace!(endpoint = %packet.endpoint(), "Heartbeat acknowledged");
    }

    fn receive_connection_request(&self, packet: &Packet) {
        let hooks = self.hooks();
        if !hooks.allows(Lifecycle::ConnectionRequest, packet) {
            debug!(endpoint = %packet.endpoint(), "Connection request vetoed");
            return;
        }

        let roster = self.shared.roster.lock();
        let client_id = lowest_unused_id(&self.shared.clients);
        if self.add_client(&roster, packet.endpoint(), client_id) {
            self.send_kind_to(PacketKind::ConnectionAcknowledge, &[client_id], packet.endpoint());
            hooks.run_after(Lifecycle::ConnectionRequest, packet);
        }
    }

    fn receive_connection_acknowledge(&self, packet: &Packet) {
        let hooks = self.hooks();
        if !hooks.allows(Lifecycle::ConnectionAcknowledge, packet) {
            return;
        }
        let Some(&assigned) = packet.payload().first() else {
            debug!(endpoint = %packet.endpoint(), "Connection acknowledge without an ID ignored");
            return;
        };

        let roster = self.shared.roster.lock();
        if self.add_client(&roster, packet.endpoint(), HOST_CLIENT_ID) {
            self.shared.client_id.store(assigned, Ordering::SeqCst);
            info!(client_id = assigned, host = %packet.endpoint(), "Connected to host");
            hooks.run_after(Lifecycle::ConnectionAcknowledge, packet);
        }
    }

    fn receive_disconnect_request(&self, packet: &Packet) {
        let hooks = self.hooks();
        if !hooks.allows(Lifecycle::DisconnectRequest, packet) {
            return;
        }

        let _roster = self.shared.roster.lock();
        if let Some(client_id) = self.shared.clients.try_get_value(&packet.endpoint()) {
            self.shared.removals.push(RemovalCause::Disconnect, client_id);
            self.send_kind_to(PacketKind::DisconnectAcknowledge, &[], packet.endpoint());
            hooks.run_after(Lifecycle::DisconnectRequest, packet);
        }
    }

    fn receive_disconnect_acknowledge(&self, packet: &Packet) {
        let hooks = self.hooks();
        if !hooks.allows(Lifecycle::DisconnectAcknowledge, packet) {
            return;
        }

        let _roster = self.shared.roster.lock();
        if let Some(client_id) = self.shared.clients.try_get_value(&packet.endpoint()) {
            self.shared.removals.push(RemovalCause::Disconnect, client_id);
            hooks.run_after(Lifecycle::DisconnectAcknowledge, packet);
        }
    }

    fn receive_client_disconnect_alert(&self, packet: &Packet) {
        let hooks = self.hooks();
        if !hooks.allows(Lifecycle::ClientDisconnectAlert, packet) {
            return;
        }
        let Some(&client_id) = packet.payload().first() else {
            return;
        };

        let _roster = self.shared.roster.lock();
        if self.shared.clients.contains_value(&client_id) {
            self.shared.removals.push(RemovalCause::Disconnect, client_id);
        }
        hooks.run_after(Lifecycle::ClientDisconnectAlert, packet);
    }
}

fn builtin_handler(kind: PacketKind) -> fn(&SessionManager, &Packet) {
    match kind {
        PacketKind::HeartbeatRequest => SessionManager::receive_heartbeat_request,
        PacketKind::HeartbeatAcknowledge => SessionManager::receive_heartbeat_acknowledge,
        PacketKind::ConnectionRequest => SessionManager::receive_connection_request,
        PacketKind::ConnectionAcknowledge => SessionManager::receive_connection_acknowledge,
        PacketKind::DisconnectRequest => SessionManager::receive_disconnect_request,
        PacketKind::DisconnectAcknowledge => SessionManager::receive_disconnect_acknowledge,
        PacketKind::ClientDisconnectAlert => SessionManager::receive_client_disconnect_alert,
    }
}

/// Lowest client ID in `1..=255` not present in the registry.
///
/// When every ID is taken this returns [`MAX_CLIENT_ID`] even though it is in
/// use. The registry then rejects the duplicate and the request goes
/// unanswered.
pub fn lowest_unused_id(clients: &BijectiveMap<SocketAddr, u8>) -> u8 {
    let free = clients.with_read(|forward| {
        let used: HashSet<u8> = forward.values().copied().collect();
        (1..=MAX_CLIENT_ID).find(|id| !used.contains(id))
    });
    free.unwrap_or_else(|| {
        warn!(
            client_id = MAX_CLIENT_ID,
            "Client IDs exhausted, falling back to the last ID"
        );
        MAX_CLIENT_ID
    })
}

fn is_connection_reset(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
    )
}

async fn receive_loop(session: SessionManager, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = vec![0u8; session.config().recv_buffer_bytes.max(1)];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("UDP receive loop cancelled");
                break;
            }
            res = socket.recv_from(&mut buf) => {
                match res {
                    Ok((n, from)) => {
                        let packet = Packet::copy_from(&buf[..n], from);
                        let dispatched =
                            panic::catch_unwind(AssertUnwindSafe(|| session.dispatch(packet)));
                        if dispatched.is_err() {
                            error!(endpoint = %from, "Packet handler panicked, datagram dropped");
                        }
                    }
                    // An unreachable remote port surfaces as ICMP; a datagram
                    // socket has no connection to reset, so keep receiving.
                    Err(e) if is_connection_reset(&e) => {
                        debug!(error = %e, "Ignoring connection reset on UDP socket");
                    }
                    Err(e) => {
                        error!(error = %e, "Network error, the UDP socket failed");
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
    drop(socket);
    session.teardown();
}

async fn heartbeat_loop(session: SessionManager, cancel: CancellationToken) {
    let period = session
        .config()
        .heartbeat_interval()
        .max(Duration::from_millis(1));
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => session.check_heartbeats(Instant::now()),
        }
    }
    debug!("Heartbeat loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn ep(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn offline_session() -> SessionManager {
        SessionManager::new(NetConfig {
            timeout_ms: 100,
            max_retries: 2,
            ..NetConfig::default()
        })
    }

    fn connect(session: &SessionManager, port: u16) -> Option<u8> {
        session.dispatch(Packet::tagged(PacketKind::ConnectionRequest.tag(), &[], ep(port)));
        session.clients().try_get_value(&ep(port))
    }

    #[test]
    fn lowest_unused_id_fills_holes() {
        let clients = BijectiveMap::<SocketAddr, u8>::new().unwrap();
        assert_eq!(lowest_unused_id(&clients), 1);
        clients.add(ep(1), 1).unwrap();
        clients.add(ep(2), 2).unwrap();
        clients.add(ep(3), 3).unwrap();
        clients.remove_value(&2);
        assert_eq!(lowest_unused_id(&clients), 2);

        // The host registered at 0 does not take a slot.
        clients.add(ep(9), HOST_CLIENT_ID).unwrap();
        clients.add(ep(2), 2).unwrap();
        assert_eq!(lowest_unused_id(&clients), 4);
    }

    #[test]
    fn exhausted_ids_fall_back_to_max() {
        let clients = BijectiveMap::<SocketAddr, u8>::new().unwrap();
        for id in 1..=MAX_CLIENT_ID {
            clients.add(ep(1000 + id as u16), id).unwrap();
        }
        assert_eq!(lowest_unused_id(&clients), MAX_CLIENT_ID);
    }

    #[test]
    fn connection_requests_assign_lowest_ids() {
        let session = offline_session();
        assert_eq!(connect(&session, 5001), Some(1));
        assert_eq!(connect(&session, 5002), Some(2));
        assert_eq!(session.heartbeat_retries(1), Some(0));
        assert_eq!(session.peer_state(ep(5001)), PeerState::Connected);

        // A repeat request from a registered endpoint changes nothing.
        assert_eq!(connect(&session, 5001), Some(1));
        assert_eq!(session.clients().len(), 2);
    }

    #[test]
    fn vetoed_connection_request_is_dropped() {
        let session = offline_session();
        let after = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&after);
        session.set_hooks(
            SessionHooks::new()
                .on_connection_request(|p| p.port() != 6666)
                .after_connection_request(move |_| {
                    a.fetch_add(1, Ordering::SeqCst);
                }),
        );

        assert_eq!(connect(&session, 6666), None);
        assert_eq!(connect(&session, 6667), Some(1));
        assert_eq!(after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn disconnect_request_removes_on_next_update() {
        let session = offline_session();
        connect(&session, 5001);
        connect(&session, 5002);

        session.dispatch(Packet::tagged(PacketKind::DisconnectRequest.tag(), &[], ep(5001)));
        assert_eq!(session.pending_removals(), 1);
        // Still registered until the main thread ticks.
        assert!(session.clients().contains_value(&1));

        assert_eq!(session.update_network(), 1);
        assert!(!session.clients().contains_value(&1));
        assert_eq!(session.heartbeat_retries(1), None);
        assert_eq!(session.pending_removals(), 0);

        // The freed ID is reused.
        assert_eq!(connect(&session, 5003), Some(1));
    }

    #[test]
    fn disconnect_from_unknown_endpoint_is_ignored() {
        let session = offline_session();
        session.dispatch(Packet::tagged(PacketKind::DisconnectRequest.tag(), &[], ep(1)));
        session.dispatch(Packet::tagged(PacketKind::DisconnectAcknowledge.tag(), &[], ep(1)));
        assert_eq!(session.pending_removals(), 0);
    }

    #[test]
    fn silent_client_times_out_once() {
        let session = offline_session();
        let timeouts = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&timeouts);
        session.set_hooks(SessionHooks::new().on_client_timeout(move |id| {
            assert_eq!(id, 1);
            t.fetch_add(1, Ordering::SeqCst);
        }));
        connect(&session, 5001);

        let cfg = session.config();
        let step = Duration::from_millis(30);
        let mut now = Instant::now();
        let end = now + cfg.timeout() * (cfg.max_retries + 2);
        while now < end {
            now += step;
            session.check_heartbeats(now);
        }

        assert_eq!(session.pending_removals(), 1);
        assert_eq!(session.update_network(), 1);
        assert!(session.clients().is_empty());
        assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn inbound_traffic_resets_retries() {
        let session = offline_session();
        connect(&session, 5001);

        let later = Instant::now() + session.config().timeout() * 2;
        session.check_heartbeats(later);
        assert_eq!(session.heartbeat_retries(1), Some(1));

        session.dispatch(Packet::tagged(PacketKind::HeartbeatAcknowledge.tag(), &[1], ep(5001)));
        assert_eq!(session.heartbeat_retries(1), Some(0));
    }

    #[test]
    fn connection_acknowledge_adopts_assigned_id() {
        let session = offline_session();
        let host = ep(51234);

        session.dispatch(Packet::tagged(PacketKind::ConnectionAcknowledge.tag(), &[], host));
        assert!(session.clients().is_empty());

        session.dispatch(Packet::tagged(PacketKind::ConnectionAcknowledge.tag(), &[7], host));
        assert_eq!(session.client_id(), 7);
        assert_eq!(session.clients().try_get_value(&host), Some(HOST_CLIENT_ID));
    }

    #[test]
    fn disconnect_alert_enqueues_known_ids_only() {
        let session = offline_session();
        connect(&session, 5001);
        connect(&session, 5002);

        let alert = PacketKind::ClientDisconnectAlert.tag();
        session.dispatch(Packet::tagged(alert, &[2], ep(5001)));
        session.dispatch(Packet::tagged(alert, &[99], ep(5001)));
        session.dispatch(Packet::tagged(alert, &[], ep(5001)));
        assert_eq!(session.pending_removals(), 1);

        session.update_network();
        assert_eq!(session.clients().keys(), vec![ep(5001)]);
    }

    #[test]
    fn unknown_and_empty_datagrams_are_dropped() {
        let session = offline_session();
        session.dispatch(Packet::copy_from(&[200, 1, 2], ep(1)));
        session.dispatch(Packet::copy_from(&[], ep(1)));
        assert!(session.clients().is_empty());
        assert_eq!(session.pending_removals(), 0);
    }

    #[test]
    fn broadcast_without_clients_sends_nothing() {
        let session = offline_session();
        assert_eq!(session.send_disconnect_request(), 0);
        assert_eq!(session.broadcast(40, b"hi"), 0);
        assert_eq!(session.pending_removals(), 0);
    }

    #[test]
    fn custom_packet_types_dispatch_and_reject_duplicates() {
        let session = offline_session();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        session
            .register_packet_type("Chat", 40, move |_, p| {
                assert_eq!(p.payload(), b"hi");
                h.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        let dup = session.register_packet_type("Whisper", 40, |_, _| {});
        assert!(matches!(
            dup,
            Err(SessionError::PacketType(PacketTypeError::DuplicateTag(40)))
        ));
        assert!(session
            .register_packet_type("Heartbeat", PacketKind::HeartbeatRequest.tag(), |_, _| {})
            .is_err());

        assert_eq!(session.packet_tag("Chat"), Some(40));
        session.dispatch(Packet::tagged(40, b"hi", ep(1)));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert!(matches!(
            session.broadcast_named("Nope", &[]),
            Err(SessionError::UnknownPacketType(_))
        ));
    }

    #[test]
    fn hooks_may_reenter_the_session() {
        let session = offline_session();
        let observer = session.clone();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&seen);
        session.set_hooks(SessionHooks::new().after_connection_request(move |p| {
            // Runs with the session lock held on this thread.
            assert_eq!(observer.peer_state(p.endpoint()), PeerState::Connected);
            s.store(observer.clients().len(), Ordering::SeqCst);
        }));

        connect(&session, 5001);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn restart_after_shutdown() -> anyhow::Result<()> {
        let session = SessionManager::new(NetConfig::default());
        session.start_udp(false).await?;
        assert!(session.is_online());
        assert!(!session.is_host());
        assert!(session.local_addr().is_some());
        assert!(!session.set_config(NetConfig::default()));
        assert!(matches!(
            session
                .start_udp(false)
                .await
                .unwrap_err()
                .downcast_ref::<SessionError>(),
            Some(SessionError::AlreadyOnline)
        ));

        session.shutdown().await;
        assert!(!session.is_online());
        assert!(session.local_addr().is_none());

        session.start_udp(false).await?;
        assert!(session.is_online());
        session.shutdown().await;
        Ok(())
    }

    async fn loopback_host() -> anyhow::Result<(SessionManager, SocketAddr)> {
        let host = SessionManager::new(NetConfig {
            host_port: 0,
            ..NetConfig::default()
        });
        host.start_udp(true).await?;
        let port = host.local_addr().context("host offline")?.port();
        Ok((host, ep(port)))
    }

    async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            time::sleep(Duration::from_millis(10)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn first_send_after_start_is_delivered() -> anyhow::Result<()> {
        let (host, host_addr) = loopback_host().await?;
        let client = SessionManager::new(NetConfig::default());
        client.start_udp(false).await?;

        // One request, no retry.
        assert!(client.send_connection_request_to(host_addr));
        assert_eq!(client.peer_state(host_addr), PeerState::AwaitingAcknowledge);

        assert!(eventually(|| client.client_id() == 1).await);
        assert_eq!(host.clients().len(), 1);
        assert_eq!(client.peer_state(host_addr), PeerState::Connected);

        client.shutdown().await;
        host.shutdown().await;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_send_after_start_is_delivered_multi_thread() -> anyhow::Result<()> {
        let (host, host_addr) = loopback_host().await?;
        let client = SessionManager::new(NetConfig::default());
        client.start_udp(false).await?;

        assert!(client.send_connection_request_to(host_addr));
        assert!(eventually(|| host.clients().len() == 1).await);

        client.shutdown().await;
        host.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn panicking_hook_keeps_session_usable() -> anyhow::Result<()> {
        let (host, host_addr) = loopback_host().await?;
        host.set_hooks(SessionHooks::new().on_connection_request(|_| panic!("hook failure")));
        let peer = UdpSocket::bind(ep(0)).await?;
        let mut buf = [0u8; 8];

        peer.send_to(&[2], host_addr).await?;
        let reply = time::timeout(Duration::from_millis(100), peer.recv_from(&mut buf)).await;
        assert!(reply.is_err());
        assert!(host.is_online());

        // The receive loop survived and answers once the hook behaves.
        host.set_hooks(SessionHooks::new());
        peer.send_to(&[2], host_addr).await?;
        let (n, _) = time::timeout(Duration::from_secs(2), peer.recv_from(&mut buf)).await??;
        assert_eq!(&buf[..n], &[3, 1]);

        host.shutdown().await;
        assert!(!host.is_online());
        host.start_udp(true).await?;
        host.shutdown().await;
        Ok(())
    }
}
