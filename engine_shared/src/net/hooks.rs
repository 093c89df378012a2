//! Host callback surface.
//!
//! The embedding application can veto lifecycle packets and react to them.
//! Every hook is optional. An unset filter allows the packet, and an unset
//! action does nothing.

use std::fmt;
use std::sync::Arc;

use super::packet::Packet;

/// Returns `false` to drop the packet silently.
pub type PacketFilter = Arc<dyn Fn(&Packet) -> bool + Send + Sync>;
/// Runs after the session has acted on the packet.
pub type PacketAction = Arc<dyn Fn(&Packet) + Send + Sync>;
/// Runs when a timed-out client has been removed.
pub type TimeoutAction = Arc<dyn Fn(u8) + Send + Sync>;

/// Lifecycle packets the host can filter and observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    ConnectionRequest,
    ConnectionAcknowledge,
    DisconnectRequest,
    DisconnectAcknowledge,
    ClientDisconnectAlert,
}

impl Lifecycle {
    pub const ALL: [Lifecycle; 5] = [
        Lifecycle::ConnectionRequest,
        Lifecycle::ConnectionAcknowledge,
        Lifecycle::DisconnectRequest,
        Lifecycle::DisconnectAcknowledge,
        Lifecycle::ClientDisconnectAlert,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Lifecycle::ConnectionRequest => "ConnectionRequest",
            Lifecycle::ConnectionAcknowledge => "ConnectionAcknowledge",
            Lifecycle::DisconnectRequest => "DisconnectRequest",
            Lifecycle::DisconnectAcknowledge => "DisconnectAcknowledge",
            Lifecycle::ClientDisconnectAlert => "ClientDisconnectAlert",
        }
    }
}

#[derive(Clone, Default)]
struct HookPair {
    filter: Option<PacketFilter>,
    after: Option<PacketAction>,
}

/// Set of optional lifecycle hooks, built with the `on_*`/`after_*` setters.
///
/// ```ignore
/// let hooks = SessionHooks::new()
///     .on_connection_request(|p| allow_list.contains(&p.address()))
///     .on_client_timeout(|id| info!(client_id = id, "dropped"));
/// session.set_hooks(hooks);
/// ```
#[derive(Clone, Default)]
pub struct SessionHooks {
    connection_request: HookPair,
    connection_acknowledge: HookPair,
    disconnect_request: HookPair,
    disconnect_acknowledge: HookPair,
    client_disconnect_alert: HookPair,
    client_timeout: Option<TimeoutAction>,
}

impl SessionHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connection_request(self, f: impl Fn(&Packet) -> bool + Send + Sync + 'static) -> Self {
        self.with_filter(Lifecycle::ConnectionRequest, f)
    }

    pub fn after_connection_request(self, f: impl Fn(&Packet) + Send + Sync + 'static) -> Self {
        self.with_after(Lifecycle::ConnectionRequest, f)
    }

    pub fn on_connection_acknowledge(
        self,
        f: impl Fn(&Packet) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.with_filter(Lifecycle::ConnectionAcknowledge, f)
    }

    pub fn after_connection_acknowledge(self, f: impl Fn(&Packet) + Send + Sync + 'static) -> Self {
        self.with_after(Lifecycle::ConnectionAcknowledge, f)
    }

    pub fn on_disconnect_request(self, f: impl Fn(&Packet) -> bool + Send + Sync + 'static) -> Self {
        self.with_filter(Lifecycle::DisconnectRequest, f)
    }

    pub fn after_disconnect_request(self, f: impl Fn(&Packet) + Send + Sync + 'static) -> Self {
        self.with_after(Lifecycle::DisconnectRequest, f)
    }

    pub fn on_disconnect_acknowledge(
        self,
        f: impl Fn(&Packet) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.with_filter(Lifecycle::DisconnectAcknowledge, f)
    }

    pub fn after_disconnect_acknowledge(self, f: impl Fn(&Packet) + Send + Sync + 'static) -> Self {
        self.with_after(Lifecycle::DisconnectAcknowledge, f)
    }

    pub fn on_client_disconnect_alert(
        self,
        f: impl Fn(&Packet) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.with_filter(Lifecycle::ClientDisconnectAlert, f)
    }

    pub fn after_client_disconnect_alert(self, f: impl Fn(&Packet) + Send + Sync + 'static) -> Self {
        self.with_after(Lifecycle::ClientDisconnectAlert, f)
    }

    pub fn on_client_timeout(mut self, f: impl Fn(u8) + Send + Sync + 'static) -> Self {
        self.client_timeout = Some(Arc::new(f));
        self
    }

    pub fn with_filter(
        mut self,
        event: Lifecycle,
        f: impl Fn(&Packet) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.pair_mut(event).filter = Some(Arc::new(f));
        self
    }

    pub fn with_after(mut self, event: Lifecycle, f: impl Fn(&Packet) + Send + Sync + 'static) -> Self {
        self.pair_mut(event).after = Some(Arc::new(f));
        self
    }

    /// Runs the filter for `event`. No filter means allow.
    pub fn allows(&self, event: Lifecycle, packet: &Packet) -> bool {
        self.pair(event).filter.as_ref().map_or(true, |f| f(packet))
    }

    pub fn run_after(&self, event: Lifecycle, packet: &Packet) {
        if let Some(f) = &self.pair(event).after {
            f(packet);
        }
    }

    pub fn run_client_timeout(&self, client_id: u8) {
        if let Some(f) = &self.client_timeout {
            f(client_id);
        }
    }

    /// Names of the hooks nobody installed.
    pub fn unbound(&self) -> Vec<String> {
        let mut out = Vec::new();
        for event in Lifecycle::ALL {
            let pair = self.pair(event);
            if pair.filter.is_none() {
                out.push(format!("on{}", event.name()));
            }
            if pair.after.is_none() {
                out.push(format!("after{}", event.name()));
            }
        }
        if self.client_timeout.is_none() {
            out.push("onClientTimeout".to_string());
        }
        out
    }

    fn pair(&self, event: Lifecycle) -> &HookPair {
        match event {
            Lifecycle::ConnectionRequest => &self.connection_request,
            Lifecycle::ConnectionAcknowledge => &self.connection_acknowledge,
            Lifecycle::DisconnectRequest => &self.disconnect_request,
            Lifecycle::DisconnectAcknowledge => &self.disconnect_acknowledge,
            Lifecycle::ClientDisconnectAlert => &self.client_disconnect_alert,
        }
    }

    fn pair_mut(&mut self, event: Lifecycle) -> &mut HookPair {
        match event {
            Lifecycle::ConnectionRequest => &mut self.connection_request,
            Lifecycle::ConnectionAcknowledge => &mut self.connection_acknowledge,
            Lifecycle::DisconnectRequest => &mut self.disconnect_request,
            Lifecycle::DisconnectAcknowledge => &mut self.disconnect_acknowledge,
            Lifecycle::ClientDisconnectAlert => &mut self.client_disconnect_alert,
        }
    }
}

impl fmt::Debug for SessionHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHooks")
            .field("unbound", &self.unbound())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

    fn packet() -> Packet {
        Packet::tagged(2, &[], "127.0.0.1:7000".parse().unwrap())
    }

    #[test]
    fn unset_hooks_allow_and_do_nothing() {
        let hooks = SessionHooks::new();
        for event in Lifecycle::ALL {
            assert!(hooks.allows(event, &packet()));
            hooks.run_after(event, &packet());
        }
        hooks.run_client_timeout(3);
        assert_eq!(hooks.unbound().len(), 11);
    }

    #[test]
    fn filters_are_scoped_to_their_event() {
        let hooks = SessionHooks::new().on_connection_request(|_| false);
        assert!(!hooks.allows(Lifecycle::ConnectionRequest, &packet()));
        assert!(hooks.allows(Lifecycle::DisconnectRequest, &packet()));
        assert!(!hooks.unbound().contains(&"onConnectionRequest".to_string()));
    }

    #[test]
    fn actions_fire() {
        let after = Arc::new(AtomicUsize::new(0));
        let timed_out = Arc::new(AtomicU8::new(0));
        let (a, t) = (Arc::clone(&after), Arc::clone(&timed_out));
        let hooks = SessionHooks::new()
            .after_disconnect_acknowledge(move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .on_client_timeout(move |id| t.store(id, Ordering::SeqCst));

        hooks.run_after(Lifecycle::DisconnectAcknowledge, &packet());
        hooks.run_after(Lifecycle::DisconnectRequest, &packet());
        hooks.run_client_timeout(17);

        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(timed_out.load(Ordering::SeqCst), 17);
    }
}
