//! Deferred client removal.
//!
//! The receive loop and the heartbeat loop never remove clients themselves.
//! They queue the ID here and the main thread applies the removals in
//! `update_network`, once per tick.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Why a client is being removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalCause {
    Timeout,
    Disconnect,
}

impl RemovalCause {
    pub fn reason(self) -> &'static str {
        match self {
            RemovalCause::Timeout => "Connection Timed Out.",
            RemovalCause::Disconnect => "Requested Disconnect.",
        }
    }
}

/// Two FIFO queues of client IDs: timeouts and normal disconnects.
#[derive(Debug, Default)]
pub struct RemovalQueues {
    timeout: Mutex<VecDeque<u8>>,
    normal: Mutex<VecDeque<u8>>,
}

impl RemovalQueues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, cause: RemovalCause, client_id: u8) {
        self.queue(cause).lock().push_back(client_id);
    }

    pub fn pop(&self, cause: RemovalCause) -> Option<u8> {
        self.queue(cause).lock().pop_front()
    }

    /// Pops in drain order: every timeout first, then normal disconnects.
    pub fn pop_next(&self) -> Option<(RemovalCause, u8)> {
        self.pop(RemovalCause::Timeout)
            .map(|id| (RemovalCause::Timeout, id))
            .or_else(|| {
                self.pop(RemovalCause::Disconnect)
                    .map(|id| (RemovalCause::Disconnect, id))
            })
    }

    pub fn len(&self, cause: RemovalCause) -> usize {
        self.queue(cause).lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len(RemovalCause::Timeout) == 0 && self.len(RemovalCause::Disconnect) == 0
    }

    pub fn clear(&self) {
        self.timeout.lock().clear();
        self.normal.lock().clear();
    }

    fn queue(&self, cause: RemovalCause) -> &Mutex<VecDeque<u8>> {
        match cause {
            RemovalCause::Timeout => &self.timeout,
            RemovalCause::Disconnect => &self.normal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_timeouts_before_disconnects() {
        let queues = RemovalQueues::new();
        queues.push(RemovalCause::Disconnect, 4);
        queues.push(RemovalCause::Timeout, 2);
        queues.push(RemovalCause::Disconnect, 5);
        queues.push(RemovalCause::Timeout, 1);

        let order: Vec<_> = std::iter::from_fn(|| queues.pop_next()).collect();
        assert_eq!(
            order,
            vec![
                (RemovalCause::Timeout, 2),
                (RemovalCause::Timeout, 1),
                (RemovalCause::Disconnect, 4),
                (RemovalCause::Disconnect, 5),
            ]
        );
        assert!(queues.is_empty());
    }

    #[test]
    fn clear_empties_both_queues() {
        let queues = RemovalQueues::new();
        queues.push(RemovalCause::Disconnect, 4);
        queues.push(RemovalCause::Timeout, 2);
        queues.clear();
        assert_eq!(queues.len(RemovalCause::Timeout), 0);
        assert_eq!(queues.len(RemovalCause::Disconnect), 0);
    }
}
