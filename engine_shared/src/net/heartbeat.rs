//! Per-client liveness tracking.
//!
//! A timer is healthy while the time since the last inbound packet stays
//! within the timeout. Each time the timeout is exceeded the session sends a
//! heartbeat request and the retry counter goes up; once it passes the
//! configured maximum the client is handed to the timeout removal queue.
//!
//! The timer never reads the clock itself. Callers pass `now`, which keeps the
//! check loop and the tests on the same code path.

use std::time::Duration;

use tokio::time::Instant;

/// Outcome of one [`HeartbeatTimer::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Heard from the client recently enough.
    Healthy,
    /// Timed out; send a heartbeat request. `attempt` counts from 1.
    Retry { attempt: u32 },
    /// Out of retries. Reported once; the client must be removed.
    TimedOut { attempt: u32 },
    /// Already reported as timed out, waiting for removal.
    Evicting,
}

#[derive(Debug, Clone)]
pub struct HeartbeatTimer {
    client_id: u8,
    last_reset: Instant,
    retries: u32,
    timed_out: bool,
}

impl HeartbeatTimer {
    pub fn new(client_id: u8, now: Instant) -> Self {
        Self {
            client_id,
            last_reset: now,
            retries: 0,
            timed_out: false,
        }
    }

    pub fn client_id(&self) -> u8 {
        self.client_id
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_reset)
    }

    /// Inbound traffic from the client: back to healthy with a clean slate.
    pub fn reset(&mut self, now: Instant) {
        self.retries = 0;
        self.last_reset = now;
    }

    /// Evaluates the timer. A retry restarts the elapsed clock.
    pub fn poll(&mut self, now: Instant, timeout: Duration, max_retries: u32) -> HeartbeatVerdict {
        if self.timed_out {
            return HeartbeatVerdict::Evicting;
        }
        if self.elapsed(now) <= timeout {
            return HeartbeatVerdict::Healthy;
        }

        self.retries += 1;
        self.last_reset = now;
        if self.retries > max_retries {
            self.timed_out = true;
            HeartbeatVerdict::TimedOut {
                attempt: self.retries,
            }
        } else {
            HeartbeatVerdict::Retry {
                attempt: self.retries,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(5000);
    const CHECK: Duration = Duration::from_millis(1000);

    #[test]
    fn chatty_client_never_retries() {
        let t0 = Instant::now();
        let mut timer = HeartbeatTimer::new(3, t0);

        // Packets every 4s, checks every 1s, for a simulated minute.
        for sec in 1..=60u64 {
            let now = t0 + Duration::from_secs(sec);
            if sec % 4 == 0 {
                timer.reset(now);
            }
            assert_eq!(timer.poll(now, TIMEOUT, 5), HeartbeatVerdict::Healthy);
            assert_eq!(timer.retries(), 0);
        }
    }

    #[test]
    fn silent_client_times_out_exactly_once() {
        let t0 = Instant::now();
        let mut timer = HeartbeatTimer::new(9, t0);
        let max_retries = 5;

        let mut retries = Vec::new();
        let mut timeouts = Vec::new();
        let mut now = t0;
        // Comfortably past timeout * (max_retries + 1).
        for _ in 0..60 {
            now += CHECK + Duration::from_millis(1);
            match timer.poll(now, TIMEOUT, max_retries) {
                HeartbeatVerdict::Retry { attempt } => retries.push(attempt),
                HeartbeatVerdict::TimedOut { attempt } => timeouts.push((attempt, now)),
                _ => {}
            }
        }

        assert_eq!(retries, vec![1, 2, 3, 4, 5]);
        assert_eq!(timeouts.len(), 1);
        let (attempt, at) = timeouts[0];
        assert_eq!(attempt, max_retries + 1);
        assert!(at - t0 > TIMEOUT * (max_retries + 1));
        assert!(timer.is_timed_out());
        assert_eq!(timer.poll(now + TIMEOUT * 2, TIMEOUT, max_retries), HeartbeatVerdict::Evicting);
    }

    #[test]
    fn reset_recovers_a_suspect_client() {
        let t0 = Instant::now();
        let mut timer = HeartbeatTimer::new(1, t0);

        let late = t0 + TIMEOUT + CHECK;
        assert_eq!(
            timer.poll(late, TIMEOUT, 5),
            HeartbeatVerdict::Retry { attempt: 1 }
        );

        timer.reset(late + CHECK);
        assert_eq!(timer.retries(), 0);
        assert_eq!(timer.elapsed(late + CHECK), Duration::ZERO);
        assert_eq!(timer.poll(late + CHECK * 2, TIMEOUT, 5), HeartbeatVerdict::Healthy);
    }

    #[test]
    fn zero_retries_times_out_on_first_miss() {
        let t0 = Instant::now();
        let mut timer = HeartbeatTimer::new(1, t0);
        assert_eq!(
            timer.poll(t0 + TIMEOUT + CHECK, TIMEOUT, 0),
            HeartbeatVerdict::TimedOut { attempt: 1 }
        );
    }
}
