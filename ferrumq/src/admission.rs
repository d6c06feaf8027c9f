//! Implements per-port connection admission and backpressure
//!
//! A shared counter with a cap, a one-shot warning with hysteresis, and
//! a closing latch used to drain the port. The warning re-arms only
//! after the count falls below the squared-percentage threshold, so a
//! count oscillating around the warning line logs once, not per
//! crossing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::Notify;

use crate::logging;

/// Why a connection was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// The connection may proceed
    Accept,

    /// The port is draining; no new connections
    RejectedClosed,

    /// The port is at its connection cap
    RejectedTooMany,
}

/// Per-port connection counter with bounds, warning hysteresis and a
/// drain latch.
#[derive(Debug)]
pub struct ConnectionAdmission {
    count: AtomicUsize,
    max_open_connections: usize,
    warn_percent: u32,
    warning_fired: AtomicBool,
    closing: AtomicBool,
    drained: Notify,
}

impl ConnectionAdmission {
    /// A controller admitting up to `max_open_connections` connections;
    /// zero means unbounded. `warn_percent` positions the warning line.
    pub fn new(max_open_connections: u32, warn_percent: u32) -> Self {
        Self {
            count: AtomicUsize::new(0),
            max_open_connections: max_open_connections as usize,
            warn_percent,
            warning_fired: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            drained: Notify::new(),
        }
    }

    /// Current connection count.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Decides whether a connection from `addr` may proceed, logging
    /// the rejection events.
    pub fn can_accept(&self, addr: SocketAddr) -> AdmissionDecision {
        if self.closing.load(Ordering::SeqCst) {
            logging::connection_rejected_closed(addr);
            return AdmissionDecision::RejectedClosed;
        }
        if self.max_open_connections > 0 && self.count() >= self.max_open_connections {
            logging::connection_rejected_too_many(addr, self.max_open_connections);
            return AdmissionDecision::RejectedTooMany;
        }
        AdmissionDecision::Accept
    }

    /// Registers an accepted connection, firing the one-shot warning on
    /// an upward crossing of the warning line.
    pub fn increment(&self) {
        let current = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.max_open_connections == 0 || self.warn_percent == 0 {
            return;
        }
        let warn_at = self.max_open_connections * self.warn_percent as usize / 100;
        if current >= warn_at
            && self
                .warning_fired
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            logging::connection_count_warn(current, self.warn_percent, self.max_open_connections);
        }
    }

    /// Unregisters a connection; re-arms the warning below the squared
    /// threshold and releases the drain signal at zero while closing.
    pub fn decrement(&self) {
        let current = self.count.fetch_sub(1, Ordering::SeqCst) - 1;
        if self.max_open_connections > 0 && self.warn_percent > 0 {
            let rearm_below = self.max_open_connections
                * (self.warn_percent * self.warn_percent) as usize
                / 10000;
            if current < rearm_below {
                self.warning_fired.store(false, Ordering::SeqCst);
            }
        }
        if current == 0 && self.closing.load(Ordering::SeqCst) {
            self.drained.notify_waiters();
        }
    }

    /// Latches the port closed; `can_accept` refuses from now on.
    pub fn begin_close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        if self.count() == 0 {
            self.drained.notify_waiters();
        }
    }

    /// Waits until the port is closing and no connections remain.
    pub async fn wait_drained(&self) {
        loop {
            // register interest before checking, so a release between
            // the check and the await is not lost
            let notified = self.drained.notified();
            if self.closing.load(Ordering::SeqCst) && self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:49152".parse().unwrap()
    }

    #[test]
    fn cap_is_enforced() {
        let admission = ConnectionAdmission::new(1, 80);
        assert_eq!(admission.can_accept(addr()), AdmissionDecision::Accept);
        admission.increment();
        assert_eq!(admission.can_accept(addr()), AdmissionDecision::RejectedTooMany);
        admission.decrement();
        assert_eq!(admission.can_accept(addr()), AdmissionDecision::Accept);
    }

    #[test]
    fn zero_cap_is_unbounded() {
        let admission = ConnectionAdmission::new(0, 80);
        for _ in 0..1000 {
            admission.increment();
        }
        assert_eq!(admission.can_accept(addr()), AdmissionDecision::Accept);
    }

    #[test]
    fn warning_fires_once_per_crossing() {
        // cap 10, warn at 8, re-arm below 10 * 0.8^2 = 6
        let admission = ConnectionAdmission::new(10, 80);
        for _ in 0..8 {
            admission.increment();
        }
        assert!(admission.warning_fired.load(Ordering::SeqCst));

        // dipping to 7 does not re-arm (>= 6)
        admission.decrement();
        assert!(admission.warning_fired.load(Ordering::SeqCst));
        admission.increment();
        assert!(admission.warning_fired.load(Ordering::SeqCst));

        // falling to 5 re-arms
        for _ in 0..3 {
            admission.decrement();
        }
        assert!(!admission.warning_fired.load(Ordering::SeqCst));
    }

    #[test]
    fn closing_latch_refuses_new_connections() {
        let admission = ConnectionAdmission::new(0, 80);
        admission.increment();
        admission.begin_close();
        assert_eq!(admission.can_accept(addr()), AdmissionDecision::RejectedClosed);
    }

    #[tokio::test]
    async fn drain_signal_fires_at_zero() {
        let admission = std::sync::Arc::new(ConnectionAdmission::new(0, 80));
        admission.increment();
        admission.begin_close();

        let waiter = {
            let admission = admission.clone();
            tokio::spawn(async move { admission.wait_drained().await })
        };
        tokio::task::yield_now().await;
        admission.decrement();
        waiter.await.unwrap();
    }
}
