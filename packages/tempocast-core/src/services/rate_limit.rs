//! Sliding-window rate limiting for the control plane.
//!
//! Three budgets from the protocol contract: clock-sync probes per session,
//! media-control commands per session, and concurrent sessions per source
//! address. Probe and command overruns answer `RATE_LIMITED` and keep the
//! session open; the per-address budget refuses the connection outright.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::protocol_constants::{
    COMMAND_RATE_LIMIT, PROBE_RATE_LIMIT, SESSIONS_PER_ADDR_LIMIT,
};

/// Sliding one-second window counter.
#[derive(Debug)]
pub struct WindowLimiter {
    capacity: usize,
    window: Duration,
    events: VecDeque<Instant>,
}

impl WindowLimiter {
    /// Creates a limiter allowing `capacity` events per `window`.
    #[must_use]
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            events: VecDeque::with_capacity(capacity),
        }
    }

    /// Tries to consume one slot at `now`.
    pub fn try_acquire_at(&mut self, now: Instant) -> bool {
        while let Some(front) = self.events.front() {
            if now.duration_since(*front) >= self.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
        if self.events.len() >= self.capacity {
            return false;
        }
        self.events.push_back(now);
        true
    }

    /// Tries to consume one slot now.
    pub fn try_acquire(&mut self) -> bool {
        self.try_acquire_at(Instant::now())
    }
}

/// Per-session message budgets.
#[derive(Debug)]
pub struct SessionLimits {
    probes: Mutex<WindowLimiter>,
    commands: Mutex<WindowLimiter>,
}

impl SessionLimits {
    /// Creates limits at the protocol defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            probes: Mutex::new(WindowLimiter::new(PROBE_RATE_LIMIT, Duration::from_secs(1))),
            commands: Mutex::new(WindowLimiter::new(
                COMMAND_RATE_LIMIT,
                Duration::from_secs(1),
            )),
        }
    }

    /// Admits one clock-sync probe, or refuses it.
    pub fn allow_probe(&self) -> bool {
        self.probes.lock().try_acquire()
    }

    /// Admits one media-control command, or refuses it.
    pub fn allow_command(&self) -> bool {
        self.commands.lock().try_acquire()
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-source-address session budget with RAII release.
pub struct ConnectionBudget {
    per_addr: DashMap<IpAddr, usize>,
    limit: usize,
}

impl ConnectionBudget {
    /// Creates a budget at the protocol default.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limit(SESSIONS_PER_ADDR_LIMIT)
    }

    /// Creates a budget with an explicit per-address limit.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            per_addr: DashMap::new(),
            limit,
        }
    }

    /// Reserves a session slot for `addr`. Returns `None` when the address
    /// is at its limit; the permit releases the slot on drop.
    pub fn try_register(self: &Arc<Self>, addr: IpAddr) -> Option<AddrPermit> {
        let mut slot = self.per_addr.entry(addr).or_insert(0);
        if *slot >= self.limit {
            return None;
        }
        *slot += 1;
        drop(slot);
        Some(AddrPermit {
            budget: Arc::clone(self),
            addr,
        })
    }

    /// Active sessions for an address.
    #[must_use]
    pub fn active(&self, addr: IpAddr) -> usize {
        self.per_addr.get(&addr).map_or(0, |c| *c)
    }
}

impl Default for ConnectionBudget {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII session slot; returning it on drop keeps the count exact even when
/// a session handler exits early.
pub struct AddrPermit {
    budget: Arc<ConnectionBudget>,
    addr: IpAddr,
}

impl Drop for AddrPermit {
    fn drop(&mut self) {
        if let Some(mut slot) = self.budget.per_addr.get_mut(&self.addr) {
            *slot = slot.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn first_ten_probes_pass_rest_refused() {
        let mut limiter = WindowLimiter::new(10, Duration::from_secs(1));
        let now = Instant::now();
        let mut accepted = 0;
        for _ in 0..20 {
            if limiter.try_acquire_at(now) {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 10);
    }

    #[test]
    fn window_refills_after_expiry() {
        let mut limiter = WindowLimiter::new(2, Duration::from_secs(1));
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0));
        assert!(!limiter.try_acquire_at(t0));
        assert!(limiter.try_acquire_at(t0 + Duration::from_millis(1500)));
    }

    #[test]
    fn addr_budget_caps_concurrent_sessions() {
        let budget = Arc::new(ConnectionBudget::with_limit(2));
        let addr = IpAddr::V4(Ipv4Addr::LOCALHOST);

        let first = budget.try_register(addr).expect("first session");
        let _second = budget.try_register(addr).expect("second session");
        assert!(budget.try_register(addr).is_none());

        drop(first);
        assert_eq!(budget.active(addr), 1);
        assert!(budget.try_register(addr).is_some());
    }
}
