//! General utilities shared across the application.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

// ─────────────────────────────────────────────────────────────────────────────
// Time Utilities
// ─────────────────────────────────────────────────────────────────────────────

/// Returns the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is before the Unix epoch (shouldn't happen in practice).
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Returns the current Unix timestamp as fractional seconds.
///
/// Used for wire message `timestamp` fields, which carry wall-clock seconds
/// as IEEE-754 doubles.
#[must_use]
pub fn unix_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Process-wide monotonic reference point.
///
/// All local timestamps in the clock-discipline and scheduling paths are
/// seconds since this instant, so they are immune to wall-clock steps.
fn monotonic_epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// Returns the local monotonic time in fractional seconds.
///
/// The zero point is the first call in the process; only differences are
/// meaningful.
#[must_use]
pub fn monotonic_secs() -> f64 {
    monotonic_epoch().elapsed().as_secs_f64()
}

/// Median of a slice of finite floats. Returns `None` on an empty slice.
///
/// Sorts a local copy; callers pass small windows (≤ 10 elements).
#[must_use]
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted: Vec<f64> = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Replay Suppression
// ─────────────────────────────────────────────────────────────────────────────

use std::collections::{HashSet, VecDeque};

/// Bounded set of recently seen ids, evicting oldest-first.
///
/// Backs idempotent command handling: a replayed id is detected for as long
/// as it stays within the retention window.
#[derive(Debug)]
pub struct RecentIds {
    capacity: usize,
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentIds {
    /// Creates a set retaining at most `capacity` ids.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Records an id. Returns `false` if it was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}
