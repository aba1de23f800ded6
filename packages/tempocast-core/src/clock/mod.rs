//! Clock discipline: the local estimate of the shared virtual timescale.
//!
//! Every endpoint models shared time as
//! `τ ≈ t_local + offset + drift · (t_local − t_anchor)` and refines
//! `(offset, drift)` from four-timestamp round-trip probes. Offset fusion is
//! a fixed-gain EMA; drift is a windowed least-squares slope over recent
//! samples. Both are synchronous, allocation-free past the sample ring, and
//! bounded O(ring) so the shared mutex stays cheap for the reader, driver
//! and scheduler tasks that all consult `now()`.

mod driver;

pub use driver::{LinkStats, SyncProbeDriver};

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::protocol_constants::{
    CLOCK_SAMPLE_CAPACITY, DRIFT_DENOM_EPSILON, DRIFT_MIN_SAMPLES, DRIFT_WINDOW,
    OFFSET_EMA_ALPHA, RTT_REJECT_FACTOR, RTT_REJECT_FLOOR, RTT_REJECT_MIN_SAMPLES,
};
use crate::utils::{median, monotonic_secs};

/// One accepted probe measurement.
#[derive(Debug, Clone, Copy)]
pub struct ClockSample {
    /// Instantaneous offset measurement, seconds.
    pub offset_meas: f64,
    /// Round-trip time of the probe, seconds. Always ≥ 0.
    pub rtt: f64,
    /// Local monotonic receive time of the reply, seconds.
    pub t_local_recv: f64,
}

/// Local model of the shared virtual clock.
///
/// Purely synchronous; wrap in [`SharedClock`] for cross-task use. The state
/// survives disconnects as a warm start and is never reset on failover -
/// the first probes to a new master converge the offset through the normal
/// EMA instead.
#[derive(Debug)]
pub struct DisciplinedClock {
    offset: f64,
    drift: f64,
    t_anchor: f64,
    last_rtt: f64,
    samples: VecDeque<ClockSample>,
}

impl DisciplinedClock {
    /// Creates a fresh clock with zero offset and drift.
    #[must_use]
    pub fn new() -> Self {
        Self {
            offset: 0.0,
            drift: 0.0,
            t_anchor: 0.0,
            last_rtt: 0.0,
            samples: VecDeque::with_capacity(CLOCK_SAMPLE_CAPACITY),
        }
    }

    /// Shared time at local monotonic time `t_local`.
    #[must_use]
    pub fn now_at(&self, t_local: f64) -> f64 {
        t_local + self.offset + self.drift * (t_local - self.t_anchor)
    }

    /// Shared time "now".
    #[must_use]
    pub fn now(&self) -> f64 {
        self.now_at(monotonic_secs())
    }

    /// Current additive offset estimate, seconds.
    #[must_use]
    pub fn offset(&self) -> f64 {
        self.offset
    }

    /// Current drift estimate, seconds per second.
    #[must_use]
    pub fn drift(&self) -> f64 {
        self.drift
    }

    /// RTT of the most recently accepted sample, seconds.
    #[must_use]
    pub fn last_rtt(&self) -> f64 {
        self.last_rtt
    }

    /// Number of samples currently in the ring.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Clears all state back to a fresh instance.
    pub fn reset(&mut self) {
        self.offset = 0.0;
        self.drift = 0.0;
        self.t_anchor = 0.0;
        self.last_rtt = 0.0;
        self.samples.clear();
    }

    /// Feeds a full four-timestamp probe.
    ///
    /// `t1`/`t4` are local monotonic send/receive times; `t2`/`t3` are the
    /// peer's receive/transmit times in the shared timescale. Returns `true`
    /// if the sample was accepted.
    pub fn submit_probe(&mut self, t1: f64, t2: f64, t3: f64, t4: f64) -> bool {
        let rtt = (t4 - t1) - (t3 - t2);
        let offset_meas = ((t2 - t1) + (t3 - t4)) / 2.0;
        self.fuse(offset_meas, rtt, t4, OFFSET_EMA_ALPHA)
    }

    /// Feeds a heartbeat-derived quick estimate.
    ///
    /// Quick samples come from a one-way estimator and are noisier than full
    /// probes, so they fuse at half weight.
    pub fn submit_quick(&mut self, offset_est: f64, rtt_est: f64) -> bool {
        self.fuse(offset_est, rtt_est, monotonic_secs(), OFFSET_EMA_ALPHA / 2.0)
    }

    /// Validates, records and fuses one measurement. Degenerate arithmetic
    /// (NaN, infinities) leaves every field untouched.
    fn fuse(&mut self, offset_meas: f64, rtt: f64, t_local_recv: f64, alpha: f64) -> bool {
        if !offset_meas.is_finite() || !rtt.is_finite() || !t_local_recv.is_finite() {
            return false;
        }
        if rtt < 0.0 {
            return false;
        }
        if self.is_rtt_spike(rtt) {
            return false;
        }

        let fused = (1.0 - alpha) * self.offset + alpha * offset_meas;
        if !fused.is_finite() {
            return false;
        }

        if self.samples.len() == CLOCK_SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(ClockSample {
            offset_meas,
            rtt,
            t_local_recv,
        });

        self.offset = fused;
        self.last_rtt = rtt;
        self.t_anchor = t_local_recv;
        self.update_drift();
        true
    }

    /// Spike rejection: an RTT beyond 3× the median of the last 10 samples
    /// is discarded. A floor keeps near-zero-RTT links from rejecting
    /// everything once the median collapses.
    fn is_rtt_spike(&self, rtt: f64) -> bool {
        if self.samples.len() < RTT_REJECT_MIN_SAMPLES {
            return false;
        }
        let window: Vec<f64> = self
            .samples
            .iter()
            .rev()
            .take(DRIFT_WINDOW)
            .map(|s| s.rtt)
            .collect();
        match median(&window) {
            Some(m) => rtt > (RTT_REJECT_FACTOR * m).max(RTT_REJECT_FLOOR),
            None => false,
        }
    }

    /// Ordinary least squares of `offset_meas` against `t_local_recv` over
    /// the last `min(10, n)` samples. The slope becomes the drift estimate;
    /// a degenerate denominator leaves drift unchanged.
    fn update_drift(&mut self) {
        let n = self.samples.len();
        if n < DRIFT_MIN_SAMPLES {
            return;
        }
        let window = n.min(DRIFT_WINDOW);
        let recent = self.samples.iter().skip(n - window);

        let mut sum_x = 0.0;
        let mut sum_y = 0.0;
        let mut sum_xx = 0.0;
        let mut sum_xy = 0.0;
        for s in recent {
            sum_x += s.t_local_recv;
            sum_y += s.offset_meas;
            sum_xx += s.t_local_recv * s.t_local_recv;
            sum_xy += s.t_local_recv * s.offset_meas;
        }
        let count = window as f64;
        let denom = count * sum_xx - sum_x * sum_x;
        if !denom.is_finite() || denom.abs() < DRIFT_DENOM_EPSILON {
            return;
        }
        let slope = (count * sum_xy - sum_x * sum_y) / denom;
        if slope.is_finite() {
            self.drift = slope;
        }
    }
}

impl Default for DisciplinedClock {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Cross-task handle to a [`DisciplinedClock`].
///
/// The mutex guards critical sections that are O(ring) and never perform
/// I/O or allocation beyond the ring, so contention between the network
/// reader, periodic drivers and the scheduler stays negligible.
#[derive(Clone)]
pub struct SharedClock {
    inner: Arc<Mutex<DisciplinedClock>>,
}

impl SharedClock {
    /// Creates a fresh shared clock.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DisciplinedClock::new())),
        }
    }

    /// Seeds the offset so `now()` starts at `epoch + t_local`. Used by the
    /// first master to anchor the shared timescale; disciplined peers
    /// converge to it through probes.
    pub fn seed_epoch(&self, epoch: f64) {
        let mut clock = self.inner.lock();
        clock.offset = epoch;
        clock.t_anchor = monotonic_secs();
    }

    /// Shared time "now".
    #[must_use]
    pub fn now(&self) -> f64 {
        self.inner.lock().now()
    }

    /// Current offset estimate, seconds.
    #[must_use]
    pub fn offset(&self) -> f64 {
        self.inner.lock().offset()
    }

    /// Current drift estimate, seconds per second.
    #[must_use]
    pub fn drift(&self) -> f64 {
        self.inner.lock().drift()
    }

    /// RTT of the most recently accepted sample, seconds.
    #[must_use]
    pub fn last_rtt(&self) -> f64 {
        self.inner.lock().last_rtt()
    }

    /// Number of samples currently in the ring.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.inner.lock().sample_count()
    }

    /// Feeds a full probe; see [`DisciplinedClock::submit_probe`].
    pub fn submit_probe(&self, t1: f64, t2: f64, t3: f64, t4: f64) -> bool {
        self.inner.lock().submit_probe(t1, t2, t3, t4)
    }

    /// Feeds a quick sample; see [`DisciplinedClock::submit_quick`].
    pub fn submit_quick(&self, offset_est: f64, rtt_est: f64) -> bool {
        self.inner.lock().submit_quick(offset_est, rtt_est)
    }

    /// Clears all state.
    pub fn reset(&self) {
        self.inner.lock().reset();
    }

    /// Converts a shared-time instant to a delay from now, seconds.
    /// Negative results mean the instant is already past.
    #[must_use]
    pub fn seconds_until(&self, shared_instant: f64) -> f64 {
        shared_instant - self.now()
    }
}

impl Default for SharedClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol_constants::OFFSET_EMA_ALPHA;

    const EPS: f64 = 1e-9;

    #[test]
    fn first_probe_applies_ema_from_zero() {
        // Server is 1000.05s ahead, zero RTT, zero drift.
        let mut clock = DisciplinedClock::new();
        assert!(clock.submit_probe(0.0, 1000.05, 1000.05, 0.0));
        assert!((clock.offset() - 100.005).abs() < EPS);
        assert!((clock.now_at(0.0) - 100.005).abs() < EPS);
        assert!((clock.last_rtt() - 0.0).abs() < EPS);
    }

    #[test]
    fn repeated_probes_converge_to_true_offset() {
        let mut clock = DisciplinedClock::new();
        let true_offset = 1000.05;
        for i in 0..200 {
            let t_local = i as f64;
            let t_server = t_local + true_offset;
            assert!(clock.submit_probe(t_local, t_server, t_server, t_local));
        }
        let t_local = 200.0;
        let tau = t_local + true_offset;
        assert!(
            (clock.now_at(t_local) - tau).abs() < 0.001,
            "converged to {} vs τ {}",
            clock.now_at(t_local),
            tau
        );
    }

    #[test]
    fn offset_update_is_bounded_by_ema_gain() {
        let mut clock = DisciplinedClock::new();
        clock.submit_probe(0.0, 1.0, 1.0, 0.0);
        let old = clock.offset();
        let meas = 5.0;
        clock.submit_probe(1.0, 1.0 + meas, 1.0 + meas, 1.0);
        // Second measurement is offset_meas = meas exactly (zero RTT).
        let bound = OFFSET_EMA_ALPHA * (meas - old).abs() + 1e-12;
        assert!((clock.offset() - old).abs() <= bound);
    }

    #[test]
    fn negative_rtt_is_rejected() {
        let mut clock = DisciplinedClock::new();
        // t3 − t2 exceeds t4 − t1: negative RTT.
        assert!(!clock.submit_probe(0.0, 10.0, 11.0, 0.5));
        assert_eq!(clock.sample_count(), 0);
        assert_eq!(clock.offset(), 0.0);
    }

    #[test]
    fn zero_rtt_is_accepted() {
        let mut clock = DisciplinedClock::new();
        assert!(clock.submit_probe(1.0, 2.0, 2.0, 1.0));
        assert_eq!(clock.sample_count(), 1);
    }

    #[test]
    fn rtt_spike_is_rejected_after_warmup() {
        let mut clock = DisciplinedClock::new();
        // Stable 20ms RTT history.
        for i in 0..6 {
            let t1 = i as f64;
            let t4 = t1 + 0.020;
            assert!(clock.submit_probe(t1, t1 + 0.510, t1 + 0.510, t4));
        }
        let before = clock.sample_count();
        // 500ms spike: way past 3 × 20ms.
        let t1 = 10.0;
        assert!(!clock.submit_probe(t1, t1 + 0.510, t1 + 0.510, t1 + 0.5));
        assert_eq!(clock.sample_count(), before);
    }

    #[test]
    fn ring_never_exceeds_capacity() {
        let mut clock = DisciplinedClock::new();
        for i in 0..(CLOCK_SAMPLE_CAPACITY + 15) {
            let t = i as f64;
            clock.submit_probe(t, t + 1.0, t + 1.0, t);
            assert!(clock.sample_count() <= CLOCK_SAMPLE_CAPACITY);
        }
        assert_eq!(clock.sample_count(), CLOCK_SAMPLE_CAPACITY);
    }

    #[test]
    fn drift_engages_at_three_samples() {
        let mut clock = DisciplinedClock::new();
        // Offset grows 1ms per second of local time: drift = 0.001.
        let t = [0.0, 1.0];
        for &t_local in &t {
            let off = 10.0 + 0.001 * t_local;
            clock.submit_probe(t_local, t_local + off, t_local + off, t_local);
        }
        assert_eq!(clock.drift(), 0.0, "no drift before 3 samples");
        let t_local = 2.0;
        let off = 10.0 + 0.001 * t_local;
        clock.submit_probe(t_local, t_local + off, t_local + off, t_local);
        assert!((clock.drift() - 0.001).abs() < 1e-6);
    }

    #[test]
    fn degenerate_regression_leaves_drift_unchanged() {
        let mut clock = DisciplinedClock::new();
        // All samples at the same local instant: denominator is zero.
        for _ in 0..4 {
            clock.submit_probe(1.0, 2.0, 2.0, 1.0);
        }
        assert_eq!(clock.drift(), 0.0);
    }

    #[test]
    fn nan_inputs_leave_state_unchanged() {
        let mut clock = DisciplinedClock::new();
        clock.submit_probe(0.0, 1.0, 1.0, 0.0);
        let offset = clock.offset();
        let count = clock.sample_count();
        assert!(!clock.submit_probe(f64::NAN, 1.0, 1.0, 0.0));
        assert!(!clock.submit_quick(f64::INFINITY, 0.0));
        assert_eq!(clock.offset(), offset);
        assert_eq!(clock.sample_count(), count);
    }

    #[test]
    fn reset_then_probe_matches_fresh_instance() {
        let mut seasoned = DisciplinedClock::new();
        for i in 0..10 {
            let t = i as f64;
            seasoned.submit_probe(t, t + 3.0, t + 3.0, t);
        }
        seasoned.reset();
        seasoned.submit_probe(0.0, 1000.05, 1000.05, 0.0);

        let mut fresh = DisciplinedClock::new();
        fresh.submit_probe(0.0, 1000.05, 1000.05, 0.0);

        assert_eq!(seasoned.offset(), fresh.offset());
        assert_eq!(seasoned.drift(), fresh.drift());
    }

    #[test]
    fn quick_samples_fuse_at_half_weight() {
        let mut full = DisciplinedClock::new();
        full.submit_probe(0.0, 10.0, 10.0, 0.0);

        let mut quick = DisciplinedClock::new();
        quick.submit_quick(10.0, 0.0);

        assert!((full.offset() - 2.0 * quick.offset()).abs() < EPS);
    }

    #[test]
    fn now_is_monotone_between_updates() {
        let mut clock = DisciplinedClock::new();
        clock.submit_probe(0.0, 5.0, 5.0, 0.0);
        let mut prev = clock.now_at(0.0);
        for i in 1..100 {
            let t = i as f64 * 0.01;
            let cur = clock.now_at(t);
            assert!(cur >= prev);
            prev = cur;
        }
    }

    #[test]
    fn seeded_epoch_anchors_shared_time() {
        let shared = SharedClock::new();
        shared.seed_epoch(5000.0);
        let now = shared.now();
        assert!(now >= 5000.0 && now < 5001.0, "now = {now}");
    }
}
