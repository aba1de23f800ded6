//! Periodic sync probe driver.
//!
//! Sends one four-timestamp probe per interval and feeds replies into the
//! disciplined clock. The outstanding probe's `t1` is per-session state
//! keyed by probe id, cleared on reply or replaced on the next tick - at
//! most one probe is ever in flight. Missing replies are counted as losses
//! and silently superseded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::SharedClock;
use crate::protocol::{Envelope, Message};
use crate::utils::monotonic_secs;

/// Probe delivery counters shared with the quality sampler.
///
/// Loss here is probe loss: the fraction of issued probes that never saw a
/// reply. It is the scheduler's proxy for network loss and is smoothed by
/// the adaptive buffer before any decision is taken on it.
#[derive(Debug, Default)]
pub struct LinkStats {
    sent: AtomicU64,
    answered: AtomicU64,
    rejected: AtomicU64,
}

impl LinkStats {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an issued probe.
    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reply that reached the clock filter; `accepted` is the
    /// filter's verdict.
    pub fn record_reply(&self, accepted: bool) {
        self.answered.fetch_add(1, Ordering::Relaxed);
        if !accepted {
            self.rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Fraction of issued probes without a reply, in [0, 1].
    #[must_use]
    pub fn loss_ratio(&self) -> f64 {
        let sent = self.sent.load(Ordering::Relaxed);
        if sent == 0 {
            return 0.0;
        }
        let answered = self.answered.load(Ordering::Relaxed).min(sent);
        (sent - answered) as f64 / sent as f64
    }

    /// Probes rejected by the clock filter (spikes, NaN arithmetic).
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

/// Issues clock-sync probes at a fixed cadence and routes replies.
///
/// The driver owns the outstanding-probe record; the session reader calls
/// [`SyncProbeDriver::on_response`] and [`SyncProbeDriver::on_heartbeat_reply`]
/// from its receive loop.
pub struct SyncProbeDriver {
    clock: SharedClock,
    stats: Arc<LinkStats>,
    outbound: mpsc::Sender<Envelope>,
    node_id: String,
    sequence: Arc<AtomicU64>,
    probe_interval: Duration,
    /// Outstanding probe: (probe id, t1). Replaced on every tick.
    outstanding: Mutex<Option<(String, f64)>>,
}

impl SyncProbeDriver {
    /// Creates a driver bound to one session's outbound queue.
    pub fn new(
        clock: SharedClock,
        stats: Arc<LinkStats>,
        outbound: mpsc::Sender<Envelope>,
        node_id: String,
        sequence: Arc<AtomicU64>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            clock,
            stats,
            outbound,
            node_id,
            sequence,
            probe_interval,
            outstanding: Mutex::new(None),
        }
    }

    /// Runs the probe cadence until the session is cancelled.
    ///
    /// Shutdown completes within one interval: the select below observes the
    /// token on the same turn it fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = interval(self.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("[Clock] Probe driver stopped");
                    break;
                }
                _ = ticker.tick() => {
                    if !self.issue_probe().await {
                        break;
                    }
                }
            }
        }
    }

    /// Sends one probe, superseding any unanswered predecessor.
    async fn issue_probe(&self) -> bool {
        let t1 = monotonic_secs();
        let probe_id = Uuid::new_v4().to_string();

        {
            let mut outstanding = self.outstanding.lock();
            if outstanding.is_some() {
                log::trace!("[Clock] Probe unanswered within interval, superseding");
            }
            *outstanding = Some((probe_id, t1));
        }

        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope::new(&self.node_id, seq, Message::ClockSync { t1 });
        self.stats.record_sent();

        if self.outbound.send(envelope).await.is_err() {
            log::debug!("[Clock] Outbound queue closed, probe driver exiting");
            return false;
        }
        true
    }

    /// Handles a `clock_sync_response`. Replies not matching the outstanding
    /// probe's `t1` are stale and ignored; the next probe supersedes them.
    pub fn on_response(&self, t1: f64, t2: f64, t3: f64) {
        let t4 = monotonic_secs();
        let matched = {
            let mut outstanding = self.outstanding.lock();
            match outstanding.take() {
                Some((_, expected_t1)) if expected_t1 == t1 => true,
                other => {
                    *outstanding = other;
                    false
                }
            }
        };
        if !matched {
            log::trace!("[Clock] Stale probe reply ignored (t1 = {t1})");
            return;
        }

        let accepted = self.clock.submit_probe(t1, t2, t3, t4);
        self.stats.record_reply(accepted);
        if accepted {
            log::trace!(
                "[Clock] Probe fused: offset={:.6}s drift={:.2e} rtt={:.6}s",
                self.clock.offset(),
                self.clock.drift(),
                self.clock.last_rtt()
            );
        }
    }

    /// Handles a heartbeat reply carrying `server_time`.
    ///
    /// One-way estimator: the echoed `client_time` is our monotonic send
    /// time, so `rtt ≈ now − client_time` and the server stamped its time
    /// near the midpoint. Coarser than a full probe, hence the half-weight
    /// fusion in the clock.
    pub fn on_heartbeat_reply(&self, client_time: f64, server_time: f64) {
        let now = monotonic_secs();
        let rtt_est = now - client_time;
        if rtt_est < 0.0 {
            return;
        }
        let offset_est = server_time - client_time - rtt_est / 2.0;
        self.clock.submit_quick(offset_est, rtt_est);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_with_queue(capacity: usize) -> (Arc<SyncProbeDriver>, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        let driver = Arc::new(SyncProbeDriver::new(
            SharedClock::new(),
            Arc::new(LinkStats::new()),
            tx,
            "endpoint-1".to_string(),
            Arc::new(AtomicU64::new(0)),
            Duration::from_secs(1),
        ));
        (driver, rx)
    }

    #[tokio::test]
    async fn probe_carries_local_send_time() {
        let (driver, mut rx) = driver_with_queue(4);
        let before = monotonic_secs();
        assert!(driver.issue_probe().await);
        let after = monotonic_secs();

        let envelope = rx.recv().await.expect("probe queued");
        match envelope.body {
            Message::ClockSync { t1 } => {
                assert!(t1 >= before && t1 <= after);
            }
            other => panic!("expected clock_sync, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn matching_reply_feeds_the_clock() {
        let (driver, mut rx) = driver_with_queue(4);
        assert!(driver.issue_probe().await);
        let envelope = rx.recv().await.expect("probe queued");
        let t1 = match envelope.body {
            Message::ClockSync { t1 } => t1,
            other => panic!("expected clock_sync, got {other:?}"),
        };

        driver.on_response(t1, t1 + 50.0, t1 + 50.0);
        assert!(driver.clock.offset() > 0.0);
        assert_eq!(driver.stats.loss_ratio(), 0.0);
    }

    #[tokio::test]
    async fn stale_reply_is_ignored() {
        let (driver, mut rx) = driver_with_queue(4);
        assert!(driver.issue_probe().await);
        let _ = rx.recv().await;

        driver.on_response(-1.0, 100.0, 100.0);
        assert_eq!(driver.clock.offset(), 0.0);
        // Probe still outstanding; loss counts it until answered.
        assert_eq!(driver.stats.loss_ratio(), 1.0);
    }

    #[tokio::test]
    async fn unanswered_probe_counts_as_loss() {
        let (driver, mut rx) = driver_with_queue(8);
        assert!(driver.issue_probe().await);
        assert!(driver.issue_probe().await);
        let _ = rx.recv().await;
        let envelope = rx.recv().await.expect("second probe");
        let t1 = match envelope.body {
            Message::ClockSync { t1 } => t1,
            other => panic!("expected clock_sync, got {other:?}"),
        };
        driver.on_response(t1, t1 + 1.0, t1 + 1.0);
        assert!((driver.stats.loss_ratio() - 0.5).abs() < 1e-12);
    }

    #[tokio::test]
    async fn heartbeat_reply_produces_quick_sample() {
        let (driver, _rx) = driver_with_queue(4);
        let client_time = monotonic_secs();
        driver.on_heartbeat_reply(client_time, client_time + 500.0);
        assert!(driver.clock.offset() > 0.0);
    }
}
