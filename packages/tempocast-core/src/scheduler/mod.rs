//! Future buffer: admission, timed release and adaptive depth.
//!
//! Frames and scheduled actions arrive with instants in shared virtual
//! time; a single release loop sleeps until the earliest deadline on the
//! disciplined clock and hands due work to the [`Renderer`]. Late or
//! implausibly-future input is dropped with telemetry - the scheduler never
//! fails on bad frames. Buffer depth adapts to observed network quality via
//! [`AdaptiveBuffer`].

pub mod adaptive;
pub mod track;

pub use adaptive::{AdaptiveBuffer, BufferDepth, NetworkQuality};
pub use track::TrackState;

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::clock::{LinkStats, SharedClock};
use crate::error::{TempoError, TempoResult};
use crate::events::{BufferEvent, EventEmitter};
use crate::protocol::{ControlParams, MediaAction, MediaFrame, ScheduledAction};
use crate::protocol_constants::{
    COMMAND_DEDUP_CAPACITY, LATE_TOLERANCE_SECS, MAX_FUTURE_SECS, MAX_QUEUE_FRAMES,
    QUALITY_SAMPLE_INTERVAL_MS,
};
use crate::renderer::Renderer;
use crate::utils::{monotonic_secs, now_millis, RecentIds};

// ─────────────────────────────────────────────────────────────────────────────
// Ordering Wrappers
// ─────────────────────────────────────────────────────────────────────────────

/// Heap entry ordering frames by `(presentation_ts, sequence)`.
struct QueuedFrame(MediaFrame);

impl PartialEq for QueuedFrame {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for QueuedFrame {}

impl PartialOrd for QueuedFrame {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedFrame {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0
            .presentation_ts
            .total_cmp(&other.0.presentation_ts)
            .then(self.0.sequence.cmp(&other.0.sequence))
    }
}

/// Heap entry ordering actions by `(start_at, sequence)`.
///
/// Actions sharing a start instant apply in sequence order, so the highest
/// sequence is applied last and wins.
struct PendingAction(ScheduledAction);

impl PartialEq for PendingAction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for PendingAction {}

impl PartialOrd for PendingAction {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingAction {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0
            .start_at
            .total_cmp(&other.0.start_at)
            .then(self.0.sequence.cmp(&other.0.sequence))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Admission Results
// ─────────────────────────────────────────────────────────────────────────────

/// Outcome of frame admission. Dropping is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAdmission {
    Queued,
    DroppedLate,
    DroppedTooFar,
}

/// Outcome of action admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionAdmission {
    Scheduled,
    /// Replay of an already-accepted action id; ignored per the idempotence
    /// contract.
    Duplicate,
}

// ─────────────────────────────────────────────────────────────────────────────
// Internal State
// ─────────────────────────────────────────────────────────────────────────────

struct Track {
    state: TrackState,
    queue: BinaryHeap<Reverse<QueuedFrame>>,
    /// Presentation end (`presentation_ts + duration`) of the last released
    /// frame; the instant an underrun becomes observable.
    released_until: Option<f64>,
    underrun_flagged: bool,
    params: ControlParams,
}

impl Track {
    fn new() -> Self {
        Self {
            state: TrackState::Idle,
            queue: BinaryHeap::new(),
            released_until: None,
            underrun_flagged: false,
            params: ControlParams::default(),
        }
    }
}

struct BufferInner {
    tracks: HashMap<String, Track>,
    actions: BinaryHeap<Reverse<PendingAction>>,
    dedup: RecentIds,
    adaptive: AdaptiveBuffer,
}

/// Work produced by one release pass.
struct ReleaseBatch {
    /// Frames to hand to the renderer with their local-time deadlines.
    frames: Vec<(MediaFrame, f64)>,
    /// Tracks whose output must stop (stop/unload actions).
    stops: Vec<String>,
    /// Action-execution failures to surface to the control plane.
    rejections: Vec<TempoError>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Future Buffer
// ─────────────────────────────────────────────────────────────────────────────

/// The endpoint-side scheduler.
///
/// Shared between the network reader (admission), the release loop and the
/// quality sampler. One mutex guards the queues; critical sections are
/// bounded by the queue operations and perform no I/O.
pub struct FutureBuffer {
    clock: SharedClock,
    renderer: Arc<dyn Renderer>,
    emitter: Arc<dyn EventEmitter>,
    inner: Mutex<BufferInner>,
    wakeup: Notify,
}

impl FutureBuffer {
    /// Creates a buffer bound to a clock, renderer and event sink.
    pub fn new(
        clock: SharedClock,
        renderer: Arc<dyn Renderer>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            clock,
            renderer,
            emitter,
            inner: Mutex::new(BufferInner {
                tracks: HashMap::new(),
                actions: BinaryHeap::new(),
                dedup: RecentIds::new(COMMAND_DEDUP_CAPACITY),
                adaptive: AdaptiveBuffer::new(),
            }),
            wakeup: Notify::new(),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Admission
    // ─────────────────────────────────────────────────────────────────────────

    /// Admits a media frame. Late and far-future frames are dropped with
    /// telemetry; admission itself never fails.
    pub fn admit_frame(&self, frame: MediaFrame) -> FrameAdmission {
        let now = self.clock.now();
        let delta = frame.presentation_ts - now;

        if delta < 0.0 {
            self.emitter.emit_buffer(BufferEvent::LateFrame {
                track_id: frame.track_id.clone(),
                lateness_ms: -delta * 1000.0,
                timestamp: now_millis(),
            });
            return FrameAdmission::DroppedLate;
        }
        if delta > MAX_FUTURE_SECS {
            self.emitter.emit_buffer(BufferEvent::TooFar {
                track_id: frame.track_id.clone(),
                lead_ms: delta * 1000.0,
                timestamp: now_millis(),
            });
            return FrameAdmission::DroppedTooFar;
        }

        let mut inner = self.inner.lock();
        let track = inner
            .tracks
            .entry(frame.track_id.clone())
            .or_insert_with(Track::new);
        track.state = track.state.on_media();
        track.underrun_flagged = false;
        let track_id = frame.track_id.clone();
        track.queue.push(Reverse(QueuedFrame(frame)));
        let queue_len = track.queue.len();

        if queue_len > MAX_QUEUE_FRAMES {
            // Future frames stay valid; pressure raises the buffer target
            // instead of dropping.
            inner.adaptive.on_queue_pressure(monotonic_secs());
            self.emitter.emit_buffer(BufferEvent::QueuePressure {
                track_id,
                queue_len,
                timestamp: now_millis(),
            });
        }
        drop(inner);

        self.wakeup.notify_one();
        FrameAdmission::Queued
    }

    /// Admits a scheduled action.
    ///
    /// Actions later than the 100 ms best-effort window are refused with
    /// `TOO_LATE` so the caller can answer the originator. Replayed ids are
    /// accepted and ignored.
    pub fn submit_action(&self, action: ScheduledAction) -> TempoResult<ActionAdmission> {
        action.params.validate()?;

        let now = self.clock.now();
        if action.start_at < now - LATE_TOLERANCE_SECS {
            return Err(TempoError::TooLate(format!(
                "action {:?} for track {} missed its deadline by {:.0}ms",
                action.action,
                action.track_id,
                (now - action.start_at) * 1000.0
            )));
        }

        let mut inner = self.inner.lock();
        if !inner.dedup.insert(&action.id) {
            return Ok(ActionAdmission::Duplicate);
        }
        inner.actions.push(Reverse(PendingAction(action)));
        drop(inner);

        self.wakeup.notify_one();
        Ok(ActionAdmission::Scheduled)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Release
    // ─────────────────────────────────────────────────────────────────────────

    /// Executes everything due at shared time `now`: pending actions first
    /// (they may change track states), then frame release, then underrun
    /// detection.
    fn collect_due(&self, now: f64) -> ReleaseBatch {
        let mut batch = ReleaseBatch {
            frames: Vec::new(),
            stops: Vec::new(),
            rejections: Vec::new(),
        };
        let mut inner = self.inner.lock();

        // Actions ordered by (start_at, sequence): ties on start_at apply in
        // sequence order so the higher sequence wins.
        while let Some(Reverse(head)) = inner.actions.peek() {
            if head.0.start_at > now {
                break;
            }
            let Some(Reverse(PendingAction(action))) = inner.actions.pop() else {
                break;
            };
            Self::apply_action(&mut inner, action, &mut batch);
        }

        let now_local = self.renderer.now_local();
        let mut underruns = Vec::new();
        for (track_id, track) in inner.tracks.iter_mut() {
            if !track.state.is_active() {
                continue;
            }
            while let Some(Reverse(head)) = track.queue.peek() {
                if head.0.presentation_ts > now {
                    break;
                }
                let Some(Reverse(QueuedFrame(frame))) = track.queue.pop() else {
                    break;
                };
                if frame.presentation_ts < now - LATE_TOLERANCE_SECS {
                    // Sat in the queue past its deadline (e.g. admitted
                    // while paused); drop rather than emit stale output.
                    self.emitter.emit_buffer(BufferEvent::LateFrame {
                        track_id: frame.track_id.clone(),
                        lateness_ms: (now - frame.presentation_ts) * 1000.0,
                        timestamp: now_millis(),
                    });
                    continue;
                }
                let deadline_local = now_local + (frame.presentation_ts - now);
                track.released_until = Some(frame.presentation_ts + frame.duration);
                track.underrun_flagged = false;
                batch.frames.push((frame, deadline_local));
            }

            // Underrun: release time reached with nothing queued for an
            // active track.
            if track.queue.is_empty() && !track.underrun_flagged {
                if let Some(until) = track.released_until {
                    if now >= until {
                        track.underrun_flagged = true;
                        underruns.push(track_id.clone());
                    }
                }
            }
        }

        for track_id in underruns {
            inner.adaptive.on_underrun(monotonic_secs());
            self.emitter.emit_buffer(BufferEvent::Underrun {
                track_id,
                timestamp: now_millis(),
            });
        }

        batch
    }

    /// Applies one due action to its track's state machine.
    fn apply_action(inner: &mut BufferInner, action: ScheduledAction, batch: &mut ReleaseBatch) {
        if action.action == MediaAction::Load {
            inner
                .tracks
                .entry(action.track_id.clone())
                .or_insert_with(Track::new);
        }

        let Some(track) = inner.tracks.get_mut(&action.track_id) else {
            batch.rejections.push(TempoError::InvalidState(format!(
                "{:?} on unknown track {}",
                action.action, action.track_id
            )));
            return;
        };

        match track.state.apply(action.action) {
            Ok(next) => {
                log::debug!(
                    "[Scheduler] {:?} track={}: {:?} -> {:?}",
                    action.action,
                    action.track_id,
                    track.state,
                    next
                );
                track.state = next;
                match action.action {
                    MediaAction::Play => {
                        track.params = action.params;
                        track.underrun_flagged = false;
                        track.released_until = None;
                    }
                    MediaAction::Seek => {
                        // Content at the new position is re-streamed, so
                        // queued frames belong to the old position.
                        track.queue.clear();
                        track.released_until = None;
                        track.params.seek_position = action.params.seek_position;
                    }
                    MediaAction::Stop | MediaAction::Unload => {
                        track.queue.clear();
                        track.released_until = None;
                        batch.stops.push(action.track_id.clone());
                    }
                    MediaAction::Load | MediaAction::Pause => {}
                }
            }
            Err(err) => batch.rejections.push(err),
        }
    }

    /// Earliest shared-time instant at which work becomes due.
    fn next_deadline(&self) -> Option<f64> {
        let inner = self.inner.lock();
        let mut next: Option<f64> = inner.actions.peek().map(|Reverse(a)| a.0.start_at);

        for track in inner.tracks.values() {
            if !track.state.is_active() {
                continue;
            }
            let candidate = match track.queue.peek() {
                Some(Reverse(head)) => Some(head.0.presentation_ts),
                None if !track.underrun_flagged => track.released_until,
                None => None,
            };
            if let Some(c) = candidate {
                next = Some(match next {
                    Some(n) => n.min(c),
                    None => c,
                });
            }
        }
        next
    }

    /// The release loop. Wakes at the earliest deadline (or on admission of
    /// earlier work) and hands due frames to the renderer.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        log::info!("[Scheduler] Release loop started");
        loop {
            let now = self.clock.now();
            let batch = self.collect_due(now);
            for (frame, deadline_local) in &batch.frames {
                self.renderer.submit(frame, *deadline_local);
            }
            for track_id in &batch.stops {
                self.renderer.stop(track_id);
            }
            for rejection in &batch.rejections {
                log::warn!("[Scheduler] Action rejected: {rejection}");
            }

            let sleep_for = match self.next_deadline() {
                Some(deadline) => {
                    let delta = self.clock.seconds_until(deadline).max(0.0);
                    Duration::from_secs_f64(delta)
                }
                // Nothing queued: sleep until admission wakes us.
                None => Duration::from_secs(3600),
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::info!("[Scheduler] Release loop stopped");
                    break;
                }
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// Samples link quality into the adaptive controller every 200 ms.
    pub async fn run_quality_sampler(
        self: Arc<Self>,
        stats: Arc<LinkStats>,
        cancel: CancellationToken,
    ) {
        let mut ticker = interval(Duration::from_millis(QUALITY_SAMPLE_INTERVAL_MS));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let rtt = self.clock.last_rtt();
                    let loss = stats.loss_ratio();
                    let mut inner = self.inner.lock();
                    inner.adaptive.observe(rtt, loss);
                    inner.adaptive.tick(monotonic_secs());
                }
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle & Introspection
    // ─────────────────────────────────────────────────────────────────────────

    /// Disconnect handling: cancels pending actions, flushes every queue and
    /// stops the renderer. The disciplined clock is untouched (warm start).
    pub fn cancel_all(&self) {
        let mut inner = self.inner.lock();
        let track_ids: Vec<String> = inner.tracks.keys().cloned().collect();
        inner.tracks.clear();
        inner.actions.clear();
        drop(inner);

        for track_id in &track_ids {
            self.renderer.stop(track_id);
        }
        if !track_ids.is_empty() {
            log::info!(
                "[Scheduler] Flushed {} track(s) on disconnect",
                track_ids.len()
            );
        }
        self.wakeup.notify_one();
    }

    /// Current adaptive depth snapshot.
    #[must_use]
    pub fn buffer_depth(&self) -> BufferDepth {
        self.inner.lock().adaptive.depth()
    }

    /// Current state of every known track.
    #[must_use]
    pub fn track_states(&self) -> Vec<(String, TrackState)> {
        self.inner
            .lock()
            .tracks
            .iter()
            .map(|(id, t)| (id.clone(), t.state))
            .collect()
    }

    /// Volume currently applied to one track, if any was set by `play`.
    #[must_use]
    pub fn track_volume(&self, track_id: &str) -> Option<f64> {
        self.inner
            .lock()
            .tracks
            .get(track_id)
            .and_then(|t| t.params.volume)
    }

    /// Queued frame count for one track.
    #[must_use]
    pub fn queue_len(&self, track_id: &str) -> usize {
        self.inner
            .lock()
            .tracks
            .get(track_id)
            .map_or(0, |t| t.queue.len())
    }
}
