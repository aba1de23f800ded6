//! Renderer capability: the seam between the scheduler and actual output.
//!
//! The scheduler decides *when*; a [`Renderer`] decides *how*. Native audio,
//! DMX lighting and UI animation backends all sit behind this one trait so
//! the release path stays identical across endpoint kinds. Deadlines are
//! handed over in local monotonic seconds - fine-grained alignment below
//! the scheduler's wakeup precision is the renderer's own job (e.g. via an
//! audio device clock).

use crate::protocol::MediaFrame;
use crate::utils::monotonic_secs;

/// Output backend consuming released frames.
///
/// Implementations must be cheap in `submit`: the scheduler calls it on its
/// release path and expects the renderer to queue internally rather than
/// block.
pub trait Renderer: Send + Sync {
    /// Hands over a frame due at `deadline_local` (local monotonic seconds).
    fn submit(&self, frame: &MediaFrame, deadline_local: f64);

    /// Stops output for a track and discards anything queued for it.
    fn stop(&self, track_id: &str);

    /// The renderer's local monotonic time, seconds. Shares the timescale of
    /// `submit` deadlines.
    fn now_local(&self) -> f64;
}

/// Renderer that logs releases instead of producing output.
///
/// Default backend for the headless node binary and for soak testing the
/// scheduling path without an audio device.
pub struct LogRenderer;

impl Renderer for LogRenderer {
    fn submit(&self, frame: &MediaFrame, deadline_local: f64) {
        let slack_ms = (deadline_local - self.now_local()) * 1000.0;
        log::debug!(
            "[Renderer] Release: track={} seq={} codec={:?} bytes={} slack={:.2}ms",
            frame.track_id,
            frame.sequence,
            frame.codec,
            frame.payload.len(),
            slack_ms
        );
    }

    fn stop(&self, track_id: &str) {
        log::debug!("[Renderer] Stop: track={track_id}");
    }

    fn now_local(&self) -> f64 {
        monotonic_secs()
    }
}
