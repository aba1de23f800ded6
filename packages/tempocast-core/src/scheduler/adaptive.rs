//! Adaptive buffer depth control.
//!
//! The target depth is a table lookup on smoothed network quality; the live
//! depth chases the target under a slew limit so playback never jumps, with
//! one exception: an underrun widens the buffer immediately. Raw RTT and
//! loss inputs are EMA-smoothed before the table is consulted, which keeps
//! the target from oscillating across a quality boundary on single noisy
//! samples.

use serde::Serialize;

use crate::protocol_constants::{
    BUFFER_MAX_MS, BUFFER_SLEW_PER_SEC, OFFSET_EMA_ALPHA, UNDERRUN_GROWTH, UNDERRUN_QUIET_SECS,
};

/// Network quality classes and their buffer targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl NetworkQuality {
    /// Classifies smoothed RTT (seconds) and loss ratio.
    #[must_use]
    pub fn from_metrics(rtt: f64, loss: f64) -> Self {
        if rtt < 0.010 && loss <= 0.0 {
            Self::Excellent
        } else if rtt < 0.050 && loss < 0.001 {
            Self::Good
        } else if rtt < 0.100 && loss < 0.01 {
            Self::Fair
        } else if rtt < 0.200 && loss < 0.05 {
            Self::Poor
        } else {
            Self::Critical
        }
    }

    /// Buffer target for this quality class, milliseconds.
    #[must_use]
    pub fn target_ms(self) -> f64 {
        match self {
            Self::Excellent => 30.0,
            Self::Good => 80.0,
            Self::Fair => 120.0,
            Self::Poor => 180.0,
            Self::Critical => 250.0,
        }
    }

    /// The next-worse class (saturating at `Critical`). Used when queue
    /// pressure forces the target up one step.
    #[must_use]
    pub fn one_step_worse(self) -> Self {
        match self {
            Self::Excellent => Self::Good,
            Self::Good => Self::Fair,
            Self::Fair => Self::Poor,
            Self::Poor | Self::Critical => Self::Critical,
        }
    }

    /// Numeric quality in [0, 1] for candidate scoring (1 = best).
    #[must_use]
    pub fn as_score(self) -> f64 {
        match self {
            Self::Excellent => 1.0,
            Self::Good => 0.75,
            Self::Fair => 0.5,
            Self::Poor => 0.25,
            Self::Critical => 0.0,
        }
    }
}

/// Serializable view of the adaptive state for the status API.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BufferDepth {
    pub quality: NetworkQuality,
    pub target_ms: f64,
    pub live_ms: f64,
    pub smoothed_rtt_ms: f64,
    pub smoothed_loss: f64,
}

/// Slew-limited buffer depth controller.
///
/// All time arguments are local monotonic seconds. Pure state; the quality
/// sampler drives it every 200 ms.
#[derive(Debug)]
pub struct AdaptiveBuffer {
    smoothed_rtt: Option<f64>,
    smoothed_loss: Option<f64>,
    quality: NetworkQuality,
    live_ms: f64,
    last_underrun: Option<f64>,
    last_pressure: Option<f64>,
    last_tick: Option<f64>,
}

impl AdaptiveBuffer {
    /// Starts at the `Fair` target until the first observation arrives.
    #[must_use]
    pub fn new() -> Self {
        Self {
            smoothed_rtt: None,
            smoothed_loss: None,
            quality: NetworkQuality::Fair,
            live_ms: NetworkQuality::Fair.target_ms(),
            last_underrun: None,
            last_pressure: None,
            last_tick: None,
        }
    }

    /// Feeds raw RTT (seconds) and loss observations. The first sample
    /// initializes the EMAs; later samples fuse at the standard weight.
    pub fn observe(&mut self, raw_rtt: f64, raw_loss: f64) {
        if !raw_rtt.is_finite() || !raw_loss.is_finite() {
            return;
        }
        let alpha = OFFSET_EMA_ALPHA;
        self.smoothed_rtt = Some(match self.smoothed_rtt {
            Some(prev) => (1.0 - alpha) * prev + alpha * raw_rtt,
            None => raw_rtt,
        });
        self.smoothed_loss = Some(match self.smoothed_loss {
            Some(prev) => (1.0 - alpha) * prev + alpha * raw_loss,
            None => raw_loss,
        });
        self.quality = NetworkQuality::from_metrics(
            self.smoothed_rtt.unwrap_or(0.0),
            self.smoothed_loss.unwrap_or(0.0),
        );
    }

    /// Current effective target, including any queue-pressure escalation.
    #[must_use]
    pub fn target_ms(&self) -> f64 {
        let base = self.quality.target_ms();
        match self.last_pressure {
            Some(_) => base.max(self.quality.one_step_worse().target_ms()),
            None => base,
        }
    }

    /// Current live depth, milliseconds.
    #[must_use]
    pub fn live_ms(&self) -> f64 {
        self.live_ms
    }

    /// Records an underrun: widen immediately, gate decay for the quiet
    /// period.
    pub fn on_underrun(&mut self, now: f64) {
        self.live_ms = (self.live_ms * UNDERRUN_GROWTH).min(BUFFER_MAX_MS);
        self.last_underrun = Some(now);
    }

    /// Records queue pressure: the target floor moves one quality step up
    /// until pressure stays away for the quiet period.
    pub fn on_queue_pressure(&mut self, now: f64) {
        self.last_pressure = Some(now);
    }

    /// Advances the slew toward the target. Called on every quality sample.
    pub fn tick(&mut self, now: f64) {
        if let Some(at) = self.last_pressure {
            if now - at >= UNDERRUN_QUIET_SECS {
                self.last_pressure = None;
            }
        }

        let dt = match self.last_tick.replace(now) {
            Some(prev) if now > prev => now - prev,
            _ => return,
        };

        let target = self.target_ms();
        let max_delta = self.live_ms * BUFFER_SLEW_PER_SEC * dt;

        if target > self.live_ms {
            self.live_ms = (self.live_ms + max_delta).min(target);
        } else if target < self.live_ms {
            // Narrowing is allowed only after a quiet stretch without
            // underruns; the widened depth is what ended them.
            let quiet = self
                .last_underrun
                .map_or(true, |at| now - at >= UNDERRUN_QUIET_SECS);
            if quiet {
                self.live_ms = (self.live_ms - max_delta).max(target);
            }
        }
        self.live_ms = self.live_ms.min(BUFFER_MAX_MS);
    }

    /// Snapshot for the status API.
    #[must_use]
    pub fn depth(&self) -> BufferDepth {
        BufferDepth {
            quality: self.quality,
            target_ms: self.target_ms(),
            live_ms: self.live_ms,
            smoothed_rtt_ms: self.smoothed_rtt.unwrap_or(0.0) * 1000.0,
            smoothed_loss: self.smoothed_loss.unwrap_or(0.0),
        }
    }
}

impl Default for AdaptiveBuffer {
    fn default() -> Self {
        Self::new()
    }
}
