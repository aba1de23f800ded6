//! Fixed protocol constants and filter tunables.
//!
//! These values define the wire contract and the clock/buffer filter
//! behavior that every peer relies on. Changing them changes what
//! "synchronized" means for a deployment, so they live in one place.

// ─────────────────────────────────────────────────────────────────────────────
// Protocol Identity
// ─────────────────────────────────────────────────────────────────────────────

/// Protocol version advertised in `hello` messages (semver).
///
/// Peers with a different MAJOR version are refused with `VERSION_MISMATCH`.
pub const PROTOCOL_VERSION: &str = "2.1.0";

/// Service identifier returned by the HTTP `/health` endpoint.
pub const SERVICE_ID: &str = "tempocast";

/// Maximum accepted wire frame length in bytes (one JSON message per line).
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Clock Discipline
// ─────────────────────────────────────────────────────────────────────────────

/// EMA weight applied when fusing a full four-timestamp probe into the offset.
pub const OFFSET_EMA_ALPHA: f64 = 0.1;

/// Capacity of the clock sample ring.
pub const CLOCK_SAMPLE_CAPACITY: usize = 20;

/// Window of most recent samples used for the drift regression.
pub const DRIFT_WINDOW: usize = 10;

/// Minimum samples before drift is estimated at all.
pub const DRIFT_MIN_SAMPLES: usize = 3;

/// Regression denominators below this are treated as degenerate; drift is
/// left unchanged.
pub const DRIFT_DENOM_EPSILON: f64 = 1e-4;

/// RTT samples above `3 × median(last 10)` are rejected as spikes.
pub const RTT_REJECT_FACTOR: f64 = 3.0;

/// Floor for the spike-rejection threshold (seconds). On near-zero-RTT links
/// the median collapses to ~0 and would otherwise reject every real sample.
pub const RTT_REJECT_FLOOR: f64 = 0.005;

/// Samples required before spike rejection engages.
pub const RTT_REJECT_MIN_SAMPLES: usize = 5;

/// Default interval between four-timestamp sync probes (seconds).
pub const PROBE_INTERVAL_SECS: f64 = 1.0;

// ─────────────────────────────────────────────────────────────────────────────
// Future Buffer / Scheduler
// ─────────────────────────────────────────────────────────────────────────────

/// Frames scheduled further than this into the future are dropped (seconds).
pub const MAX_FUTURE_SECS: f64 = 10.0;

/// Frames at most this far in the past are still executed best-effort
/// (seconds). Anything older is rejected with `TOO_LATE`.
pub const LATE_TOLERANCE_SECS: f64 = 0.1;

/// Maximum queued frames per track before `QUEUE_PRESSURE` is raised.
pub const MAX_QUEUE_FRAMES: usize = 512;

/// Interval between network-quality samples feeding the adaptive buffer (ms).
pub const QUALITY_SAMPLE_INTERVAL_MS: u64 = 200;

/// Maximum fractional change of the live buffer depth per second.
pub const BUFFER_SLEW_PER_SEC: f64 = 0.10;

/// Multiplier applied to the live buffer depth on an underrun.
pub const UNDERRUN_GROWTH: f64 = 1.2;

/// Quiet period without underruns before the live depth may decay (seconds).
pub const UNDERRUN_QUIET_SECS: f64 = 5.0;

/// Hard ceiling on the live buffer depth (ms).
pub const BUFFER_MAX_MS: f64 = 1000.0;

// ─────────────────────────────────────────────────────────────────────────────
// Control Plane
// ─────────────────────────────────────────────────────────────────────────────

/// Minimum lead time the server requires on `media_control.start_at` (seconds).
pub const COMMAND_MIN_LEAD_SECS: f64 = 0.020;

/// Heartbeat send interval per session (seconds).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Missed heartbeats before a peer is marked unhealthy.
pub const HEARTBEAT_MISS_LIMIT: u32 = 2;

/// Per-session rate limit for clock-sync probes (messages per second).
pub const PROBE_RATE_LIMIT: usize = 10;

/// Per-session rate limit for media-control commands (messages per second).
pub const COMMAND_RATE_LIMIT: usize = 100;

/// Maximum concurrent sessions per source address.
pub const SESSIONS_PER_ADDR_LIMIT: usize = 10;

/// Recent command ids remembered for replay suppression.
pub const COMMAND_DEDUP_CAPACITY: usize = 1024;

/// Capacity of the broadcast channel fanning messages out to sessions.
pub const FANOUT_CHANNEL_CAPACITY: usize = 256;

// ─────────────────────────────────────────────────────────────────────────────
// Cluster / Election
// ─────────────────────────────────────────────────────────────────────────────

/// Interval between node-status broadcasts (seconds).
pub const NODE_STATUS_INTERVAL_SECS: u64 = 2;

/// Silence from the master before a follower starts an election (seconds).
pub const ELECTION_TIMEOUT_SECS: f64 = 3.0;

/// Candidate gather window for competing election messages (seconds).
pub const ELECTION_GATHER_SECS: f64 = 0.5;

/// Candidate score weights: cpu headroom, memory headroom, network quality,
/// battery level. Sum to 1.0 so scores stay in [0, 1].
pub const SCORE_WEIGHTS: [f64; 4] = [0.3, 0.2, 0.3, 0.2];
