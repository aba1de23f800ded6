//! Wire protocol: the closed set of messages exchanged between peers.
//!
//! Every frame on the control stream is one JSON object: a common envelope
//! (`id`, `timestamp`, `node_id`, `sequence`) plus a `type`-tagged payload.
//! The payload set is a closed tagged union - a frame whose `type` is not in
//! [`Message`] fails to parse and is answered with `INVALID_STATE`, never
//! silently dropped.
//!
//! All wire timestamps are fractional seconds as IEEE-754 doubles. Times in
//! the shared virtual timescale are noted as such per field.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCode, TempoError, TempoResult};
use crate::protocol_constants::PROTOCOL_VERSION;
use crate::utils::unix_secs;

// ─────────────────────────────────────────────────────────────────────────────
// Envelope
// ─────────────────────────────────────────────────────────────────────────────

/// Common header carried by every wire message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Opaque message id, unique per sender. Used for command replay
    /// suppression and probe correlation.
    pub id: String,
    /// Sender wall-clock seconds at send time. Informational only; the
    /// synchronized timescale flows through probe fields, not this header.
    pub timestamp: f64,
    /// Stable identifier of the sending node.
    pub node_id: String,
    /// Monotone per-sender sequence number. Breaks ties between scheduled
    /// actions that share a start time.
    pub sequence: u64,
    /// The typed payload.
    #[serde(flatten)]
    pub body: Message,
}

impl Envelope {
    /// Wraps a payload in a fresh envelope with a generated id.
    pub fn new(node_id: &str, sequence: u64, body: Message) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: unix_secs(),
            node_id: node_id.to_string(),
            sequence,
            body,
        }
    }

    /// Serializes to one wire frame (a single JSON line without newline).
    pub fn to_frame(&self) -> TempoResult<String> {
        serde_json::to_string(self)
            .map_err(|e| TempoError::Internal(format!("message encode failed: {e}")))
    }

    /// Parses one wire frame. Unknown `type` tags and malformed JSON both
    /// surface as `INVALID_STATE` so the session layer can answer the sender.
    pub fn parse(frame: &str) -> TempoResult<Self> {
        serde_json::from_str(frame)
            .map_err(|e| TempoError::InvalidState(format!("unparseable message: {e}")))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Message Payloads
// ─────────────────────────────────────────────────────────────────────────────

/// The closed set of wire message payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Session opener, sent by both sides. The server's reply carries
    /// `cluster_info` so clients learn the replica set for re-bind.
    Hello {
        /// Semver protocol version; incompatible majors are refused.
        protocol_version: String,
        /// Advertised capability strings. Unknown entries are ignored.
        capabilities: Vec<String>,
        node_type: NodeRole,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cluster_info: Option<ClusterInfo>,
    },
    /// Four-timestamp probe request; `t1` is the sender's local monotonic
    /// seconds at transmission.
    ClockSync { t1: f64 },
    /// Probe reply: the original `t1` plus server receive/transmit times in
    /// the shared timescale. `t4` is observed by the probe originator.
    ClockSyncResponse { t1: f64, t2: f64, t3: f64 },
    /// Time-referenced playback command, fanned out to subscribed endpoints.
    MediaControl {
        action: MediaAction,
        track_id: String,
        /// Execution instant in shared virtual seconds.
        start_at: f64,
        #[serde(default)]
        params: ControlParams,
    },
    /// One media chunk. `timestamp` is the presentation instant in shared
    /// virtual seconds; `data` is base64.
    MediaData {
        track_id: String,
        chunk_index: u64,
        timestamp: f64,
        duration: f64,
        codec: MediaCodec,
        data: String,
        is_keyframe: bool,
    },
    /// Liveness signal. The reply echoes `client_time` and adds
    /// `server_time`, which feeds the low-weight quick clock samples.
    Heartbeat {
        client_time: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_time: Option<f64>,
    },
    /// Periodic health broadcast; input to election scoring.
    NodeStatus(NodeStatusInfo),
    /// Election round message broadcast by candidates.
    MasterElection {
        election_id: String,
        /// Composite health score in [0, 1].
        candidate_score: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        current_master: Option<String>,
        term: u64,
    },
    /// Protocol-level error report.
    Error {
        code: u16,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<serde_json::Value>,
    },
}

impl Message {
    /// Builds an `error` payload from a [`TempoError`].
    pub fn from_error(err: &TempoError) -> Self {
        Message::Error {
            code: err.code(),
            message: err.to_string(),
            details: None,
        }
    }
}

/// Cluster membership advertised in the server's `hello`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Current master node id; absent while an election is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_id: Option<String>,
    /// Replica ids ordered by last-advertised candidate score, best first.
    pub replica_ids: Vec<String>,
    /// Election term the advertiser has observed.
    #[serde(default)]
    pub term: u64,
}

/// Playback actions carried by `media_control`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaAction {
    Play,
    Pause,
    Stop,
    Seek,
    Load,
    Unload,
}

/// Media codecs carried by `media_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaCodec {
    Opus,
    Pcm16,
    H264,
    Vp9,
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Master,
    Replica,
    Client,
}

/// Capabilities a peer may advertise in `hello`.
///
/// The wire carries free-form strings; unknown ones are ignored rather than
/// rejected, so new capabilities can roll out incrementally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Audio,
    Video,
    ClockSync,
    Cluster,
}

impl Capability {
    /// Parses a known capability string; unknown strings yield `None`.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "clock_sync" => Some(Self::ClockSync),
            "cluster" => Some(Self::Cluster),
            _ => None,
        }
    }

    /// The wire string for this capability.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::ClockSync => "clock_sync",
            Self::Cluster => "cluster",
        }
    }
}

/// Filters a `hello` capability list down to the known set.
#[must_use]
pub fn known_capabilities(advertised: &[String]) -> Vec<Capability> {
    advertised.iter().filter_map(|s| Capability::parse(s)).collect()
}

/// Optional parameters on `media_control`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlParams {
    /// Playback volume in [0, 1].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    /// Number of repeats; 0 means play once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fade_in_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fade_out_ms: Option<u64>,
    /// Seek target in seconds from track start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seek_position: Option<f64>,
}

impl ControlParams {
    /// Validates value ranges. Rejects out-of-range volume and negative or
    /// non-finite seek positions.
    pub fn validate(&self) -> TempoResult<()> {
        if let Some(v) = self.volume {
            if !(0.0..=1.0).contains(&v) || !v.is_finite() {
                return Err(TempoError::InvalidState(format!(
                    "volume {v} outside [0, 1]"
                )));
            }
        }
        if let Some(p) = self.seek_position {
            if !p.is_finite() || p < 0.0 {
                return Err(TempoError::InvalidState(format!(
                    "seek_position {p} must be a non-negative number"
                )));
            }
        }
        Ok(())
    }
}

/// Health snapshot broadcast in `node_status` and consumed by the election.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusInfo {
    pub role: NodeRole,
    /// Sessions currently attached to this node.
    pub connected_clients: u64,
    /// CPU utilization in [0, 1].
    pub cpu: f64,
    /// Memory utilization in [0, 1].
    pub mem: f64,
    /// Battery level in [0, 1]; present only on battery-powered endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery: Option<f64>,
    /// Composite link quality in [0, 1].
    pub net_quality: f64,
    /// Smoothed round-trip time to the master, seconds.
    pub avg_rtt: f64,
    /// Observed probe/frame loss ratio in [0, 1].
    pub loss: f64,
}

// ─────────────────────────────────────────────────────────────────────────────
// Decoded Runtime Forms
// ─────────────────────────────────────────────────────────────────────────────

/// A media chunk after wire decoding, as handed to the scheduler.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub track_id: String,
    /// Strictly increasing within a track.
    pub sequence: u64,
    /// Presentation instant in shared virtual seconds.
    pub presentation_ts: f64,
    pub duration: f64,
    pub codec: MediaCodec,
    pub is_keyframe: bool,
    pub payload: Bytes,
}

impl MediaFrame {
    /// Decodes a `media_data` payload. Fails on invalid base64.
    pub fn from_wire(
        track_id: String,
        chunk_index: u64,
        timestamp: f64,
        duration: f64,
        codec: MediaCodec,
        data: &str,
        is_keyframe: bool,
    ) -> TempoResult<Self> {
        let payload = BASE64
            .decode(data)
            .map_err(|e| TempoError::InvalidState(format!("invalid media payload: {e}")))?;
        Ok(Self {
            track_id,
            sequence: chunk_index,
            presentation_ts: timestamp,
            duration,
            codec,
            is_keyframe,
            payload: Bytes::from(payload),
        })
    }

    /// Encodes the payload back to its wire form (base64).
    #[must_use]
    pub fn encode_payload(&self) -> String {
        BASE64.encode(&self.payload)
    }
}

/// A time-referenced playback command after envelope unwrapping.
///
/// `id` and `sequence` come from the envelope header: the id drives replay
/// suppression, the sequence breaks ties between actions sharing `start_at`.
#[derive(Debug, Clone)]
pub struct ScheduledAction {
    pub id: String,
    pub sequence: u64,
    pub action: MediaAction,
    pub track_id: String,
    /// Execution instant in shared virtual seconds.
    pub start_at: f64,
    pub params: ControlParams,
}

// ─────────────────────────────────────────────────────────────────────────────
// Version Negotiation
// ─────────────────────────────────────────────────────────────────────────────

/// Checks a peer's advertised protocol version against ours.
///
/// MAJOR must match; differing MINOR/PATCH are accepted. A version string
/// that does not parse as semver is treated as a mismatch.
pub fn check_protocol_version(peer: &str) -> TempoResult<()> {
    let ours = semver::Version::parse(PROTOCOL_VERSION)
        .map_err(|e| TempoError::Internal(format!("own protocol version invalid: {e}")))?;
    let theirs = semver::Version::parse(peer)
        .map_err(|_| TempoError::VersionMismatch(format!("unparseable version {peer:?}")))?;
    if theirs.major != ours.major {
        return Err(TempoError::VersionMismatch(format!(
            "peer {peer} incompatible with {PROTOCOL_VERSION}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(body: Message) -> Envelope {
        let env = Envelope::new("node-a", 7, body);
        let frame = env.to_frame().expect("encode");
        Envelope::parse(&frame).expect("decode")
    }

    #[test]
    fn envelope_carries_header_fields() {
        let env = roundtrip(Message::ClockSync { t1: 1.25 });
        assert_eq!(env.node_id, "node-a");
        assert_eq!(env.sequence, 7);
        assert!(matches!(env.body, Message::ClockSync { t1 } if t1 == 1.25));
    }

    #[test]
    fn wire_frame_uses_snake_case_type_tags() {
        let env = Envelope::new(
            "n",
            0,
            Message::ClockSyncResponse {
                t1: 0.0,
                t2: 1.0,
                t3: 2.0,
            },
        );
        let frame = env.to_frame().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "clock_sync_response");
        assert_eq!(value["t2"], 1.0);
    }

    #[test]
    fn media_control_shape_matches_contract() {
        let env = Envelope::new(
            "coordinator",
            3,
            Message::MediaControl {
                action: MediaAction::Play,
                track_id: "t1".into(),
                start_at: 1001.5,
                params: ControlParams {
                    volume: Some(0.8),
                    ..Default::default()
                },
            },
        );
        let value: serde_json::Value = serde_json::from_str(&env.to_frame().unwrap()).unwrap();
        assert_eq!(value["type"], "media_control");
        assert_eq!(value["action"], "play");
        assert_eq!(value["track_id"], "t1");
        assert_eq!(value["start_at"], 1001.5);
        assert_eq!(value["params"]["volume"], 0.8);
        assert!(value["params"].get("seek_position").is_none());
    }

    #[test]
    fn unknown_message_type_is_rejected_not_dropped() {
        let frame = r#"{"id":"x","timestamp":0.0,"node_id":"n","sequence":0,"type":"telepathy"}"#;
        let err = Envelope::parse(frame).unwrap_err();
        assert!(matches!(err, TempoError::InvalidState(_)));
    }

    #[test]
    fn unknown_capabilities_are_ignored() {
        let caps = vec![
            "audio".to_string(),
            "holograms".to_string(),
            "clock_sync".to_string(),
        ];
        let known = known_capabilities(&caps);
        assert_eq!(known, vec![Capability::Audio, Capability::ClockSync]);
    }

    #[test]
    fn version_check_accepts_minor_drift() {
        assert!(check_protocol_version("2.0.9").is_ok());
    }

    #[test]
    fn version_check_rejects_major_mismatch() {
        let err = check_protocol_version("3.0.0").unwrap_err();
        assert!(matches!(err, TempoError::VersionMismatch(_)));
        assert!(check_protocol_version("not-a-version").is_err());
    }

    #[test]
    fn media_frame_decodes_base64_payload() {
        let frame = MediaFrame::from_wire(
            "track".into(),
            4,
            10.0,
            0.02,
            MediaCodec::Opus,
            &BASE64.encode(b"abc"),
            false,
        )
        .unwrap();
        assert_eq!(&frame.payload[..], b"abc");
        assert_eq!(frame.encode_payload(), BASE64.encode(b"abc"));
    }

    #[test]
    fn media_frame_rejects_bad_base64() {
        let err = MediaFrame::from_wire(
            "track".into(),
            0,
            0.0,
            0.0,
            MediaCodec::Pcm16,
            "!!not base64!!",
            false,
        )
        .unwrap_err();
        assert!(matches!(err, TempoError::InvalidState(_)));
    }

    #[test]
    fn control_params_validation() {
        let ok = ControlParams {
            volume: Some(1.0),
            seek_position: Some(0.0),
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let loud = ControlParams {
            volume: Some(1.5),
            ..Default::default()
        };
        assert!(loud.validate().is_err());

        let rewind = ControlParams {
            seek_position: Some(-1.0),
            ..Default::default()
        };
        assert!(rewind.validate().is_err());
    }
}
