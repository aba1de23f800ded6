//! Coordinator-side media-control routing.
//!
//! Validates time-referenced commands against the authoritative clock and
//! fans them out to subscribed endpoints. The original envelope is forwarded
//! verbatim so endpoints can deduplicate replays by the same id the
//! coordinator saw.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::error::{TempoError, TempoResult};
use crate::protocol::{Envelope, Message, NodeRole};
use crate::protocol_constants::{COMMAND_DEDUP_CAPACITY, COMMAND_MIN_LEAD_SECS};
use crate::services::session_store::SessionStore;
use crate::utils::RecentIds;

/// Validates and distributes `media_control` commands.
pub struct CommandRouter {
    clock: SharedClock,
    sessions: Arc<SessionStore>,
    dedup: Mutex<RecentIds>,
    /// Minimum lead time required on `start_at`, seconds.
    min_lead: f64,
}

impl CommandRouter {
    /// Creates a router over the authoritative clock and session set.
    pub fn new(clock: SharedClock, sessions: Arc<SessionStore>) -> Self {
        Self {
            clock,
            sessions,
            dedup: Mutex::new(RecentIds::new(COMMAND_DEDUP_CAPACITY)),
            min_lead: COMMAND_MIN_LEAD_SECS,
        }
    }

    /// Routes one `media_control` envelope from `origin_session`.
    ///
    /// Returns the number of endpoints the command was queued for. A
    /// replayed id is idempotent: accepted, not re-forwarded. Commands
    /// without the minimum lead time are refused with `TOO_LATE`.
    pub fn route(&self, envelope: &Envelope, origin_session: &str) -> TempoResult<usize> {
        let Message::MediaControl {
            action,
            ref track_id,
            start_at,
            ref params,
        } = envelope.body
        else {
            return Err(TempoError::Internal(
                "command router fed a non-control message".to_string(),
            ));
        };

        params.validate()?;

        let now = self.clock.now();
        if start_at < now + self.min_lead {
            return Err(TempoError::TooLate(format!(
                "{action:?} for track {track_id} needs {:.0}ms lead, got {:.0}ms",
                self.min_lead * 1000.0,
                (start_at - now) * 1000.0
            )));
        }

        if !self.dedup.lock().insert(&envelope.id) {
            log::debug!(
                "[Router] Replayed command {} ignored (track {track_id})",
                envelope.id
            );
            return Ok(0);
        }

        let delivered = self
            .sessions
            .fan_out(envelope, NodeRole::Client, origin_session);
        log::debug!(
            "[Router] {action:?} track={track_id} start_at={start_at:.3} -> {delivered} endpoint(s)"
        );
        Ok(delivered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Capability, ControlParams, MediaAction};
    use crate::services::session_store::handle_for;
    use tokio::sync::mpsc;

    fn router_with_endpoint() -> (CommandRouter, mpsc::Receiver<Envelope>) {
        let clock = SharedClock::new();
        clock.seed_epoch(1000.0);
        let sessions = Arc::new(SessionStore::new());
        let (tx, rx) = mpsc::channel(8);
        sessions.insert(handle_for(
            "endpoint-session",
            "endpoint-1",
            NodeRole::Client,
            vec![Capability::Audio],
            "127.0.0.1:9",
            tx,
        ));
        (CommandRouter::new(clock, sessions), rx)
    }

    fn control(id: &str, start_at: f64) -> Envelope {
        let mut env = Envelope::new(
            "controller",
            1,
            Message::MediaControl {
                action: MediaAction::Play,
                track_id: "deck".to_string(),
                start_at,
                params: ControlParams::default(),
            },
        );
        env.id = id.to_string();
        env
    }

    #[test]
    fn valid_command_reaches_endpoints() {
        let (router, mut rx) = router_with_endpoint();
        let cmd = control("cmd-1", 1001.0);
        assert_eq!(router.route(&cmd, "origin").unwrap(), 1);

        let forwarded = rx.try_recv().expect("command forwarded");
        assert_eq!(forwarded.id, "cmd-1");
    }

    #[test]
    fn insufficient_lead_time_is_too_late() {
        let (router, _rx) = router_with_endpoint();
        let now_ish = 1000.0;
        let err = router
            .route(&control("cmd-2", now_ish + 0.005), "origin")
            .unwrap_err();
        assert!(matches!(err, TempoError::TooLate(_)));
    }

    #[test]
    fn replayed_id_is_not_reforwarded() {
        let (router, mut rx) = router_with_endpoint();
        let cmd = control("cmd-3", 1002.0);
        assert_eq!(router.route(&cmd, "origin").unwrap(), 1);
        assert_eq!(router.route(&cmd, "origin").unwrap(), 0);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "no duplicate delivery");
    }

    #[test]
    fn invalid_params_are_refused() {
        let (router, _rx) = router_with_endpoint();
        let mut cmd = control("cmd-4", 1002.0);
        if let Message::MediaControl { ref mut params, .. } = cmd.body {
            params.volume = Some(2.0);
        }
        assert!(matches!(
            router.route(&cmd, "origin").unwrap_err(),
            TempoError::InvalidState(_)
        ));
    }
}
