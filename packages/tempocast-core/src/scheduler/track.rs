//! Per-track playback state machine.
//!
//! `idle → loading → ready → playing ⇄ paused → stopped`, driven by
//! scheduled actions. Invalid transitions are refused with `INVALID_STATE`
//! and leave the state untouched; the caller reports them to the control
//! plane.

use serde::Serialize;

use crate::error::{TempoError, TempoResult};
use crate::protocol::MediaAction;

/// Lifecycle state of one track on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    Stopped,
}

impl TrackState {
    /// Applies a scheduled action, returning the successor state.
    ///
    /// `load` is accepted from `idle` and from `stopped` (re-load of a
    /// finished track). `loading → ready` is not action-driven; it happens
    /// when the first frame is admitted (see [`TrackState::on_media`]).
    pub fn apply(self, action: MediaAction) -> TempoResult<TrackState> {
        use MediaAction::*;
        use TrackState::*;

        let next = match (self, action) {
            (Idle | Stopped, Load) => Loading,
            // Play during loading is valid: playback starts as data arrives.
            (Loading | Ready | Paused, Play) => Playing,
            (Playing, Pause) => Paused,
            (Loading | Ready | Playing | Paused, Stop) => Stopped,
            (Ready | Playing | Paused, Seek) => self,
            (Loading | Ready | Playing | Paused | Stopped, Unload) => Idle,
            _ => {
                return Err(TempoError::InvalidState(format!(
                    "{action:?} not valid in state {self:?}"
                )))
            }
        };
        Ok(next)
    }

    /// Transition taken when media data arrives: a loading track becomes
    /// ready. All other states are unaffected by data arrival.
    #[must_use]
    pub fn on_media(self) -> TrackState {
        match self {
            TrackState::Loading => TrackState::Ready,
            other => other,
        }
    }

    /// Whether frames for this track are eligible for release.
    #[must_use]
    pub fn is_active(self) -> bool {
        self == TrackState::Playing
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use MediaAction::*;
    use TrackState::*;

    #[test]
    fn happy_path_lifecycle() {
        let s = Idle.apply(Load).unwrap();
        assert_eq!(s, Loading);
        let s = s.on_media();
        assert_eq!(s, Ready);
        let s = s.apply(Play).unwrap();
        assert_eq!(s, Playing);
        let s = s.apply(Pause).unwrap();
        assert_eq!(s, Paused);
        let s = s.apply(Play).unwrap();
        assert_eq!(s, Playing);
        let s = s.apply(Stop).unwrap();
        assert_eq!(s, Stopped);
    }

    #[test]
    fn stopped_track_can_be_reloaded() {
        assert_eq!(Stopped.apply(Load).unwrap(), Loading);
    }

    #[test]
    fn invalid_transitions_are_refused() {
        assert!(Idle.apply(Play).is_err());
        assert!(Idle.apply(Pause).is_err());
        assert!(Ready.apply(Pause).is_err());
        assert!(Paused.apply(Pause).is_err());
        assert!(Playing.apply(Load).is_err());
        assert!(Stopped.apply(Play).is_err());
    }

    #[test]
    fn seek_keeps_the_current_state() {
        assert_eq!(Playing.apply(Seek).unwrap(), Playing);
        assert_eq!(Paused.apply(Seek).unwrap(), Paused);
        assert!(Idle.apply(Seek).is_err());
    }

    #[test]
    fn unload_returns_to_idle_from_anywhere_loaded() {
        assert_eq!(Playing.apply(Unload).unwrap(), Idle);
        assert_eq!(Stopped.apply(Unload).unwrap(), Idle);
        assert!(Idle.apply(Unload).is_err());
    }

    #[test]
    fn media_arrival_only_affects_loading() {
        assert_eq!(Playing.on_media(), Playing);
        assert_eq!(Idle.on_media(), Idle);
    }
}
