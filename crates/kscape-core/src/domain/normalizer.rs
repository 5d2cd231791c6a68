//! Folds raw device events into [`DeviceState`] and reports what changed.
//!
//! # Position coalescing
//!
//! While a title plays, the player reports its position about once a second.
//! The host extrapolates the position itself from `position + (now -
//! updated_at)`, so forwarding every report would be pure noise.  A new
//! position is therefore only emitted when it tells the host something its own
//! extrapolation would not:
//!
//! | Situation                                   | Emitted? |
//! |---------------------------------------------|----------|
//! | play status or duration changed             | yes      |
//! | paused/stopped and the position moved       | yes      |
//! | playing, ahead of the prediction by > 1 s   | yes      |
//! | playing, behind the last anchor by > 2 s    | yes      |
//! | playing, behind the prediction by > 10 s    | yes      |
//! | anything else while playing                 | no       |
//!
//! A suppressed report leaves the state untouched, so the anchor the host is
//! extrapolating from stays the one it last received.
//!
//! Play-status reports whose timestamp is not later than the current anchor
//! are stale and dropped whole, so they can neither move the position nor
//! shrink the duration below it.  Applying the same event twice is therefore a
//! no-op the second time.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::state::{
    DeviceState, MediaKind, MediaLocation, PlayStatus, PositionUpdate, PowerState, RawEvent,
    RawEventKind, StateDelta,
};

/// How far ahead of the extrapolated position a report may be before it is
/// emitted.
pub const AHEAD_TOLERANCE_SECS: u64 = 1;

/// A report this far behind the last emitted position is treated as a seek.
pub const SEEK_BACK_SECS: u64 = 2;

/// A report this far behind the extrapolated position re-anchors the host.
pub const RESYNC_BEHIND_SECS: u64 = 10;

/// Computes the delta `event` causes on `state`.
///
/// Pure: the result depends only on the two arguments.  Returns `None` when
/// the event changes nothing worth publishing.
pub fn normalize(state: &DeviceState, event: &RawEvent) -> Option<StateDelta> {
    let at = event.received_at;
    let mut delta = StateDelta::default();

    match &event.kind {
        RawEventKind::Power { raw } => {
            let power = PowerState::from_raw(raw);
            if power != state.power {
                delta.power = Some(power);
                if power == PowerState::Off {
                    clear_media(state, at, &mut delta);
                }
            }
        }
        RawEventKind::PlayStatus {
            mode,
            speed,
            title_length_secs,
            title_location_secs,
        } => match PlayStatus::from_code(*mode) {
            Some(status) => play_status_delta(
                state,
                status,
                *speed,
                *title_length_secs,
                *title_location_secs,
                at,
                &mut delta,
            ),
            None => debug!(mode, "ignoring unknown play mode"),
        },
        RawEventKind::Title(title) => {
            if *title != state.title {
                delta.title = Some(title.clone());
            }
        }
        RawEventKind::MediaType { raw } => match MediaKind::from_raw(raw) {
            Some(kind) if kind != state.media_kind => delta.media_kind = Some(kind),
            Some(_) => {}
            None => debug!(raw = %raw, "ignoring unknown media type"),
        },
        RawEventKind::Location { raw } => match MediaLocation::from_raw(raw) {
            Some(location) if location != state.location => delta.location = Some(location),
            Some(_) => {}
            None => debug!(raw = %raw, "ignoring unknown movie location"),
        },
        RawEventKind::Artwork(url) => {
            if *url != state.artwork_url {
                delta.artwork_url = Some(url.clone());
            }
        }
    }

    (!delta.is_empty()).then_some(delta)
}

/// Owns a [`DeviceState`] and keeps it in step with the deltas it emits.
#[derive(Debug, Default)]
pub struct StateNormalizer {
    state: DeviceState,
}

impl StateNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current canonical state.
    pub fn state(&self) -> &DeviceState {
        &self.state
    }

    /// Forgets everything; used before building a fresh snapshot.
    pub fn reset(&mut self) {
        self.state = DeviceState::default();
    }

    /// Applies `event`, returning the delta that was folded into the state.
    pub fn apply(&mut self, event: &RawEvent) -> Option<StateDelta> {
        let delta = normalize(&self.state, event)?;
        delta.apply_to(&mut self.state);
        Some(delta)
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

fn accepts_timestamp(state: &DeviceState, at: DateTime<Utc>) -> bool {
    state.position_updated_at.map_or(true, |previous| at > previous)
}

fn clear_media(state: &DeviceState, at: DateTime<Utc>, delta: &mut StateDelta) {
    if state.play_status != PlayStatus::Stopped {
        delta.play_status = Some(PlayStatus::Stopped);
    }
    if state.play_speed != 0 {
        delta.play_speed = Some(0);
    }
    if state.duration_secs != 0 {
        delta.duration_secs = Some(0);
    }
    if state.position_secs != 0 && accepts_timestamp(state, at) {
        delta.position = Some(PositionUpdate {
            position_secs: 0,
            updated_at: at,
        });
    }
    if !state.title.is_empty() {
        delta.title = Some(String::new());
    }
    if state.media_kind != MediaKind::None {
        delta.media_kind = Some(MediaKind::None);
    }
    if !state.artwork_url.is_empty() {
        delta.artwork_url = Some(String::new());
    }
    if state.location != MediaLocation::None {
        delta.location = Some(MediaLocation::None);
    }
}

fn play_status_delta(
    state: &DeviceState,
    status: PlayStatus,
    speed: u8,
    duration: u64,
    location: u64,
    at: DateTime<Utc>,
    delta: &mut StateDelta,
) {
    if !accepts_timestamp(state, at) {
        debug!(%at, "dropping stale play status");
        return;
    }
    let position = if duration > 0 {
        location.min(duration)
    } else {
        location
    };
    let status_changed = status != state.play_status;
    let duration_changed = duration != state.duration_secs;

    if status_changed {
        delta.play_status = Some(status);
    }
    if speed != state.play_speed {
        delta.play_speed = Some(speed);
    }
    if duration_changed {
        delta.duration_secs = Some(duration);
    }

    if status_changed || duration_changed || position_is_informative(state, position, at) {
        delta.position = Some(PositionUpdate {
            position_secs: position,
            updated_at: at,
        });
    }
}

fn position_is_informative(state: &DeviceState, position: u64, at: DateTime<Utc>) -> bool {
    let Some(anchor_at) = state.position_updated_at else {
        return position != state.position_secs;
    };
    if !state.play_status.is_moving() {
        return position != state.position_secs;
    }

    let elapsed = u64::try_from((at - anchor_at).num_seconds()).unwrap_or(0);
    let mut predicted = state.position_secs.saturating_add(elapsed);
    if state.duration_secs > 0 {
        predicted = predicted.min(state.duration_secs);
    }

    position > predicted.saturating_add(AHEAD_TOLERANCE_SECS)
        || position.saturating_add(SEEK_BACK_SECS) < state.position_secs
        || position.saturating_add(RESYNC_BEHIND_SECS) < predicted
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 21, 0, 0).unwrap()
    }

    fn play(at: DateTime<Utc>, mode: u8, length: u64, location: u64) -> RawEvent {
        RawEvent::new(
            at,
            RawEventKind::PlayStatus {
                mode,
                speed: 0,
                title_length_secs: length,
                title_location_secs: location,
            },
        )
    }

    fn power(at: DateTime<Utc>, raw: &str) -> RawEvent {
        RawEvent::new(at, RawEventKind::Power { raw: raw.to_string() })
    }

    #[test]
    fn test_first_playing_report_is_emitted() {
        // Arrange
        let mut normalizer = StateNormalizer::new();

        // Act
        let delta = normalizer.apply(&play(t0(), 2, 7200, 120)).unwrap();

        // Assert
        assert_eq!(delta.play_status, Some(PlayStatus::Playing));
        assert_eq!(delta.duration_secs, Some(7200));
        assert_eq!(
            delta.position,
            Some(PositionUpdate {
                position_secs: 120,
                updated_at: t0()
            })
        );
    }

    #[test]
    fn test_position_behind_extrapolation_is_suppressed() {
        // Arrange – anchored at 120 s; five seconds later the host predicts 125.
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 2, 7200, 120));

        // Act
        let delta = normalizer.apply(&play(t0() + Duration::seconds(5), 2, 7200, 121));

        // Assert
        assert_eq!(delta, None);
        assert_eq!(normalizer.state().position_secs, 120);
        assert_eq!(normalizer.state().position_updated_at, Some(t0()));
    }

    #[test]
    fn test_position_on_prediction_is_suppressed() {
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 2, 7200, 120));

        for secs in 1..30 {
            let delta =
                normalizer.apply(&play(t0() + Duration::seconds(secs), 2, 7200, 120 + secs as u64));
            assert_eq!(delta, None, "report at +{secs}s should be coalesced");
        }
    }

    #[test]
    fn test_position_ahead_of_prediction_is_emitted() {
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 2, 7200, 120));

        let delta = normalizer
            .apply(&play(t0() + Duration::seconds(5), 2, 7200, 600))
            .unwrap();

        assert_eq!(delta.position.map(|p| p.position_secs), Some(600));
        assert_eq!(delta.play_status, None);
    }

    #[test]
    fn test_backward_seek_is_emitted() {
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 2, 7200, 600));

        let delta = normalizer
            .apply(&play(t0() + Duration::seconds(1), 2, 7200, 300))
            .unwrap();

        assert_eq!(delta.position.map(|p| p.position_secs), Some(300));
    }

    #[test]
    fn test_pause_reanchors_position() {
        // Arrange
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 2, 7200, 120));
        let paused_at = t0() + Duration::seconds(30);

        // Act
        let delta = normalizer.apply(&play(paused_at, 1, 7200, 150)).unwrap();

        // Assert
        assert_eq!(delta.play_status, Some(PlayStatus::Paused));
        assert_eq!(
            delta.position,
            Some(PositionUpdate {
                position_secs: 150,
                updated_at: paused_at
            })
        );
    }

    #[test]
    fn test_any_move_while_paused_is_emitted() {
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 1, 7200, 150));

        let delta = normalizer
            .apply(&play(t0() + Duration::seconds(1), 1, 7200, 151))
            .unwrap();

        assert_eq!(delta.position.map(|p| p.position_secs), Some(151));
    }

    #[test]
    fn test_position_is_clamped_to_duration() {
        let mut normalizer = StateNormalizer::new();

        normalizer.apply(&play(t0(), 2, 100, 130));

        assert_eq!(normalizer.state().position_secs, 100);
    }

    #[test]
    fn test_duplicate_event_is_a_no_op() {
        let mut normalizer = StateNormalizer::new();
        let event = play(t0(), 2, 7200, 120);
        normalizer.apply(&event);
        let after_first = normalizer.state().clone();

        assert_eq!(normalizer.apply(&event), None);
        assert_eq!(*normalizer.state(), after_first);
    }

    #[test]
    fn test_stale_report_never_moves_position() {
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 1, 7200, 500));

        let delta = normalizer.apply(&play(t0() - Duration::seconds(3), 1, 7200, 10));

        assert_eq!(delta, None);
        assert_eq!(normalizer.state().position_secs, 500);
    }

    #[test]
    fn test_stale_report_cannot_shrink_duration_below_position() {
        // Arrange
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 1, 7200, 500));

        // Act
        let delta = normalizer.apply(&play(t0(), 1, 100, 50));

        // Assert
        assert_eq!(delta, None);
        let state = normalizer.state();
        assert_eq!(state.duration_secs, 7200);
        assert_eq!(state.position_secs, 500);
    }

    #[test]
    fn test_position_near_counter_limit_does_not_overflow() {
        // Arrange – no duration, so nothing clamps the reported position.
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&play(t0(), 2, 0, u64::MAX));

        // Act
        let delta = normalizer.apply(&play(t0() + Duration::seconds(1), 2, 0, u64::MAX));
        let behind = normalizer.apply(&play(t0() + Duration::seconds(2), 2, 0, u64::MAX - 1));

        // Assert
        assert_eq!(delta, None);
        assert_eq!(behind, None);
        assert_eq!(normalizer.state().position_secs, u64::MAX);
    }

    #[test]
    fn test_power_off_clears_media_fields() {
        // Arrange
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&power(t0(), "1"));
        normalizer.apply(&play(t0(), 2, 7200, 120));
        normalizer.apply(&RawEvent::new(t0(), RawEventKind::Title("Heat".into())));
        normalizer.apply(&RawEvent::new(t0(), RawEventKind::MediaType { raw: "3".into() }));

        // Act
        let delta = normalizer
            .apply(&power(t0() + Duration::seconds(10), "0"))
            .unwrap();

        // Assert
        assert_eq!(delta.power, Some(PowerState::Off));
        assert_eq!(delta.title, Some(String::new()));
        assert_eq!(delta.duration_secs, Some(0));
        assert_eq!(delta.media_kind, Some(MediaKind::None));
        let state = normalizer.state();
        assert_eq!(state.play_status, PlayStatus::Stopped);
        assert_eq!(state.position_secs, 0);
    }

    #[test]
    fn test_unrecognised_power_value_maps_to_unknown() {
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&power(t0(), "1"));

        let delta = normalizer.apply(&power(t0(), "7")).unwrap();

        assert_eq!(delta.power, Some(PowerState::Unknown));
    }

    #[test]
    fn test_unchanged_title_is_not_emitted() {
        let mut normalizer = StateNormalizer::new();
        let event = RawEvent::new(t0(), RawEventKind::Title("Heat".into()));
        assert!(normalizer.apply(&event).is_some());

        let later = RawEvent::new(t0() + Duration::seconds(1), RawEventKind::Title("Heat".into()));
        assert_eq!(normalizer.apply(&later), None);
    }

    #[test]
    fn test_unknown_play_mode_is_ignored() {
        let mut normalizer = StateNormalizer::new();
        assert_eq!(normalizer.apply(&play(t0(), 9, 100, 5)), None);
    }

    #[test]
    fn test_reset_forgets_state() {
        let mut normalizer = StateNormalizer::new();
        normalizer.apply(&power(t0(), "1"));

        normalizer.reset();

        assert_eq!(*normalizer.state(), DeviceState::default());
    }
}
