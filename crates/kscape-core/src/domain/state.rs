//! Canonical device state and the values that flow into and out of it.
//!
//! - [`RawEvent`] – one signal from the player, stamped with the time it was
//!   received.  Raw values are kept as the player sent them; interpreting them
//!   is the normalizer's job.
//! - [`DeviceState`] – the single authoritative picture of the player.
//! - [`StateDelta`] – the fields that changed, which is what the host side
//!   publishes.

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::protocol::messages::{
    DeviceReply, CONTENT_DETAILS, DEVICE_POWER_STATE, MOVIE_LOCATION, MOVIE_MEDIA_TYPE,
    PLAY_STATUS, TITLE_NAME,
};

/// Field label the player uses for the cover art URL in content details.
pub const COVER_URL_FIELD: &str = "Cover_URL";

// ── Enumerations ──────────────────────────────────────────────────────────────

/// Lifecycle of the device connection as owned by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Connecting again after an established session was lost.
    Reauthenticating,
    /// Permanent failure; only a reconfiguration leaves this state.
    Failed,
}

/// Power as reported by the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PowerState {
    On,
    Off,
    #[default]
    Unknown,
}

impl PowerState {
    /// Maps the player's power value.  Anything other than `0` or `1` is
    /// treated as [`PowerState::Unknown`].
    pub fn from_raw(raw: &str) -> Self {
        match raw.trim() {
            "1" => PowerState::On,
            "0" => PowerState::Off,
            _ => PowerState::Unknown,
        }
    }
}

/// Transport state of the current title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlayStatus {
    #[default]
    Stopped,
    Paused,
    Playing,
    ForwardScan,
    ReverseScan,
}

impl PlayStatus {
    /// Maps the play-mode digit from `PLAY_STATUS`.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(PlayStatus::Stopped),
            1 => Some(PlayStatus::Paused),
            2 => Some(PlayStatus::Playing),
            3 => Some(PlayStatus::ForwardScan),
            4 => Some(PlayStatus::ReverseScan),
            _ => None,
        }
    }

    /// Playing at any speed, including scans.
    pub fn is_moving(self) -> bool {
        matches!(
            self,
            PlayStatus::Playing | PlayStatus::ForwardScan | PlayStatus::ReverseScan
        )
    }

    /// Lower-case label used for sensor values.
    pub fn label(self) -> &'static str {
        match self {
            PlayStatus::Stopped => "none",
            PlayStatus::Paused => "paused",
            PlayStatus::Playing => "playing",
            PlayStatus::ForwardScan => "forward",
            PlayStatus::ReverseScan => "reverse",
        }
    }
}

/// Kind of media loaded in the player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaKind {
    #[default]
    None,
    Dvd,
    Stream,
    BluRay,
}

impl MediaKind {
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw.trim() {
            "0" | "00" => Some(MediaKind::None),
            "1" | "01" => Some(MediaKind::Dvd),
            "2" | "02" => Some(MediaKind::Stream),
            "3" | "03" => Some(MediaKind::BluRay),
            _ => None,
        }
    }
}

/// Where in the title the playhead currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MediaLocation {
    #[default]
    None,
    MainContent,
    Intermission,
    EndCredits,
    DiscMenu,
}

impl MediaLocation {
    pub fn from_raw(raw: &str) -> Option<Self> {
        match raw.trim().trim_start_matches('0') {
            "" => Some(MediaLocation::None),
            "3" => Some(MediaLocation::MainContent),
            "4" => Some(MediaLocation::Intermission),
            "5" => Some(MediaLocation::EndCredits),
            "6" => Some(MediaLocation::DiscMenu),
            _ => None,
        }
    }

    /// Lower-case label used for sensor values.
    pub fn label(self) -> &'static str {
        match self {
            MediaLocation::None => "none",
            MediaLocation::MainContent => "main_content",
            MediaLocation::Intermission => "intermission",
            MediaLocation::EndCredits => "end_credits",
            MediaLocation::DiscMenu => "disc_menu",
        }
    }
}

// ── DeviceState ───────────────────────────────────────────────────────────────

/// The authoritative picture of the player.
///
/// A duration of 0 means no title is loaded.  While a duration is known the
/// position never exceeds it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceState {
    pub power: PowerState,
    pub play_status: PlayStatus,
    pub play_speed: u8,
    pub position_secs: u64,
    pub duration_secs: u64,
    /// When `position_secs` was last accepted.  Strictly increases.
    pub position_updated_at: Option<DateTime<Utc>>,
    pub title: String,
    pub media_kind: MediaKind,
    pub artwork_url: String,
    pub location: MediaLocation,
}

/// A position together with the time it was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionUpdate {
    pub position_secs: u64,
    pub updated_at: DateTime<Utc>,
}

// ── StateDelta ────────────────────────────────────────────────────────────────

/// The set of fields that changed in one normalization step.
///
/// `None` means "unchanged"; a delta with every field `None` is never emitted.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StateDelta {
    pub power: Option<PowerState>,
    pub play_status: Option<PlayStatus>,
    pub play_speed: Option<u8>,
    pub position: Option<PositionUpdate>,
    pub duration_secs: Option<u64>,
    pub title: Option<String>,
    pub media_kind: Option<MediaKind>,
    pub artwork_url: Option<String>,
    pub location: Option<MediaLocation>,
}

impl StateDelta {
    /// Returns `true` when no field changed.
    pub fn is_empty(&self) -> bool {
        *self == StateDelta::default()
    }

    /// Writes every changed field into `state`.
    pub fn apply_to(&self, state: &mut DeviceState) {
        if let Some(power) = self.power {
            state.power = power;
        }
        if let Some(status) = self.play_status {
            state.play_status = status;
        }
        if let Some(speed) = self.play_speed {
            state.play_speed = speed;
        }
        if let Some(position) = self.position {
            state.position_secs = position.position_secs;
            state.position_updated_at = Some(position.updated_at);
        }
        if let Some(duration) = self.duration_secs {
            state.duration_secs = duration;
        }
        if let Some(title) = &self.title {
            state.title.clone_from(title);
        }
        if let Some(kind) = self.media_kind {
            state.media_kind = kind;
        }
        if let Some(url) = &self.artwork_url {
            state.artwork_url.clone_from(url);
        }
        if let Some(location) = self.location {
            state.location = location;
        }
    }
}

// ── RawEvent ──────────────────────────────────────────────────────────────────

/// One signal from the player, stamped with the time it was received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub received_at: DateTime<Utc>,
    pub kind: RawEventKind,
}

/// The payload of a [`RawEvent`], kept close to what the player sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawEventKind {
    Power { raw: String },
    PlayStatus {
        mode: u8,
        speed: u8,
        title_length_secs: u64,
        title_location_secs: u64,
    },
    Title(String),
    MediaType { raw: String },
    Location { raw: String },
    Artwork(String),
}

impl RawEvent {
    pub fn new(received_at: DateTime<Utc>, kind: RawEventKind) -> Self {
        Self { received_at, kind }
    }

    /// Extracts a state signal from a reply or event line.
    ///
    /// Returns `None` for error replies and for lines that carry nothing the
    /// integration tracks.
    pub fn from_reply(reply: &DeviceReply, received_at: DateTime<Utc>) -> Option<Self> {
        if !reply.is_ok() {
            return None;
        }
        let first = || reply.field(0).unwrap_or_default().to_string();

        let kind = match reply.name.as_str() {
            DEVICE_POWER_STATE => RawEventKind::Power { raw: first() },
            PLAY_STATUS => parse_play_status(reply)?,
            TITLE_NAME => RawEventKind::Title(first()),
            MOVIE_MEDIA_TYPE => RawEventKind::MediaType { raw: first() },
            MOVIE_LOCATION => RawEventKind::Location { raw: first() },
            CONTENT_DETAILS if reply.field(1) == Some(COVER_URL_FIELD) => {
                RawEventKind::Artwork(reply.field(2).unwrap_or_default().to_string())
            }
            _ => return None,
        };
        Some(Self::new(received_at, kind))
    }
}

/// `PLAY_STATUS:mode:speed:title#:title_length:title_location:chapter#:...`
fn parse_play_status(reply: &DeviceReply) -> Option<RawEventKind> {
    let number = |index: usize| -> Option<u64> { reply.field(index)?.trim().parse().ok() };

    let parsed = (|| {
        Some(RawEventKind::PlayStatus {
            mode: u8::try_from(number(0)?).ok()?,
            speed: u8::try_from(number(1)?).ok()?,
            title_length_secs: number(3)?,
            title_location_secs: number(4)?,
        })
    })();

    if parsed.is_none() {
        warn!(fields = ?reply.fields, "ignoring malformed PLAY_STATUS");
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 20, 0, 0).unwrap()
    }

    fn fields(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn test_power_from_raw_maps_ambiguous_values_to_unknown() {
        assert_eq!(PowerState::from_raw("1"), PowerState::On);
        assert_eq!(PowerState::from_raw("0"), PowerState::Off);
        assert_eq!(PowerState::from_raw("2"), PowerState::Unknown);
        assert_eq!(PowerState::from_raw(""), PowerState::Unknown);
    }

    #[test]
    fn test_media_location_accepts_zero_padded_codes() {
        assert_eq!(MediaLocation::from_raw("03"), Some(MediaLocation::MainContent));
        assert_eq!(MediaLocation::from_raw("00"), Some(MediaLocation::None));
        assert_eq!(MediaLocation::from_raw("9"), None);
    }

    #[test]
    fn test_from_reply_parses_play_status() {
        // Arrange
        let reply = DeviceReply::event(
            PLAY_STATUS,
            fields(&["2", "0", "01", "07200", "00120", "001", "00300", "00060"]),
        );

        // Act
        let event = RawEvent::from_reply(&reply, at()).unwrap();

        // Assert
        assert_eq!(
            event.kind,
            RawEventKind::PlayStatus {
                mode: 2,
                speed: 0,
                title_length_secs: 7200,
                title_location_secs: 120,
            }
        );
        assert_eq!(event.received_at, at());
    }

    #[test]
    fn test_from_reply_ignores_truncated_play_status() {
        let reply = DeviceReply::event(PLAY_STATUS, fields(&["2", "0"]));
        assert_eq!(RawEvent::from_reply(&reply, at()), None);
    }

    #[test]
    fn test_from_reply_picks_cover_url_from_content_details() {
        let reply = DeviceReply::event(
            CONTENT_DETAILS,
            fields(&["3", COVER_URL_FIELD, "http://10.0.0.5/cover.jpg"]),
        );

        let event = RawEvent::from_reply(&reply, at()).unwrap();

        assert_eq!(
            event.kind,
            RawEventKind::Artwork("http://10.0.0.5/cover.jpg".to_string())
        );
    }

    #[test]
    fn test_from_reply_skips_other_content_details() {
        let reply = DeviceReply::event(CONTENT_DETAILS, fields(&["4", "Rating", "PG"]));
        assert_eq!(RawEvent::from_reply(&reply, at()), None);
    }

    #[test]
    fn test_from_reply_skips_error_status() {
        let mut reply = DeviceReply::event(DEVICE_POWER_STATE, fields(&["1"]));
        reply.status = 14;
        assert_eq!(RawEvent::from_reply(&reply, at()), None);
    }

    #[test]
    fn test_delta_apply_only_touches_changed_fields() {
        // Arrange
        let mut state = DeviceState {
            title: "Heat".to_string(),
            power: PowerState::On,
            ..DeviceState::default()
        };
        let delta = StateDelta {
            play_status: Some(PlayStatus::Paused),
            ..StateDelta::default()
        };

        // Act
        delta.apply_to(&mut state);

        // Assert
        assert_eq!(state.play_status, PlayStatus::Paused);
        assert_eq!(state.title, "Heat");
        assert_eq!(state.power, PowerState::On);
    }

    #[test]
    fn test_empty_delta_is_empty() {
        assert!(StateDelta::default().is_empty());
        assert!(!StateDelta {
            play_speed: Some(1),
            ..StateDelta::default()
        }
        .is_empty());
    }
}
