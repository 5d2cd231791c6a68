//! Host-visible entities and their attribute and command vocabularies.
//!
//! One configured player is exposed as five entities:
//!
//! | Entity id                        | Kind         | Purpose                        |
//! |----------------------------------|--------------|--------------------------------|
//! | `media_player.<id>`              | media player | transport, now-playing info    |
//! | `remote.<id>`                    | remote       | button pad and simple commands |
//! | `sensor.media_location.<id>`     | sensor       | main content / credits / menu  |
//! | `sensor.play_speed.<id>`         | sensor       | scan speed                     |
//! | `sensor.play_status.<id>`        | sensor       | playing / paused / ...         |
//!
//! Attributes are always computed from the full [`DeviceState`]; the adapter
//! diffs them against what it last published to produce minimal updates.

use chrono::SecondsFormat;
use kscape_core::{Command, CommandError, DeviceState, EntityKind, MediaKind, PlayStatus, PowerState};
use serde_json::{json, Map, Value};

use crate::domain::config::DeviceEndpoint;

pub const MEDIA_PLAYER_FEATURES: &[&str] = &[
    "on_off",
    "toggle",
    "play_pause",
    "stop",
    "next",
    "previous",
    "fast_forward",
    "rewind",
    "dpad",
    "numpad",
    "menu",
    "media_duration",
    "media_position",
    "media_title",
    "media_type",
    "media_image_url",
];

pub const MEDIA_PLAYER_SIMPLE_COMMANDS: &[&str] = &[
    "MOVIE_COLLECTIONS",
    "MOVIE_COVERS",
    "MOVIE_LIST",
    "INTERMISSION",
    "CANCEL",
];

pub const REMOTE_FEATURES: &[&str] = &["on_off", "toggle", "send_cmd"];

pub const REMOTE_SIMPLE_COMMANDS: &[&str] = &[
    "up", "down", "left", "right", "select", "back", "exit", "play", "pause", "play_pause",
    "stop", "next", "prev", "power_on", "standby", "menu_toggle", "replay", "scan_forward",
    "scan_reverse", "intermission", "collections", "covers", "list", "digit_0", "digit_1",
    "digit_2", "digit_3", "digit_4", "digit_5", "digit_6", "digit_7", "digit_8", "digit_9",
];

/// Physical remote buttons and the remote command each short press sends.
pub const REMOTE_BUTTON_MAPPING: &[(&str, &str)] = &[
    ("DPAD_UP", "up"),
    ("DPAD_DOWN", "down"),
    ("DPAD_LEFT", "left"),
    ("DPAD_RIGHT", "right"),
    ("DPAD_MIDDLE", "select"),
    ("PREV", "prev"),
    ("PLAY", "play_pause"),
    ("NEXT", "next"),
    ("POWER", "toggle"),
    ("MENU", "menu_toggle"),
    ("STOP", "stop"),
];

/// Availability of an entity as seen by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Availability {
    /// Registered, but the player has not been reached yet.
    #[default]
    Unconfigured,
    Available,
    Unavailable,
}

/// Which sensor a sensor entity reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SensorKind {
    MediaLocation,
    PlaySpeed,
    PlayStatus,
}

impl SensorKind {
    fn slug(self) -> &'static str {
        match self {
            SensorKind::MediaLocation => "media_location",
            SensorKind::PlaySpeed => "play_speed",
            SensorKind::PlayStatus => "play_status",
        }
    }

    fn label(self) -> &'static str {
        match self {
            SensorKind::MediaLocation => "Media Location",
            SensorKind::PlaySpeed => "Play Speed",
            SensorKind::PlayStatus => "Play Status",
        }
    }
}

/// One step of a parsed host command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandStep {
    pub command: Command,
    pub param: Option<u32>,
}

impl CommandStep {
    fn plain(command: Command) -> Self {
        Self {
            command,
            param: None,
        }
    }
}

/// A registered entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityDef {
    pub entity_id: String,
    pub kind: EntityKind,
    pub sensor: Option<SensorKind>,
    pub name: String,
    pub device_id: String,
}

/// Builds the entity set for the configured player.
pub fn entities_for(device: &DeviceEndpoint) -> Vec<EntityDef> {
    let mut entities = vec![
        EntityDef {
            entity_id: format!("media_player.{}", device.id),
            kind: EntityKind::MediaPlayer,
            sensor: None,
            name: device.name.clone(),
            device_id: device.id.clone(),
        },
        EntityDef {
            entity_id: format!("remote.{}", device.id),
            kind: EntityKind::Remote,
            sensor: None,
            name: format!("{} Remote", device.name),
            device_id: device.id.clone(),
        },
    ];
    for sensor in [
        SensorKind::MediaLocation,
        SensorKind::PlaySpeed,
        SensorKind::PlayStatus,
    ] {
        entities.push(EntityDef {
            entity_id: format!("sensor.{}.{}", sensor.slug(), device.id),
            kind: EntityKind::Sensor,
            sensor: Some(sensor),
            name: format!("{} {}", device.name, sensor.label()),
            device_id: device.id.clone(),
        });
    }
    entities
}

impl EntityDef {
    /// `entity_type` as it appears on the wire.
    pub fn entity_type(&self) -> &'static str {
        match self.kind {
            EntityKind::MediaPlayer => "media_player",
            EntityKind::Remote => "remote",
            EntityKind::Sensor => "sensor",
        }
    }

    /// Registration payload for `get_available_entities`.
    pub fn definition(&self) -> Value {
        let (features, options): (&[&str], Value) = match self.kind {
            EntityKind::MediaPlayer => (
                MEDIA_PLAYER_FEATURES,
                json!({ "simple_commands": MEDIA_PLAYER_SIMPLE_COMMANDS }),
            ),
            EntityKind::Remote => (
                REMOTE_FEATURES,
                json!({
                    "simple_commands": REMOTE_SIMPLE_COMMANDS,
                    "button_mapping": remote_button_mapping(),
                    "user_interface": { "pages": remote_ui_pages() },
                }),
            ),
            EntityKind::Sensor => (&[], json!({})),
        };
        json!({
            "entity_id": self.entity_id,
            "entity_type": self.entity_type(),
            "device_id": self.device_id,
            "name": { "en": self.name },
            "features": features,
            "options": options,
        })
    }

    /// Full attribute set for `state` at the given availability.
    pub fn attributes(&self, state: &DeviceState, availability: Availability) -> Map<String, Value> {
        let available = availability == Availability::Available;
        let mut attrs = Map::new();

        match (self.kind, self.sensor) {
            (EntityKind::MediaPlayer, _) => {
                attrs.insert("state".into(), json!(media_player_state(state, available)));
                attrs.insert("media_position".into(), json!(state.position_secs));
                attrs.insert("media_duration".into(), json!(state.duration_secs));
                attrs.insert(
                    "media_position_updated_at".into(),
                    json!(state
                        .position_updated_at
                        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
                        .unwrap_or_default()),
                );
                attrs.insert("media_title".into(), json!(state.title));
                attrs.insert("media_type".into(), json!(media_type(state.media_kind)));
                attrs.insert("media_image_url".into(), json!(state.artwork_url));
            }
            (EntityKind::Remote, _) => {
                let label = if !available {
                    "UNAVAILABLE"
                } else {
                    power_label(state.power)
                };
                attrs.insert("state".into(), json!(label));
            }
            (EntityKind::Sensor, sensor) => {
                attrs.insert(
                    "state".into(),
                    json!(if available { "ON" } else { "UNAVAILABLE" }),
                );
                let value = match sensor {
                    Some(SensorKind::MediaLocation) => json!(state.location.label()),
                    Some(SensorKind::PlaySpeed) => json!(state.play_speed),
                    Some(SensorKind::PlayStatus) | None => json!(state.play_status.label()),
                };
                attrs.insert("value".into(), value);
                attrs.insert("unit".into(), json!(""));
            }
        }
        attrs
    }

    /// Parses a host command into device-agnostic steps.
    ///
    /// # Errors
    ///
    /// [`CommandError::Unsupported`] for names outside this entity's
    /// vocabulary and [`CommandError::InvalidParameter`] for missing or
    /// malformed parameters.
    pub fn parse_command(
        &self,
        cmd_id: &str,
        params: Option<&Map<String, Value>>,
    ) -> Result<Vec<CommandStep>, CommandError> {
        match self.kind {
            EntityKind::MediaPlayer => media_player_command(cmd_id, params).map(|s| vec![s]),
            EntityKind::Remote => remote_command(cmd_id, params),
            EntityKind::Sensor => Err(CommandError::Unsupported(format!(
                "{} accepts no commands",
                self.entity_id
            ))),
        }
    }
}

fn remote_button_mapping() -> Vec<Value> {
    REMOTE_BUTTON_MAPPING
        .iter()
        .map(|(button, cmd_id)| json!({ "button": button, "short_press": { "cmd_id": cmd_id } }))
        .collect()
}

/// A single "Power" page: a full-width On button on top, Standby at the bottom.
fn remote_ui_pages() -> Vec<Value> {
    let text_button = |text: &str, y: u8, cmd_id: &str| {
        json!({
            "type": "text",
            "text": text,
            "location": { "x": 0, "y": y },
            "size": { "width": 6, "height": 1 },
            "command": { "cmd_id": cmd_id },
        })
    };
    vec![json!({
        "page_id": "page1",
        "name": "Power",
        "grid": { "width": 6, "height": 6 },
        "items": [text_button("Power On", 0, "on"), text_button("Standby", 5, "off")],
    })]
}

fn power_label(power: PowerState) -> &'static str {
    match power {
        PowerState::On => "ON",
        PowerState::Off => "OFF",
        PowerState::Unknown => "UNKNOWN",
    }
}

fn media_player_state(state: &DeviceState, available: bool) -> &'static str {
    if !available {
        return "UNAVAILABLE";
    }
    match state.power {
        PowerState::On => match state.play_status {
            PlayStatus::Stopped => "ON",
            PlayStatus::Paused => "PAUSED",
            PlayStatus::Playing | PlayStatus::ForwardScan | PlayStatus::ReverseScan => "PLAYING",
        },
        other => power_label(other),
    }
}

fn media_type(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::None => "",
        MediaKind::Stream => "VIDEO",
        MediaKind::Dvd | MediaKind::BluRay => "MOVIE",
    }
}

fn media_player_command(
    cmd_id: &str,
    params: Option<&Map<String, Value>>,
) -> Result<CommandStep, CommandError> {
    let command = match cmd_id {
        "on" => Command::PowerOn,
        "off" => Command::PowerOff,
        "toggle" => Command::PowerToggle,
        "play_pause" => Command::PlayPause,
        "stop" => Command::Stop,
        "previous" => Command::Previous,
        "next" => Command::Next,
        "cursor_up" => Command::CursorUp,
        "cursor_down" => Command::CursorDown,
        "cursor_left" => Command::CursorLeft,
        "cursor_right" => Command::CursorRight,
        "cursor_enter" => Command::CursorEnter,
        "back" | "CANCEL" => Command::Back,
        "menu" => Command::Menu,
        "fast_forward" => Command::FastForward,
        "rewind" => Command::Rewind,
        "MOVIE_COLLECTIONS" => Command::Collections,
        "MOVIE_COVERS" => Command::Covers,
        "MOVIE_LIST" => Command::List,
        "INTERMISSION" => Command::Intermission,
        "volume_up" => Command::VolumeUp,
        "volume_down" => Command::VolumeDown,
        "mute_toggle" | "mute" | "unmute" => Command::Mute,
        "home" => Command::Home,
        "seek" => Command::Seek,
        "digit" => {
            return Ok(CommandStep {
                command: Command::Digit,
                param: Some(digit_param(params)?),
            })
        }
        other => return digit_command(other),
    };
    Ok(CommandStep::plain(command))
}

fn remote_command(
    cmd_id: &str,
    params: Option<&Map<String, Value>>,
) -> Result<Vec<CommandStep>, CommandError> {
    match cmd_id {
        "on" => Ok(vec![CommandStep::plain(Command::PowerOn)]),
        "off" => Ok(vec![CommandStep::plain(Command::PowerOff)]),
        "toggle" => Ok(vec![CommandStep::plain(Command::PowerToggle)]),
        "send_cmd" => {
            let name = params
                .and_then(|p| p.get("command"))
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    CommandError::InvalidParameter("send_cmd needs params.command".to_string())
                })?;
            // `remote.on` style names address the entity's own commands.
            if let Some(own) = name.strip_prefix("remote.") {
                return match own {
                    "on" | "off" | "toggle" => remote_command(own, None),
                    other => Err(CommandError::Unsupported(format!("remote.{other}"))),
                };
            }
            Ok(vec![simple_command(name)?])
        }
        "send_cmd_sequence" => {
            let sequence = params
                .and_then(|p| p.get("sequence"))
                .and_then(Value::as_array)
                .ok_or_else(|| {
                    CommandError::InvalidParameter(
                        "send_cmd_sequence needs params.sequence".to_string(),
                    )
                })?;
            if sequence.is_empty() {
                return Err(CommandError::InvalidParameter(
                    "send_cmd_sequence needs at least one command".to_string(),
                ));
            }
            sequence
                .iter()
                .map(|item| {
                    item.as_str()
                        .ok_or_else(|| {
                            CommandError::InvalidParameter(format!(
                                "sequence items must be strings, got {item}"
                            ))
                        })
                        .and_then(simple_command)
                })
                .collect()
        }
        other => Err(CommandError::Unsupported(format!("remote command {other}"))),
    }
}

fn simple_command(name: &str) -> Result<CommandStep, CommandError> {
    let command = match name {
        "up" => Command::CursorUp,
        "down" => Command::CursorDown,
        "left" => Command::CursorLeft,
        "right" => Command::CursorRight,
        "select" => Command::CursorEnter,
        "back" | "exit" => Command::Back,
        "play" => Command::Play,
        "pause" => Command::Pause,
        "play_pause" => Command::PlayPause,
        "stop" => Command::Stop,
        "next" => Command::Next,
        "prev" => Command::Previous,
        "power_on" => Command::PowerOn,
        "standby" => Command::PowerOff,
        "menu_toggle" => Command::Menu,
        "replay" => Command::Replay,
        "scan_forward" => Command::FastForward,
        "scan_reverse" => Command::Rewind,
        "intermission" => Command::Intermission,
        "collections" => Command::Collections,
        "covers" => Command::Covers,
        "list" => Command::List,
        other => return digit_command(other),
    };
    Ok(CommandStep::plain(command))
}

/// `digit_<n>`; anything else is an unknown command.
fn digit_command(name: &str) -> Result<CommandStep, CommandError> {
    let Some(value) = name.strip_prefix("digit_") else {
        return Err(CommandError::Unsupported(format!("unknown command {name}")));
    };
    let digit = value
        .parse::<u32>()
        .map_err(|_| CommandError::InvalidParameter(format!("{name} is not a digit")))?;
    Ok(CommandStep {
        command: Command::Digit,
        param: Some(digit),
    })
}

fn digit_param(params: Option<&Map<String, Value>>) -> Result<u32, CommandError> {
    let value = params
        .and_then(|p| p.get("value"))
        .ok_or_else(|| CommandError::InvalidParameter("digit needs params.value".to_string()))?;
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| CommandError::InvalidParameter(format!("digit value {value} is not a number")))
}
