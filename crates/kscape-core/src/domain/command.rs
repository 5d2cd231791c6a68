//! Abstract remote commands and their translation into device commands.
//!
//! The host speaks in terms of what a button means ("play/pause", "digit 5");
//! the player speaks in terms of protocol verbs (`PLAY`, `KEYBOARD_CHARACTER:5`).
//! Translation is a pure table lookup plus parameter validation.  Commands
//! whose meaning depends on the current state (toggles) are first resolved
//! against the [`DeviceState`] with [`Command::resolve`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::state::{DeviceState, PowerState};
use crate::protocol::messages::*;

/// Kind of host-facing entity a command is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    MediaPlayer,
    Remote,
    Sensor,
}

/// A device-agnostic remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    PowerOn,
    PowerOff,
    PowerToggle,
    CursorUp,
    CursorDown,
    CursorLeft,
    CursorRight,
    CursorEnter,
    Back,
    Play,
    Pause,
    PlayPause,
    Stop,
    Previous,
    Next,
    FastForward,
    Rewind,
    Replay,
    /// Numeric key; the digit travels as the command parameter.
    Digit,
    Menu,
    Intermission,
    Collections,
    Covers,
    List,
    // Standard host commands the player has no verb for.
    VolumeUp,
    VolumeDown,
    Mute,
    Home,
    Seek,
}

/// Why a command could not be carried out.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("device is not connected")]
    NotConnected,

    #[error("device rejected the command with status {code:03}")]
    Rejected { code: u16 },

    #[error("timed out waiting for the device to acknowledge")]
    Timeout,

    #[error("unsupported command: {0}")]
    Unsupported(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
}

/// Outcome of resolving a command against the current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Send this (possibly different) command.
    Send(Command),
    /// The device is already where the command would take it; acknowledge
    /// without sending anything.
    AlreadySatisfied,
}

impl Command {
    /// Resolves state-dependent commands.
    ///
    /// - `PowerOn`/`PowerOff` are skipped when the player is already there.
    /// - `PowerToggle` becomes `PowerOff` when on and `PowerOn` otherwise.
    /// - `PlayPause` becomes `Pause` while moving and `Play` otherwise; while
    ///   the player is off it is acknowledged without sending.
    pub fn resolve(self, state: &DeviceState) -> Resolution {
        match self {
            Command::PowerOn if state.power == PowerState::On => Resolution::AlreadySatisfied,
            Command::PowerOff if state.power == PowerState::Off => Resolution::AlreadySatisfied,
            Command::PowerToggle => {
                if state.power == PowerState::On {
                    Resolution::Send(Command::PowerOff)
                } else {
                    Resolution::Send(Command::PowerOn)
                }
            }
            Command::PlayPause if state.power == PowerState::Off => Resolution::AlreadySatisfied,
            Command::PlayPause => {
                if state.play_status.is_moving() {
                    Resolution::Send(Command::Pause)
                } else {
                    Resolution::Send(Command::Play)
                }
            }
            other => Resolution::Send(other),
        }
    }
}

/// Maps abstract commands to device commands.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandTranslator;

impl CommandTranslator {
    pub fn new() -> Self {
        Self
    }

    /// Translates `command` addressed to an entity of `kind`.
    ///
    /// `param` is only consulted for [`Command::Digit`].
    ///
    /// # Errors
    ///
    /// - [`CommandError::Unsupported`] for sensors, for unresolved toggles and
    ///   for commands the player has no verb for.
    /// - [`CommandError::InvalidParameter`] for a missing or out-of-range digit.
    pub fn translate(
        &self,
        kind: EntityKind,
        command: Command,
        param: Option<u32>,
    ) -> Result<DeviceCommand, CommandError> {
        if kind == EntityKind::Sensor {
            return Err(CommandError::Unsupported(format!(
                "sensors accept no commands ({command:?})"
            )));
        }

        let name = match command {
            Command::PowerOn => LEAVE_STANDBY,
            Command::PowerOff => ENTER_STANDBY,
            Command::CursorUp => UP,
            Command::CursorDown => DOWN,
            Command::CursorLeft => LEFT,
            Command::CursorRight => RIGHT,
            Command::CursorEnter => SELECT,
            Command::Back => CANCEL,
            Command::Play => PLAY,
            Command::Pause => PAUSE,
            Command::Stop => STOP,
            Command::Previous => PREVIOUS,
            Command::Next => NEXT,
            Command::FastForward => SCAN_FORWARD,
            Command::Rewind => SCAN_REVERSE,
            Command::Replay => REPLAY,
            Command::Menu => MENU_TOGGLE,
            Command::Intermission => INTERMISSION_TOGGLE,
            Command::Collections => GO_MOVIE_COLLECTIONS,
            Command::Covers => GO_MOVIE_COVERS,
            Command::List => GO_MOVIE_LIST,
            Command::Digit => return digit(param),
            Command::PowerToggle | Command::PlayPause => {
                return Err(CommandError::Unsupported(format!(
                    "{command:?} must be resolved against the device state"
                )))
            }
            Command::VolumeUp
            | Command::VolumeDown
            | Command::Mute
            | Command::Home
            | Command::Seek => {
                return Err(CommandError::Unsupported(format!(
                    "the player has no equivalent for {command:?}"
                )))
            }
        };
        Ok(DeviceCommand::new(name))
    }
}

fn digit(param: Option<u32>) -> Result<DeviceCommand, CommandError> {
    match param {
        Some(d @ 0..=9) => Ok(DeviceCommand::new(KEYBOARD_CHARACTER).with_param(d.to_string())),
        Some(other) => Err(CommandError::InvalidParameter(format!(
            "digit must be 0-9, got {other}"
        ))),
        None => Err(CommandError::InvalidParameter(
            "digit command needs a value".to_string(),
        )),
    }
}
