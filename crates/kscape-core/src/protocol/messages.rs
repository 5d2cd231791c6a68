//! Message types for the Kaleidescape control protocol.
//!
//! The player speaks a line-oriented text protocol over TCP.  Every line the
//! controller sends is a *command*; every line the player sends is a *reply*,
//! either to a command (carrying the command's sequence digit) or an
//! unsolicited *event* (carrying `!` in place of the sequence digit).
//!
//! ```text
//! controller → player   01/1/GET_PLAY_STATUS:\r
//! player → controller   01/1/000:PLAY_STATUS:2:0:01:07200:00120:001:00300:00060:/74\r\n
//! player → controller   01/!/000:DEVICE_POWER_STATE:0:/94\r\n
//! ```

use std::fmt;

/// TCP port the player's control protocol listens on.
pub const DEFAULT_PORT: u16 = 10_000;

/// Device address used for every command; the integration only ever talks to
/// the player it is connected to directly.
pub const DEVICE_ADDRESS: &str = "01";

/// Oldest control-protocol version the integration can drive.
pub const MIN_PROTOCOL_VERSION: u32 = 16;

/// Status code carried by a successful reply.
pub const STATUS_OK: u16 = 0;

// ── Command and reply names ───────────────────────────────────────────────────

pub const GET_SYSTEM_VERSION: &str = "GET_SYSTEM_VERSION";
pub const SYSTEM_VERSION: &str = "SYSTEM_VERSION";
pub const ENABLE_EVENTS: &str = "ENABLE_EVENTS";

pub const GET_DEVICE_POWER_STATE: &str = "GET_DEVICE_POWER_STATE";
pub const DEVICE_POWER_STATE: &str = "DEVICE_POWER_STATE";
pub const GET_PLAY_STATUS: &str = "GET_PLAY_STATUS";
pub const PLAY_STATUS: &str = "PLAY_STATUS";
pub const GET_PLAYING_TITLE_NAME: &str = "GET_PLAYING_TITLE_NAME";
pub const TITLE_NAME: &str = "TITLE_NAME";
pub const GET_MOVIE_MEDIA_TYPE: &str = "GET_MOVIE_MEDIA_TYPE";
pub const MOVIE_MEDIA_TYPE: &str = "MOVIE_MEDIA_TYPE";
pub const GET_MOVIE_LOCATION: &str = "GET_MOVIE_LOCATION";
pub const MOVIE_LOCATION: &str = "MOVIE_LOCATION";
pub const GET_CONTENT_DETAILS: &str = "GET_CONTENT_DETAILS";
pub const CONTENT_DETAILS: &str = "CONTENT_DETAILS";

pub const LEAVE_STANDBY: &str = "LEAVE_STANDBY";
pub const ENTER_STANDBY: &str = "ENTER_STANDBY";
pub const UP: &str = "UP";
pub const DOWN: &str = "DOWN";
pub const LEFT: &str = "LEFT";
pub const RIGHT: &str = "RIGHT";
pub const SELECT: &str = "SELECT";
pub const CANCEL: &str = "CANCEL";
pub const PREVIOUS: &str = "PREVIOUS";
pub const NEXT: &str = "NEXT";
pub const PLAY: &str = "PLAY";
pub const PAUSE: &str = "PAUSE";
pub const STOP: &str = "STOP";
pub const KEYBOARD_CHARACTER: &str = "KEYBOARD_CHARACTER";
pub const GO_MOVIE_COLLECTIONS: &str = "GO_MOVIE_COLLECTIONS";
pub const GO_MOVIE_COVERS: &str = "GO_MOVIE_COVERS";
pub const GO_MOVIE_LIST: &str = "GO_MOVIE_LIST";
pub const MENU_TOGGLE: &str = "MENU_TOGGLE";
pub const INTERMISSION_TOGGLE: &str = "INTERMISSION_TOGGLE";
pub const SCAN_FORWARD: &str = "SCAN_FORWARD";
pub const SCAN_REVERSE: &str = "SCAN_REVERSE";
pub const REPLAY: &str = "REPLAY";

/// Queries issued right after a successful handshake to build a fresh
/// snapshot of the player, in the order they are sent.
pub const SNAPSHOT_QUERIES: [&str; 6] = [
    GET_DEVICE_POWER_STATE,
    GET_PLAY_STATUS,
    GET_PLAYING_TITLE_NAME,
    GET_MOVIE_MEDIA_TYPE,
    GET_MOVIE_LOCATION,
    GET_CONTENT_DETAILS,
];

// ── Sequence ──────────────────────────────────────────────────────────────────

/// The sequence slot of a reply line.
///
/// Commands carry a digit `1`..=`9` which the player echoes in its reply.
/// Unsolicited events carry `!` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sequence {
    /// Reply to the command that was sent with this sequence digit.
    Request(u8),
    /// Unsolicited state-change notification.
    Event,
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sequence::Request(digit) => write!(f, "{digit}"),
            Sequence::Event => f.write_str("!"),
        }
    }
}

// ── Command ───────────────────────────────────────────────────────────────────

/// A single command line to send to the player.
///
/// ```rust
/// use kscape_core::protocol::DeviceCommand;
///
/// let cmd = DeviceCommand::new("KEYBOARD_CHARACTER").with_param("5");
/// assert_eq!(cmd.name, "KEYBOARD_CHARACTER");
/// assert_eq!(cmd.params, vec!["5".to_string()]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCommand {
    /// Upper-case command name such as `PLAY` or `GET_PLAY_STATUS`.
    pub name: String,
    /// Positional parameters, unescaped.
    pub params: Vec<String>,
}

impl DeviceCommand {
    /// Creates a command with no parameters.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Appends a positional parameter.
    pub fn with_param(mut self, param: impl Into<String>) -> Self {
        self.params.push(param.into());
        self
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for param in &self.params {
            write!(f, ":{param}")?;
        }
        Ok(())
    }
}

// ── Reply ─────────────────────────────────────────────────────────────────────

/// A decoded reply or event line from the player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReply {
    pub sequence: Sequence,
    /// Three-digit status; `000` means success.
    pub status: u16,
    /// Reply name, e.g. `PLAY_STATUS`.  Empty for bare error replies.
    pub name: String,
    /// Positional fields after the name, unescaped.
    pub fields: Vec<String>,
}

impl DeviceReply {
    /// Builds a successful reply to the command sent with `seq`.
    pub fn ok(seq: u8, name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            sequence: Sequence::Request(seq),
            status: STATUS_OK,
            name: name.into(),
            fields,
        }
    }

    /// Builds an unsolicited event.
    pub fn event(name: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            sequence: Sequence::Event,
            status: STATUS_OK,
            name: name.into(),
            fields,
        }
    }

    /// Returns `true` when this line is an unsolicited event.
    pub fn is_event(&self) -> bool {
        self.sequence == Sequence::Event
    }

    /// Returns `true` when the status code signals success.
    pub fn is_ok(&self) -> bool {
        self.status == STATUS_OK
    }

    /// Returns the field at `index`, if present.
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }
}
