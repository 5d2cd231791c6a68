//! # kscape-core
//!
//! Shared library for the Kaleidescape integration containing the device line
//! protocol, the canonical device-state model, the state normalizer and the
//! command translator.
//!
//! It has no dependencies on sockets, async runtimes or the host protocol, so
//! every piece here can be exercised with plain unit tests.
//!
//! # Architecture overview
//!
//! The integration sits between a Kaleidescape movie player (which speaks a
//! line-oriented control protocol on TCP port 10000) and a remote-control host
//! (which speaks JSON over WebSocket).  This crate is the device-facing half of
//! the domain:
//!
//! - **`protocol`** – How bytes travel to and from the player.  Commands are
//!   encoded as `01/<seq>/<NAME>:<params>:\r` lines, replies and unsolicited
//!   events are decoded back into [`DeviceReply`] values.
//!
//! - **`domain`** – Pure logic with no I/O.  The [`StateNormalizer`] folds raw
//!   events into a [`DeviceState`] and emits minimal [`StateDelta`]s; the
//!   [`CommandTranslator`] turns abstract remote commands into device commands;
//!   [`Backoff`] holds the reconnect delay policy.

pub mod domain;
pub mod protocol;

pub use domain::backoff::Backoff;
pub use domain::command::{Command, CommandError, CommandTranslator, EntityKind, Resolution};
pub use domain::normalizer::{normalize, StateNormalizer};
pub use domain::state::{
    ConnectionState, DeviceState, MediaKind, MediaLocation, PlayStatus, PositionUpdate,
    PowerState, RawEvent, RawEventKind, StateDelta,
};
pub use protocol::codec::{decode_command, decode_reply, encode_command, encode_reply, ProtocolError};
pub use protocol::messages::{DeviceCommand, DeviceReply, Sequence};
