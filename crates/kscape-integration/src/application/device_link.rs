//! The seam between the application layer and the player connection.
//!
//! [`DeviceConnector`] opens a [`Session`]; the session's [`DeviceLink`] sends
//! commands and its [`EventStream`] yields the unsolicited events.  The TCP
//! implementation lives in `infrastructure::device_session`; tests use
//! `MockDeviceLink` and hand-built sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kscape_core::{CommandError, DeviceCommand, DeviceReply, RawEvent};
use thiserror::Error;
use tokio::sync::mpsc;

/// Why a connection attempt failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    /// TCP connect or handshake did not complete in time.
    #[error("timed out connecting to {0}")]
    Timeout(String),

    /// The address could not be reached.
    #[error("connection to {addr} refused: {reason}")]
    Refused { addr: String, reason: String },

    /// The player answered, but not with a protocol version we speak.
    /// Not retried.
    #[error("protocol mismatch: {0}")]
    ProtocolMismatch(String),
}

impl ConnectError {
    /// `true` for errors that a later attempt cannot fix.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ConnectError::ProtocolMismatch(_))
    }
}

/// Successful acknowledgement of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub reply: DeviceReply,
}

/// Unsolicited events of one session.  Ends when the session does.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::Receiver<RawEvent>,
}

impl EventStream {
    pub fn new(rx: mpsc::Receiver<RawEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the connection is gone.
    pub async fn next(&mut self) -> Option<RawEvent> {
        self.rx.recv().await
    }
}

/// Command side of a live session.
///
/// Implementations serialize `send`: a second caller waits until the first
/// has its acknowledgement or has timed out.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Sends one command and waits for its reply.
    ///
    /// # Errors
    ///
    /// - [`CommandError::NotConnected`] once the session is gone.
    /// - [`CommandError::Timeout`] when no reply arrives in time.
    /// - [`CommandError::Rejected`] for a non-zero reply status.
    async fn send(&self, command: &DeviceCommand) -> Result<Ack, CommandError>;

    fn is_connected(&self) -> bool;

    /// Time since the last byte was received.
    fn idle_for(&self) -> Duration;

    /// Closes the connection.  Idempotent.
    async fn disconnect(&self);
}

/// One connected session: the command link plus its event stream.
pub struct Session {
    pub link: Arc<dyn DeviceLink>,
    pub events: EventStream,
}

/// Opens sessions to a player address.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Connects and completes the handshake.
    ///
    /// # Errors
    ///
    /// See [`ConnectError`].
    async fn connect(&self, address: &str) -> Result<Session, ConnectError>;
}
