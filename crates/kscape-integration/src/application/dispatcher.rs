//! Single-consumer command queue in front of the device link.
//!
//! Every device command from every host connection goes through one
//! [`run_dispatcher`] task, so at most one command is ever in flight.  An
//! envelope carries the full command list of one host request; its commands
//! reach the player in order and the batch stops at the first failure.
//!
//! The dispatcher reads the current link from the supervisor's watch slot;
//! with no link it answers `NotConnected` without sending.

use std::sync::Arc;

use kscape_core::{CommandError, DeviceCommand};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::debug;

use crate::application::device_link::{Ack, DeviceLink};

/// Slot holding the link of the live session, if any.
pub type LinkSlot = watch::Receiver<Option<Arc<dyn DeviceLink>>>;

/// Result of one envelope: every ack, or the first error.
pub type BatchResult = Result<Vec<Ack>, CommandError>;

/// The commands of one host request and where to deliver the outcome.
#[derive(Debug)]
pub struct CommandEnvelope {
    pub commands: Vec<DeviceCommand>,
    pub reply: oneshot::Sender<BatchResult>,
}

impl CommandEnvelope {
    /// Builds an envelope and the receiver for its result.
    pub fn new(commands: Vec<DeviceCommand>) -> (Self, oneshot::Receiver<BatchResult>) {
        let (reply, rx) = oneshot::channel();
        (Self { commands, reply }, rx)
    }
}

/// Sends queued batches one command at a time until every sender is dropped.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<CommandEnvelope>, link: LinkSlot) {
    while let Some(envelope) = rx.recv().await {
        let result = send_batch(&envelope.commands, &link).await;
        // The requester may have given up; nothing to do then.
        let _ = envelope.reply.send(result);
    }
    debug!("command queue closed; dispatcher exiting");
}

async fn send_batch(commands: &[DeviceCommand], slot: &LinkSlot) -> BatchResult {
    let mut acks = Vec::with_capacity(commands.len());
    for command in commands {
        // Re-read per command: the session may have changed mid-batch.
        let current = slot.borrow().clone();
        let Some(link) = current else {
            debug!("dropping {command}: no device session");
            return Err(CommandError::NotConnected);
        };
        match link.send(command).await {
            Ok(ack) => {
                debug!("{command} acknowledged");
                acks.push(ack);
            }
            Err(e) => {
                debug!("{command} failed: {e}");
                return Err(e);
            }
        }
    }
    Ok(acks)
}
