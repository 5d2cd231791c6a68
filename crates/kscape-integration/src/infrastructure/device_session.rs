//! TCP session to a Kaleidescape player.
//!
//! [`TcpConnector`] opens the socket, starts the line reader and runs the
//! handshake (`GET_SYSTEM_VERSION`, then `ENABLE_EVENTS`).  The resulting
//! [`TcpSession`] implements [`DeviceLink`].
//!
//! # Line streaming
//!
//! A single `read()` may return part of a line or several lines at once, so
//! the reader accumulates bytes in `recv_buf` and splits complete lines off
//! the front until the codec reports `InsufficientData`.  A line that fails to
//! parse is logged and skipped; the stream itself stays usable.
//!
//! # One command in flight
//!
//! `send` holds the writer lock from the write until the matching reply (or
//! the timeout), so a second caller waits.  Replies are matched on the
//! sequence digit; lines with `!` in the sequence slot are events and go to
//! the [`EventStream`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use kscape_core::protocol::codec::{next_line, parse_reply_line};
use kscape_core::protocol::messages::{
    ENABLE_EVENTS, GET_SYSTEM_VERSION, MIN_PROTOCOL_VERSION, SYSTEM_VERSION,
};
use kscape_core::protocol::SequenceCounter;
use kscape_core::{
    encode_command, CommandError, DeviceCommand, DeviceReply, ProtocolError, RawEvent, Sequence,
};

use crate::application::device_link::{
    Ack, ConnectError, DeviceConnector, DeviceLink, EventStream, Session,
};

/// Opens [`TcpSession`]s.
#[derive(Debug, Clone, Copy)]
pub struct TcpConnector {
    connect_timeout: Duration,
    command_timeout: Duration,
}

impl TcpConnector {
    /// `connect_timeout` bounds the TCP connect and the handshake separately;
    /// `command_timeout` bounds every acknowledgement afterwards.
    pub fn new(connect_timeout: Duration, command_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            command_timeout,
        }
    }
}

#[async_trait]
impl DeviceConnector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Session, ConnectError> {
        let stream = match timeout(self.connect_timeout, TcpStream::connect(address)).await {
            Err(_) => return Err(ConnectError::Timeout(address.to_string())),
            Ok(Err(e)) => {
                return Err(ConnectError::Refused {
                    addr: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(stream)) => stream,
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("session {address}: could not set TCP_NODELAY: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        let (events_tx, events_rx) = mpsc::channel(128);
        let shared = Arc::new(Shared::new());
        let reader = tokio::spawn(read_device_lines(
            read_half,
            address.to_string(),
            Arc::clone(&shared),
            events_tx,
        ));

        let session = TcpSession {
            id: address.to_string(),
            writer: Mutex::new(write_half),
            shared,
            sequence: SequenceCounter::new(),
            command_timeout: self.command_timeout,
            reader,
        };

        match timeout(self.connect_timeout, session.handshake()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                session.disconnect().await;
                return Err(e);
            }
            Err(_) => {
                session.disconnect().await;
                return Err(ConnectError::Timeout(address.to_string()));
            }
        }

        Ok(Session {
            link: Arc::new(session),
            events: EventStream::new(events_rx),
        })
    }
}

/// A reply slot waiting for the line with this sequence digit.
struct Pending {
    seq: u8,
    reply: oneshot::Sender<DeviceReply>,
}

/// State shared between the session handle and its reader task.
struct Shared {
    connected: AtomicBool,
    /// Set once the player sends something that does not parse.
    protocol_fault: AtomicBool,
    started: Instant,
    last_rx_ms: AtomicU64,
    pending: Mutex<Option<Pending>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            protocol_fault: AtomicBool::new(false),
            started: Instant::now(),
            last_rx_ms: AtomicU64::new(0),
            pending: Mutex::new(None),
        }
    }

    fn touch(&self) {
        let now = u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_rx_ms.store(now, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let last = Duration::from_millis(self.last_rx_ms.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    async fn complete(&self, session_id: &str, seq: u8, reply: DeviceReply) {
        let mut pending = self.pending.lock().await;
        match pending.take() {
            Some(waiting) if waiting.seq == seq => {
                // The sender may have timed out in the meantime.
                let _ = waiting.reply.send(reply);
            }
            other => {
                debug!(
                    "session {session_id}: reply {} with sequence {seq} matches no request",
                    reply.name
                );
                *pending = other;
            }
        }
    }
}

/// One live connection to a player.
pub struct TcpSession {
    id: String,
    /// Doubles as the one-command-in-flight lock.
    writer: Mutex<OwnedWriteHalf>,
    shared: Arc<Shared>,
    sequence: SequenceCounter,
    command_timeout: Duration,
    reader: JoinHandle<()>,
}

impl TcpSession {
    async fn handshake(&self) -> Result<(), ConnectError> {
        let ack = self
            .send(&DeviceCommand::new(GET_SYSTEM_VERSION))
            .await
            .map_err(|e| self.handshake_error(e))?;
        let reply = ack.reply;
        if reply.name != SYSTEM_VERSION {
            return Err(ConnectError::ProtocolMismatch(format!(
                "expected {SYSTEM_VERSION}, got {:?}",
                reply.name
            )));
        }
        let protocol = reply
            .field(0)
            .and_then(|v| v.trim().parse::<u32>().ok())
            .ok_or_else(|| {
                ConnectError::ProtocolMismatch(format!("malformed {SYSTEM_VERSION}: {:?}", reply.fields))
            })?;
        if protocol < MIN_PROTOCOL_VERSION {
            return Err(ConnectError::ProtocolMismatch(format!(
                "protocol {protocol} is older than {MIN_PROTOCOL_VERSION}"
            )));
        }

        self.send(&DeviceCommand::new(ENABLE_EVENTS))
            .await
            .map_err(|e| self.handshake_error(e))?;

        info!(
            "session {}: protocol {protocol}, system {}",
            self.id,
            reply.field(1).unwrap_or("unknown")
        );
        Ok(())
    }

    fn handshake_error(&self, error: CommandError) -> ConnectError {
        if self.shared.protocol_fault.load(Ordering::Acquire) {
            return ConnectError::ProtocolMismatch("player sent unparsable data".to_string());
        }
        match error {
            CommandError::Timeout => ConnectError::Timeout(self.id.clone()),
            CommandError::Rejected { code } => {
                ConnectError::ProtocolMismatch(format!("handshake rejected with status {code:03}"))
            }
            other => ConnectError::Refused {
                addr: self.id.clone(),
                reason: other.to_string(),
            },
        }
    }

    fn mark_disconnected(&self) {
        self.shared.connected.store(false, Ordering::Release);
    }
}

#[async_trait]
impl DeviceLink for TcpSession {
    async fn send(&self, command: &DeviceCommand) -> Result<Ack, CommandError> {
        if !self.is_connected() {
            return Err(CommandError::NotConnected);
        }
        let mut writer = self.writer.lock().await;
        if !self.is_connected() {
            return Err(CommandError::NotConnected);
        }

        let seq = self.sequence.next();
        let bytes = encode_command(command, seq)
            .map_err(|e| CommandError::InvalidParameter(e.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        *self.shared.pending.lock().await = Some(Pending {
            seq,
            reply: reply_tx,
        });

        debug!("session {}: -> {command} (seq {seq})", self.id);
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("session {}: write failed: {e}", self.id);
            self.mark_disconnected();
            self.shared.pending.lock().await.take();
            return Err(CommandError::NotConnected);
        }

        let reply = match timeout(self.command_timeout, reply_rx).await {
            Ok(Ok(reply)) => reply,
            // The reader dropped the slot: the connection is gone.
            Ok(Err(_)) => return Err(CommandError::NotConnected),
            Err(_) => {
                self.shared.pending.lock().await.take();
                warn!("session {}: no reply to {command} within {:?}", self.id, self.command_timeout);
                return Err(CommandError::Timeout);
            }
        };
        drop(writer);

        if reply.is_ok() {
            Ok(Ack { reply })
        } else {
            Err(CommandError::Rejected { code: reply.status })
        }
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    fn idle_for(&self) -> Duration {
        self.shared.idle_for()
    }

    async fn disconnect(&self) {
        self.mark_disconnected();
        self.reader.abort();
        self.shared.pending.lock().await.take();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("session {}: shutdown: {e}", self.id);
        }
        info!("session {}: disconnected", self.id);
    }
}

impl Drop for TcpSession {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

// ── Streaming line reader ─────────────────────────────────────────────────────

/// Reads lines from the player until EOF or a read error.
///
/// Replies complete the pending request; events are normalized into
/// [`RawEvent`]s and sent to `events`.  On exit the session is marked
/// disconnected, the pending request fails and the event stream ends.
async fn read_device_lines(
    mut read_half: OwnedReadHalf,
    session_id: String,
    shared: Arc<Shared>,
    events: mpsc::Sender<RawEvent>,
) {
    let mut recv_buf: Vec<u8> = Vec::with_capacity(4096);
    let mut read_tmp = vec![0u8; 4096];

    loop {
        let n = match read_half.read(&mut read_tmp).await {
            Ok(0) => {
                debug!("session {session_id}: player closed the connection (EOF)");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("session {session_id}: read failed: {e}");
                break;
            }
        };
        shared.touch();
        recv_buf.extend_from_slice(&read_tmp[..n]);

        loop {
            let (line, consumed) = match next_line(&recv_buf) {
                Ok((line, consumed)) => (line.to_string(), consumed),
                Err(ProtocolError::InsufficientData { .. }) => break,
                Err(e) => {
                    warn!("session {session_id}: discarding unreadable input: {e}");
                    shared.protocol_fault.store(true, Ordering::Release);
                    let skip = recv_buf
                        .iter()
                        .position(|b| *b == b'\r' || *b == b'\n')
                        .map_or(recv_buf.len(), |p| p + 1);
                    recv_buf.drain(..skip);
                    continue;
                }
            };
            recv_buf.drain(..consumed);

            let reply = match parse_reply_line(&line) {
                Ok(reply) => reply,
                Err(e) => {
                    warn!("session {session_id}: skipping line {line:?}: {e}");
                    shared.protocol_fault.store(true, Ordering::Release);
                    continue;
                }
            };
            debug!("session {session_id}: <- {line}");

            match reply.sequence {
                Sequence::Request(seq) => shared.complete(&session_id, seq, reply).await,
                Sequence::Event => match RawEvent::from_reply(&reply, Utc::now()) {
                    Some(event) => {
                        if events.send(event).await.is_err() {
                            debug!("session {session_id}: event stream dropped");
                        }
                    }
                    None => debug!("session {session_id}: ignoring event {}", reply.name),
                },
            }
        }
    }

    shared.connected.store(false, Ordering::Release);
    shared.pending.lock().await.take();
}
