//! Scripted in-process Kaleidescape player for integration tests.
//!
//! The simulator listens on an ephemeral port, decodes command lines with the
//! `kscape-core` codec and answers each one from a table of canned replies.
//! Tests can push unsolicited events, drop the live connection, go silent
//! (stop answering) and inspect every command that arrived.
//!
//! Every decoded command counts as in flight until its reply is written, so
//! [`DeviceSimulator::max_in_flight`] reports whether a client ever pipelined
//! a second command before the first was answered.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use kscape_core::protocol::messages::*;
use kscape_core::{decode_command, encode_reply, DeviceCommand, DeviceReply, ProtocolError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What the simulator answers to one command name.
#[derive(Debug, Clone)]
pub enum Script {
    /// Reply `000:<name>:<fields...>`.
    Reply { name: String, fields: Vec<String> },
    /// Reply with a device error status and no body.
    Error(u16),
}

impl Script {
    pub fn reply(name: &str, fields: &[&str]) -> Self {
        Script::Reply {
            name: name.to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
        }
    }
}

enum Outgoing {
    Line(Vec<u8>),
    Close,
}

struct SimState {
    scripts: Mutex<HashMap<String, Script>>,
    received: Mutex<Vec<DeviceCommand>>,
    current: Mutex<Option<mpsc::UnboundedSender<Outgoing>>>,
    connections: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    silent: AtomicBool,
    reply_delay: Mutex<Duration>,
}

pub struct DeviceSimulator {
    addr: SocketAddr,
    state: Arc<SimState>,
    task: JoinHandle<()>,
}

impl DeviceSimulator {
    /// Starts a powered-on, idle player speaking protocol 16.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(SimState {
            scripts: Mutex::new(default_scripts()),
            received: Mutex::new(Vec::new()),
            current: Mutex::new(None),
            connections: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            silent: AtomicBool::new(false),
            reply_delay: Mutex::new(Duration::ZERO),
        });
        let task = tokio::spawn(accept_loop(listener, Arc::clone(&state)));
        Self { addr, state, task }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Replaces the answer to `command`.
    pub fn script(&self, command: &str, script: Script) {
        self.state
            .scripts
            .lock()
            .unwrap()
            .insert(command.to_string(), script);
    }

    /// Delay before every reply.
    pub fn set_reply_delay(&self, delay: Duration) {
        *self.state.reply_delay.lock().unwrap() = delay;
    }

    /// While silent, commands are recorded but never answered.
    pub fn set_silent(&self, silent: bool) {
        self.state.silent.store(silent, Ordering::SeqCst);
    }

    /// Sends an unsolicited event on the live connection.
    pub fn push_event(&self, name: &str, fields: &[&str]) {
        let reply = DeviceReply::event(name, fields.iter().map(|f| f.to_string()).collect());
        self.push_raw(encode_reply(&reply));
    }

    /// Writes raw bytes on the live connection.
    pub fn push_raw(&self, bytes: Vec<u8>) {
        if let Some(tx) = self.state.current.lock().unwrap().as_ref() {
            let _ = tx.send(Outgoing::Line(bytes));
        }
    }

    /// Closes the live connection from the player side.
    pub fn drop_connection(&self) {
        if let Some(tx) = self.state.current.lock().unwrap().take() {
            let _ = tx.send(Outgoing::Close);
        }
    }

    /// Stops accepting; the live connection is closed too.
    pub fn shutdown(&self) {
        self.drop_connection();
        self.task.abort();
    }

    pub fn received(&self) -> Vec<DeviceCommand> {
        self.state.received.lock().unwrap().clone()
    }

    pub fn received_names(&self) -> Vec<String> {
        self.received().into_iter().map(|c| c.name).collect()
    }

    pub fn clear_received(&self) {
        self.state.received.lock().unwrap().clear();
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Polls until `name` has been received or `limit` elapses.
    pub async fn wait_for_command(&self, name: &str, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.received_names().iter().any(|n| n == name) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Polls until `count` connections have been accepted or `limit` elapses.
    pub async fn wait_for_connections(&self, count: usize, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        while tokio::time::Instant::now() < deadline {
            if self.connections() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

impl Drop for DeviceSimulator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn default_scripts() -> HashMap<String, Script> {
    let mut scripts = HashMap::new();
    scripts.insert(
        GET_SYSTEM_VERSION.to_string(),
        Script::reply(SYSTEM_VERSION, &["16", "10.4.2.19711"]),
    );
    scripts.insert(ENABLE_EVENTS.to_string(), Script::reply("", &[]));
    scripts.insert(
        GET_DEVICE_POWER_STATE.to_string(),
        Script::reply(DEVICE_POWER_STATE, &["1", "1"]),
    );
    scripts.insert(
        GET_PLAY_STATUS.to_string(),
        Script::reply(PLAY_STATUS, &["0", "0", "00", "00000", "00000", "000", "00000", "00000"]),
    );
    scripts.insert(GET_PLAYING_TITLE_NAME.to_string(), Script::reply(TITLE_NAME, &[""]));
    scripts.insert(
        GET_MOVIE_MEDIA_TYPE.to_string(),
        Script::reply(MOVIE_MEDIA_TYPE, &["00"]),
    );
    scripts.insert(
        GET_MOVIE_LOCATION.to_string(),
        Script::reply(MOVIE_LOCATION, &["00"]),
    );
    scripts.insert(
        GET_CONTENT_DETAILS.to_string(),
        Script::reply(CONTENT_DETAILS, &["0", "Content_handle", ""]),
    );
    scripts
}

async fn accept_loop(listener: TcpListener, state: Arc<SimState>) {
    loop {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        state.connections.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        // A new connection replaces the previous one.
        if let Some(old) = state.current.lock().unwrap().replace(tx.clone()) {
            let _ = old.send(Outgoing::Close);
        }
        tokio::spawn(serve(stream, Arc::clone(&state), tx, rx));
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<SimState>,
    tx: mpsc::UnboundedSender<Outgoing>,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
) {
    let (mut read_half, mut write_half) = stream.into_split();

    let mut writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outgoing::Line(bytes) => {
                    if write_half.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Outgoing::Close => break,
            }
        }
        let _ = write_half.shutdown().await;
    });

    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        tokio::select! {
            read = read_half.read(&mut tmp) => {
                let n = match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                buf.extend_from_slice(&tmp[..n]);
            }
            _ = &mut writer => break,
        }

        loop {
            match decode_command(&buf) {
                Ok((command, seq, consumed)) => {
                    buf.drain(..consumed);
                    answer(&state, &tx, command, seq);
                }
                Err(ProtocolError::InsufficientData { .. }) => break,
                Err(_) => {
                    let skip = buf.iter().position(|b| *b == b'\r').map_or(buf.len(), |p| p + 1);
                    buf.drain(..skip);
                }
            }
        }
    }
    writer.abort();
}

fn answer(state: &Arc<SimState>, tx: &mpsc::UnboundedSender<Outgoing>, command: DeviceCommand, seq: u8) {
    state.received.lock().unwrap().push(command.clone());
    if state.silent.load(Ordering::SeqCst) {
        return;
    }

    let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
    state.max_in_flight.fetch_max(now, Ordering::SeqCst);

    let script = state.scripts.lock().unwrap().get(&command.name).cloned();
    let reply = match script {
        Some(Script::Reply { name, fields }) => DeviceReply::ok(seq, name, fields),
        Some(Script::Error(status)) => DeviceReply {
            status,
            ..DeviceReply::ok(seq, "", vec![])
        },
        // Plain key presses are acknowledged with an empty body.
        None => DeviceReply::ok(seq, "", vec![]),
    };
    let delay = *state.reply_delay.lock().unwrap();
    let state = Arc::clone(state);
    let tx = tx.clone();
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        state.in_flight.fetch_sub(1, Ordering::SeqCst);
        let _ = tx.send(Outgoing::Line(encode_reply(&reply)));
    });
}
