//! Reconnection and health supervisor.
//!
//! The supervisor owns the one device session.  It connects when asked to,
//! takes the initial snapshot, feeds every device event through the
//! [`StateNormalizer`] and forwards the resulting deltas to the entity adapter.
//! When the connection is lost it reconnects with exponential backoff.
//!
//! # Lifecycle
//!
//! ```text
//!            Start                 handshake ok + snapshot
//!  Disconnected ──► Connecting ───────────────────────────► Connected
//!       ▲               │ refused / timeout                    │
//!       │               ▼                                      │ events end,
//!       │          backoff sleep ◄──── Reauthenticating ◄──────┘ probes fail
//!       │               │ protocol mismatch
//!       │               ▼
//!       └─────────── Failed   (only Reconfigure leaves this state)
//! ```
//!
//! # Health probes
//!
//! While connected, a `GET_DEVICE_POWER_STATE` probe is sent whenever the
//! link has been silent for `probe_interval`.  After `probe_failure_limit`
//! consecutive failures the session is dropped and a reconnect cycle starts,
//! even if the socket itself never reported an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use kscape_core::protocol::messages::{GET_DEVICE_POWER_STATE, SNAPSHOT_QUERIES};
use kscape_core::{
    Backoff, CommandError, ConnectionState, DeviceCommand, DeviceState, RawEvent, StateDelta,
    StateNormalizer,
};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::application::device_link::{DeviceConnector, DeviceLink, EventStream, Session};
use crate::application::dispatcher::LinkSlot;
use crate::domain::config::BridgeConfig;

/// Requests from the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorControl {
    /// Connect (and keep reconnecting) to the configured address.
    Start,
    /// Disconnect and stay idle until the next `Start`.
    Stop,
    /// Use a new address; reconnects immediately.
    Reconfigure(String),
    /// Disconnect and exit the task.
    Shutdown,
}

/// Why the entities cannot currently be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnavailableReason {
    ConnectionLost,
    ProtocolMismatch(String),
    Stopped,
}

/// Notifications to the adapter, in the order they happened.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    /// The connection state changed.
    Connection(ConnectionState),
    /// A session is up and this is its fresh snapshot.
    Connected { snapshot: DeviceState },
    Delta(StateDelta),
    /// The session is gone; a reconnect is underway.
    Lost,
    /// The session is gone and will not come back on its own.
    Unavailable(UnavailableReason),
}

/// Timing knobs, taken from [`BridgeConfig`].
#[derive(Debug, Clone, Copy)]
pub struct SupervisorSettings {
    pub probe_interval: Duration,
    pub probe_failure_limit: u32,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
}

impl From<&BridgeConfig> for SupervisorSettings {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            probe_interval: config.probe_interval,
            probe_failure_limit: config.probe_failure_limit.max(1),
            backoff_initial: config.backoff_initial,
            backoff_max: config.backoff_max,
        }
    }
}

/// The adapter's ends of the supervisor's channels.
pub struct SupervisorChannels {
    pub control: mpsc::Sender<SupervisorControl>,
    pub events: mpsc::Receiver<SupervisorEvent>,
    pub link: LinkSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// How a connected session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Stopped,
    Reconfigured(String),
    Shutdown,
}

pub struct Supervisor {
    connector: Arc<dyn DeviceConnector>,
    address: Option<String>,
    settings: SupervisorSettings,
    backoff: Backoff,
    normalizer: StateNormalizer,
    state: ConnectionState,
    wanted: bool,
    lost_before: bool,
    link_slot: watch::Sender<Option<Arc<dyn DeviceLink>>>,
    events: mpsc::Sender<SupervisorEvent>,
    control: mpsc::Receiver<SupervisorControl>,
}

impl Supervisor {
    /// Builds an idle supervisor.  Nothing connects until `Start` arrives.
    pub fn new(
        connector: Arc<dyn DeviceConnector>,
        address: Option<String>,
        settings: SupervisorSettings,
    ) -> (Self, SupervisorChannels) {
        let (control_tx, control_rx) = mpsc::channel(16);
        let (events_tx, events_rx) = mpsc::channel(256);
        let (link_tx, link_rx) = watch::channel(None);

        let supervisor = Self {
            connector,
            address,
            settings,
            backoff: Backoff::new(settings.backoff_initial, settings.backoff_max),
            normalizer: StateNormalizer::new(),
            state: ConnectionState::Disconnected,
            wanted: false,
            lost_before: false,
            link_slot: link_tx,
            events: events_tx,
            control: control_rx,
        };
        let channels = SupervisorChannels {
            control: control_tx,
            events: events_rx,
            link: link_rx,
        };
        (supervisor, channels)
    }

    /// Runs until `Shutdown` or until every control sender is dropped.
    pub async fn run(mut self) {
        info!("supervisor started");
        loop {
            if !self.should_connect() {
                let flow = match self.control.recv().await {
                    Some(control) => self.apply_control(control).await,
                    None => Flow::Exit,
                };
                if flow == Flow::Exit {
                    break;
                }
                continue;
            }

            let Some(address) = self.address.clone() else {
                continue;
            };
            let next = if self.lost_before {
                ConnectionState::Reauthenticating
            } else {
                ConnectionState::Connecting
            };
            self.set_state(next).await;
            info!("connecting to player at {address}");

            let attempt = tokio::select! {
                result = self.connector.connect(&address) => Ok(result),
                control = self.control.recv() => Err(control),
            };

            let flow = match attempt {
                Err(None) => Flow::Exit,
                Err(Some(control)) => {
                    debug!("connect attempt to {address} interrupted by {control:?}");
                    self.apply_control(control).await
                }
                Ok(Ok(session)) => {
                    info!("connected to player at {address}");
                    self.backoff.reset();
                    match self.drive(session).await {
                        SessionEnd::Lost => self.pause().await,
                        SessionEnd::Shutdown => Flow::Exit,
                        SessionEnd::Stopped | SessionEnd::Reconfigured(_) => Flow::Continue,
                    }
                }
                Ok(Err(e)) if e.is_fatal() => {
                    error!("giving up on {address}: {e}");
                    self.set_state(ConnectionState::Failed).await;
                    self.emit(SupervisorEvent::Unavailable(
                        UnavailableReason::ProtocolMismatch(e.to_string()),
                    ))
                    .await;
                    Flow::Continue
                }
                Ok(Err(e)) => {
                    warn!("connect to {address} failed: {e}");
                    self.set_state(ConnectionState::Disconnected).await;
                    self.pause().await
                }
            };
            if flow == Flow::Exit {
                break;
            }
        }

        self.link_slot.send_replace(None);
        self.set_state(ConnectionState::Disconnected).await;
        info!("supervisor stopped");
    }

    fn should_connect(&self) -> bool {
        self.wanted && self.address.is_some() && self.state != ConnectionState::Failed
    }

    /// Applies a control message received outside a live session.
    async fn apply_control(&mut self, control: SupervisorControl) -> Flow {
        match control {
            SupervisorControl::Start => {
                if self.state == ConnectionState::Failed {
                    warn!("start ignored: the player needs to be reconfigured");
                }
                if self.address.is_none() {
                    debug!("start ignored: no player configured");
                }
                self.wanted = true;
                Flow::Continue
            }
            SupervisorControl::Stop => {
                self.stop().await;
                Flow::Continue
            }
            SupervisorControl::Reconfigure(address) => {
                self.reconfigure(address).await;
                Flow::Continue
            }
            SupervisorControl::Shutdown => Flow::Exit,
        }
    }

    async fn stop(&mut self) {
        info!("device session stopped on request");
        self.wanted = false;
        self.lost_before = false;
        self.backoff.reset();
        // A failed player stays failed until reconfigured.
        if self.state != ConnectionState::Failed {
            self.set_state(ConnectionState::Disconnected).await;
        }
        self.emit(SupervisorEvent::Unavailable(UnavailableReason::Stopped))
            .await;
    }

    async fn reconfigure(&mut self, address: String) {
        info!("player address set to {address}");
        self.address = Some(address);
        self.wanted = true;
        self.lost_before = false;
        self.backoff.reset();
        self.normalizer.reset();
        // Leaves Failed.
        self.set_state(ConnectionState::Disconnected).await;
    }

    /// Backoff sleep between attempts; any control message cuts it short.
    async fn pause(&mut self) -> Flow {
        let delay = self.backoff.next_delay();
        debug!("next connect attempt in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => Flow::Continue,
            control = self.control.recv() => match control {
                Some(control) => self.apply_control(control).await,
                None => Flow::Exit,
            },
        }
    }

    /// Owns one connected session until it ends.  The link slot is cleared
    /// and the link disconnected on every exit path.
    async fn drive(&mut self, session: Session) -> SessionEnd {
        let Session { link, mut events } = session;
        self.normalizer.reset();

        let end = self.run_session(&link, &mut events).await;

        self.link_slot.send_replace(None);
        link.disconnect().await;
        match &end {
            SessionEnd::Lost => {
                self.lost_before = true;
                self.set_state(ConnectionState::Disconnected).await;
                self.emit(SupervisorEvent::Lost).await;
            }
            SessionEnd::Stopped => self.stop().await,
            SessionEnd::Reconfigured(address) => self.reconfigure(address.clone()).await,
            SessionEnd::Shutdown => {}
        }
        end
    }

    async fn run_session(
        &mut self,
        link: &Arc<dyn DeviceLink>,
        events: &mut EventStream,
    ) -> SessionEnd {
        for query in SNAPSHOT_QUERIES {
            match link.send(&DeviceCommand::new(query)).await {
                Ok(ack) => self.absorb_reply(&ack.reply).await,
                Err(CommandError::Rejected { code }) => {
                    debug!("snapshot query {query} rejected with {code:03}");
                }
                Err(e) => {
                    warn!("snapshot query {query} failed: {e}");
                    return SessionEnd::Lost;
                }
            }
        }

        self.link_slot.send_replace(Some(Arc::clone(link)));
        self.set_state(ConnectionState::Connected).await;
        self.emit(SupervisorEvent::Connected {
            snapshot: self.normalizer.state().clone(),
        })
        .await;

        let mut probe = interval(self.settings.probe_interval);
        probe.set_missed_tick_behavior(MissedTickBehavior::Delay);
        probe.tick().await;
        let mut failures = 0u32;

        loop {
            tokio::select! {
                event = events.next() => match event {
                    Some(event) => {
                        if let Some(delta) = self.normalizer.apply(&event) {
                            self.emit(SupervisorEvent::Delta(delta)).await;
                        }
                    }
                    None => {
                        warn!("player connection lost");
                        return SessionEnd::Lost;
                    }
                },
                _ = probe.tick() => {
                    if link.idle_for() < self.settings.probe_interval {
                        failures = 0;
                        continue;
                    }
                    match link.send(&DeviceCommand::new(GET_DEVICE_POWER_STATE)).await {
                        Ok(ack) => {
                            failures = 0;
                            self.absorb_reply(&ack.reply).await;
                        }
                        Err(CommandError::Rejected { .. }) => failures = 0,
                        Err(e) => {
                            failures += 1;
                            warn!(
                                "health probe failed ({failures}/{}): {e}",
                                self.settings.probe_failure_limit
                            );
                            if failures >= self.settings.probe_failure_limit {
                                return SessionEnd::Lost;
                            }
                        }
                    }
                },
                control = self.control.recv() => match control {
                    None | Some(SupervisorControl::Shutdown) => return SessionEnd::Shutdown,
                    Some(SupervisorControl::Start) => {}
                    Some(SupervisorControl::Stop) => return SessionEnd::Stopped,
                    Some(SupervisorControl::Reconfigure(address)) => {
                        return SessionEnd::Reconfigured(address);
                    }
                },
            }
        }
    }

    /// Folds a query reply into the state the same way an event would be.
    async fn absorb_reply(&mut self, reply: &kscape_core::DeviceReply) {
        if let Some(event) = RawEvent::from_reply(reply, Utc::now()) {
            if let Some(delta) = self.normalizer.apply(&event) {
                // Probe replies can carry news, e.g. the player went to standby.
                if self.state == ConnectionState::Connected {
                    self.emit(SupervisorEvent::Delta(delta)).await;
                }
            }
        }
    }

    async fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("connection state {:?} -> {state:?}", self.state);
            self.state = state;
            self.emit(SupervisorEvent::Connection(state)).await;
        }
    }

    async fn emit(&self, event: SupervisorEvent) {
        if self.events.send(event).await.is_err() {
            debug!("adapter gone; dropping supervisor event");
        }
    }
}
