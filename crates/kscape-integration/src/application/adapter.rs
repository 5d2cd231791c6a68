//! Entity adapter: the host-facing half of the integration.
//!
//! One [`EntityAdapter`] task owns everything the hosts can see: the
//! registered entities and their availability, the last snapshot of the
//! player, and which host connection is subscribed to which entity.  The
//! WebSocket layer feeds it [`AdapterRequest`]s; the supervisor feeds it
//! [`SupervisorEvent`]s.  Nothing else touches this state.
//!
//! # Availability
//!
//! | Situation                                | Entities become            |
//! |------------------------------------------|----------------------------|
//! | setup done, never connected              | Unconfigured               |
//! | first connect + snapshot                 | Available                  |
//! | connection lost                          | Available for `grace_period`, then Unavailable |
//! | reconnect + fresh snapshot               | Available                  |
//! | protocol mismatch, host stopped session  | Unavailable immediately    |
//!
//! # Publishing
//!
//! After every change the adapter recomputes each entity's attributes from
//! the snapshot and sends subscribers only the attributes that differ from
//! what was last published.  A host whose outbound queue is full is dropped.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use kscape_core::{
    CommandError, CommandTranslator, ConnectionState, DeviceCommand, DeviceState, Resolution,
};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::dispatcher::{BatchResult, CommandEnvelope};
use crate::application::supervisor::{SupervisorControl, SupervisorEvent, UnavailableReason};
use crate::domain::config::{ConfigurationError, DeviceEndpoint};
use crate::domain::entity::{entities_for, Availability, EntityDef};
use crate::domain::messages::{
    status, CommandRequest, HostDeviceState, HostEvent, HostRequest, OutboundMsg, SetupRequest,
    DRIVER_ID, DRIVER_VERSION,
};

/// Identifies one host WebSocket connection.
pub type ConnectionId = Uuid;

/// Failures reported back to the requesting host.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid setup: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("failed to save configuration: {0}")]
    Persist(String),

    #[error("unknown entity {0}")]
    UnknownEntity(String),

    #[error("{0} is unavailable")]
    Unavailable(String),

    #[error("command queue is full")]
    Busy,

    #[error(transparent)]
    Command(#[from] CommandError),
}

impl AdapterError {
    pub fn status_code(&self) -> u16 {
        match self {
            AdapterError::Configuration(_) => status::BAD_REQUEST,
            AdapterError::Persist(_) => status::SERVER_ERROR,
            AdapterError::UnknownEntity(_) => status::NOT_FOUND,
            AdapterError::Unavailable(_) | AdapterError::Busy => status::SERVICE_UNAVAILABLE,
            AdapterError::Command(e) => command_status(e),
        }
    }
}

/// Host status code for a failed command.
pub fn command_status(error: &CommandError) -> u16 {
    match error {
        CommandError::NotConnected => status::SERVICE_UNAVAILABLE,
        CommandError::Rejected { .. } => status::SERVER_ERROR,
        CommandError::Timeout => status::TIMEOUT,
        CommandError::Unsupported(_) => status::NOT_IMPLEMENTED,
        CommandError::InvalidParameter(_) => status::BAD_REQUEST,
    }
}

/// Where a confirmed setup is stored.
#[cfg_attr(test, mockall::automock)]
pub trait ConfigSink: Send {
    /// Replaces the stored player.
    ///
    /// # Errors
    ///
    /// [`AdapterError::Persist`] when the configuration cannot be written.
    fn persist_device(&self, device: &DeviceEndpoint) -> Result<(), AdapterError>;
}

/// Input from the WebSocket layer.
#[derive(Debug)]
pub enum AdapterRequest {
    Attach {
        conn: ConnectionId,
        outbound: mpsc::Sender<OutboundMsg>,
    },
    Detach {
        conn: ConnectionId,
    },
    Request {
        conn: ConnectionId,
        id: u64,
        request: HostRequest,
    },
    Event {
        conn: ConnectionId,
        event: HostEvent,
    },
}

struct EntityRecord {
    def: EntityDef,
    availability: Availability,
    published: Map<String, Value>,
}

impl EntityRecord {
    fn new(def: EntityDef) -> Self {
        Self {
            def,
            availability: Availability::Unconfigured,
            published: Map::new(),
        }
    }
}

pub struct EntityAdapter {
    device: Option<DeviceEndpoint>,
    entities: Vec<EntityRecord>,
    snapshot: DeviceState,
    connection: ConnectionState,
    hosts: HashMap<ConnectionId, mpsc::Sender<OutboundMsg>>,
    subscriptions: HashMap<String, HashSet<ConnectionId>>,
    grace_period: Duration,
    grace_deadline: Option<Instant>,
    translator: CommandTranslator,
    commands: mpsc::Sender<CommandEnvelope>,
    control: mpsc::Sender<SupervisorControl>,
    config: Box<dyn ConfigSink>,
    session_wanted: bool,
}

impl EntityAdapter {
    pub fn new(
        device: Option<DeviceEndpoint>,
        grace_period: Duration,
        commands: mpsc::Sender<CommandEnvelope>,
        control: mpsc::Sender<SupervisorControl>,
        config: Box<dyn ConfigSink>,
    ) -> Self {
        let entities = device
            .as_ref()
            .map(|d| entities_for(d).into_iter().map(EntityRecord::new).collect())
            .unwrap_or_default();
        Self {
            device,
            entities,
            snapshot: DeviceState::default(),
            connection: ConnectionState::Disconnected,
            hosts: HashMap::new(),
            subscriptions: HashMap::new(),
            grace_period,
            grace_deadline: None,
            translator: CommandTranslator::new(),
            commands,
            control,
            config,
            session_wanted: false,
        }
    }

    /// Runs until either input channel closes.
    pub async fn run(
        mut self,
        mut requests: mpsc::Receiver<AdapterRequest>,
        mut events: mpsc::Receiver<SupervisorEvent>,
    ) {
        info!(
            "entity adapter started with {} entities",
            self.entities.len()
        );
        loop {
            let grace = self.grace_deadline;
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request),
                    None => break,
                },
                event = events.recv() => match event {
                    Some(event) => self.handle_supervisor_event(event),
                    None => break,
                },
                _ = grace_timer(grace) => self.grace_expired(),
            }
        }
        info!("entity adapter stopped");
    }

    // ── Host side ─────────────────────────────────────────────────────────────

    fn handle_request(&mut self, request: AdapterRequest) {
        match request {
            AdapterRequest::Attach { conn, outbound } => {
                debug!("host {conn} attached");
                self.hosts.insert(conn, outbound);
            }
            AdapterRequest::Detach { conn } => {
                debug!("host {conn} detached");
                self.drop_host(conn);
            }
            AdapterRequest::Event { conn, event } => self.handle_host_event(conn, event),
            AdapterRequest::Request { conn, id, request } => {
                self.handle_host_request(conn, id, request);
            }
        }
    }

    fn handle_host_event(&mut self, conn: ConnectionId, event: HostEvent) {
        debug!("host {conn} event {event:?}");
        match event {
            HostEvent::Connect | HostEvent::ExitStandby => self.start_session(),
            HostEvent::Disconnect | HostEvent::EnterStandby => self.stop_session(),
            HostEvent::AbortDriverSetup => info!("host {conn} aborted driver setup"),
        }
    }

    fn handle_host_request(&mut self, conn: ConnectionId, id: u64, request: HostRequest) {
        let msg = request.response_msg();
        match request {
            HostRequest::GetDriverVersion => {
                let data = json!({
                    "name": "Kaleidescape",
                    "driver_id": DRIVER_ID,
                    "version": { "driver": DRIVER_VERSION },
                });
                self.send_to(conn, OutboundMsg::response(id, status::OK, msg, data));
            }
            HostRequest::GetDeviceState => {
                let data = json!({ "state": host_device_state(self.connection) });
                self.send_to(conn, OutboundMsg::response(id, status::OK, msg, data));
            }
            HostRequest::GetAvailableEntities => {
                let defs: Vec<Value> = self.entities.iter().map(|e| e.def.definition()).collect();
                let data = json!({ "available_entities": defs });
                self.send_to(conn, OutboundMsg::response(id, status::OK, msg, data));
            }
            HostRequest::GetEntityStates => {
                let states: Vec<Value> = self
                    .entities
                    .iter()
                    .map(|e| {
                        json!({
                            "entity_id": e.def.entity_id,
                            "entity_type": e.def.entity_type(),
                            "attributes": e.def.attributes(&self.snapshot, e.availability),
                        })
                    })
                    .collect();
                self.send_to(conn, OutboundMsg::response(id, status::OK, msg, json!(states)));
            }
            HostRequest::SubscribeEvents { entity_ids } => {
                self.send_to(conn, OutboundMsg::ok(id));
                self.subscribe(conn, &entity_ids);
            }
            HostRequest::UnsubscribeEvents { entity_ids } => {
                self.unsubscribe(conn, &entity_ids);
                self.send_to(conn, OutboundMsg::ok(id));
            }
            HostRequest::EntityCommand(command) => self.handle_command(conn, id, command),
            HostRequest::SetupDriver(setup) => self.setup_driver(conn, id, setup),
        }
    }

    /// Subscribes `conn` to `entity_ids` (all entities when empty) and pushes
    /// their full current attributes.
    pub fn subscribe(&mut self, conn: ConnectionId, entity_ids: &[String]) {
        let targets: Vec<usize> = self
            .entities
            .iter()
            .enumerate()
            .filter(|(_, e)| entity_ids.is_empty() || entity_ids.contains(&e.def.entity_id))
            .map(|(i, _)| i)
            .collect();
        for id in entity_ids {
            if !self.entities.iter().any(|e| &e.def.entity_id == id) {
                debug!("host {conn} subscribed to unknown entity {id}");
            }
        }

        for index in targets {
            // Dropped mid-way for being too slow.
            if !self.hosts.contains_key(&conn) {
                return;
            }
            let record = &self.entities[index];
            self.subscriptions
                .entry(record.def.entity_id.clone())
                .or_default()
                .insert(conn);
            let attrs = record.def.attributes(&self.snapshot, record.availability);
            let msg = OutboundMsg::entity_change(record.def.entity_type(), &record.def.entity_id, attrs);
            self.send_to(conn, msg);
        }

        if self.has_subscribers() {
            self.start_session();
        }
    }

    /// Removes `conn` from `entity_ids` (all entities when empty).
    pub fn unsubscribe(&mut self, conn: ConnectionId, entity_ids: &[String]) {
        for (entity_id, subscribers) in self.subscriptions.iter_mut() {
            if entity_ids.is_empty() || entity_ids.contains(entity_id) {
                subscribers.remove(&conn);
            }
        }
        self.subscriptions.retain(|_, subscribers| !subscribers.is_empty());
        if !self.has_subscribers() {
            self.stop_session();
        }
    }

    fn has_subscribers(&self) -> bool {
        !self.subscriptions.is_empty()
    }

    fn drop_host(&mut self, conn: ConnectionId) {
        if self.hosts.remove(&conn).is_some() {
            self.unsubscribe(conn, &[]);
        }
    }

    /// Validates, translates and queues one host command.  The response is
    /// sent once the dispatcher reports the outcome.
    pub fn handle_command(&mut self, conn: ConnectionId, id: u64, request: CommandRequest) {
        let commands = match self.prepare_command(&request) {
            Ok(commands) => commands,
            Err(e) => {
                info!(
                    "command {} for {} refused: {e}",
                    request.cmd_id, request.entity_id
                );
                self.send_to(conn, OutboundMsg::error(id, e.status_code(), &e.to_string()));
                return;
            }
        };

        if commands.is_empty() {
            info!(
                "command {} for {} skipped: already satisfied",
                request.cmd_id, request.entity_id
            );
            self.send_to(conn, OutboundMsg::ok(id));
            return;
        }

        let (envelope, result) = CommandEnvelope::new(commands);
        if let Err(e) = self.commands.try_send(envelope) {
            warn!("command queue rejected {}: {e}", request.cmd_id);
            let e = AdapterError::Busy;
            self.send_to(conn, OutboundMsg::error(id, e.status_code(), &e.to_string()));
            return;
        }

        let Some(outbound) = self.hosts.get(&conn).cloned() else {
            return;
        };
        tokio::spawn(respond_when_done(id, request.cmd_id, result, outbound));
    }

    /// Everything up to the point of transmission; nothing is queued on error.
    fn prepare_command(&self, request: &CommandRequest) -> Result<Vec<DeviceCommand>, AdapterError> {
        let record = self
            .entities
            .iter()
            .find(|e| e.def.entity_id == request.entity_id)
            .filter(|e| {
                request
                    .entity_type
                    .as_deref()
                    .map_or(true, |t| t == e.def.entity_type())
            })
            .ok_or_else(|| AdapterError::UnknownEntity(request.entity_id.clone()))?;
        if record.availability != Availability::Available {
            return Err(AdapterError::Unavailable(request.entity_id.clone()));
        }

        let steps = record
            .def
            .parse_command(&request.cmd_id, request.params.as_ref())?;
        let mut commands = Vec::with_capacity(steps.len());
        for step in steps {
            match step.command.resolve(&self.snapshot) {
                Resolution::AlreadySatisfied => {
                    debug!("{:?} already satisfied", step.command);
                }
                Resolution::Send(command) => {
                    commands.push(self.translator.translate(record.def.kind, command, step.param)?);
                }
            }
        }
        Ok(commands)
    }

    fn setup_driver(&mut self, conn: ConnectionId, id: u64, setup: SetupRequest) {
        let result = DeviceEndpoint::from_address(
            &setup.setup_data.address,
            setup.setup_data.name.as_deref(),
        )
        .map_err(AdapterError::from)
        .and_then(|endpoint| {
            self.config.persist_device(&endpoint)?;
            Ok(endpoint)
        });

        match result {
            Ok(endpoint) => {
                info!("setup confirmed for {}", endpoint.address());
                self.send_to(conn, OutboundMsg::ok(id));
                let address = endpoint.address();
                self.configure(endpoint);
                self.session_wanted = true;
                self.control_supervisor(SupervisorControl::Reconfigure(address));
                self.send_to(conn, OutboundMsg::driver_setup_change(None));
            }
            Err(e) => {
                warn!("setup failed: {e}");
                self.send_to(conn, OutboundMsg::error(id, e.status_code(), &e.to_string()));
                self.send_to(conn, OutboundMsg::driver_setup_change(Some(&e.to_string())));
            }
        }
    }

    /// Replaces the entity set.  Subscriptions to entity ids that survive are
    /// kept.
    fn configure(&mut self, device: DeviceEndpoint) {
        self.entities = entities_for(&device)
            .into_iter()
            .map(EntityRecord::new)
            .collect();
        let ids: HashSet<&str> = self.entities.iter().map(|e| e.def.entity_id.as_str()).collect();
        self.subscriptions.retain(|id, _| ids.contains(id.as_str()));
        self.snapshot = DeviceState::default();
        self.grace_deadline = None;
        self.device = Some(device);
        self.publish();
    }

    fn start_session(&mut self) {
        if self.session_wanted {
            return;
        }
        if self.device.is_none() {
            debug!("no player configured; not starting a session");
            return;
        }
        self.session_wanted = true;
        self.control_supervisor(SupervisorControl::Start);
    }

    fn stop_session(&mut self) {
        if !self.session_wanted {
            return;
        }
        self.session_wanted = false;
        self.control_supervisor(SupervisorControl::Stop);
    }

    fn control_supervisor(&self, control: SupervisorControl) {
        if let Err(e) = self.control.try_send(control) {
            warn!("supervisor did not take control message: {e}");
        }
    }

    // ── Device side ───────────────────────────────────────────────────────────

    fn handle_supervisor_event(&mut self, event: SupervisorEvent) {
        match event {
            SupervisorEvent::Connection(state) => {
                let before = host_device_state(self.connection);
                self.connection = state;
                let after = host_device_state(state);
                if before != after {
                    self.broadcast(OutboundMsg::device_state(after));
                }
            }
            SupervisorEvent::Connected { snapshot } => {
                self.snapshot = snapshot;
                self.grace_deadline = None;
                self.set_availability(Availability::Available);
                self.publish();
            }
            SupervisorEvent::Delta(delta) => {
                delta.apply_to(&mut self.snapshot);
                self.publish();
            }
            SupervisorEvent::Lost => {
                let any_available = self
                    .entities
                    .iter()
                    .any(|e| e.availability == Availability::Available);
                if any_available && self.grace_deadline.is_none() {
                    debug!("connection lost; entities stay available for {:?}", self.grace_period);
                    self.grace_deadline = Some(Instant::now() + self.grace_period);
                }
            }
            SupervisorEvent::Unavailable(reason) => {
                warn!("entities unavailable: {reason:?}");
                self.make_unavailable();
            }
        }
    }

    fn grace_expired(&mut self) {
        warn!(
            "entities unavailable: {:?}",
            UnavailableReason::ConnectionLost
        );
        self.make_unavailable();
    }

    fn make_unavailable(&mut self) {
        self.grace_deadline = None;
        if self.entities.is_empty() {
            return;
        }
        self.set_availability(Availability::Unavailable);
        self.publish();
    }

    fn set_availability(&mut self, availability: Availability) {
        for record in &mut self.entities {
            record.availability = availability;
        }
    }

    /// Sends every subscriber the attributes that changed since the last
    /// publish.
    fn publish(&mut self) {
        let mut pending = Vec::new();
        for record in &mut self.entities {
            let attrs = record.def.attributes(&self.snapshot, record.availability);
            let changed: Map<String, Value> = attrs
                .iter()
                .filter(|(key, value)| record.published.get(*key) != Some(*value))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            if changed.is_empty() {
                continue;
            }
            record.published = attrs;
            pending.push((
                record.def.entity_id.clone(),
                OutboundMsg::entity_change(record.def.entity_type(), &record.def.entity_id, changed),
            ));
        }

        for (entity_id, msg) in pending {
            let subscribers: Vec<ConnectionId> = self
                .subscriptions
                .get(&entity_id)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default();
            for conn in subscribers {
                self.send_to(conn, msg.clone());
            }
        }
    }

    fn broadcast(&mut self, msg: OutboundMsg) {
        let conns: Vec<ConnectionId> = self.hosts.keys().copied().collect();
        for conn in conns {
            self.send_to(conn, msg.clone());
        }
    }

    /// Queues `msg` for one host.  A host that cannot keep up is dropped.
    fn send_to(&mut self, conn: ConnectionId, msg: OutboundMsg) {
        let Some(outbound) = self.hosts.get(&conn) else {
            return;
        };
        if let Err(e) = outbound.try_send(msg) {
            warn!("dropping host {conn}: {e}");
            self.drop_host(conn);
        }
    }
}

async fn grace_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn respond_when_done(
    id: u64,
    cmd_id: String,
    result: oneshot::Receiver<BatchResult>,
    outbound: mpsc::Sender<OutboundMsg>,
) {
    let outcome = result.await.unwrap_or(Err(CommandError::NotConnected));
    let msg = match outcome {
        Ok(acks) => {
            debug!("{cmd_id}: {} device command(s) acknowledged", acks.len());
            OutboundMsg::ok(id)
        }
        Err(e) => {
            info!("{cmd_id} failed: {e}");
            OutboundMsg::error(id, command_status(&e), &e.to_string())
        }
    };
    if outbound.send(msg).await.is_err() {
        debug!("host went away before {cmd_id} completed");
    }
}

fn host_device_state(state: ConnectionState) -> HostDeviceState {
    match state {
        ConnectionState::Connected => HostDeviceState::Connected,
        ConnectionState::Connecting | ConnectionState::Reauthenticating => {
            HostDeviceState::Connecting
        }
        ConnectionState::Disconnected => HostDeviceState::Disconnected,
        ConnectionState::Failed => HostDeviceState::Error,
    }
}
