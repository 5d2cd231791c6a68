//! JSON message types for the host-facing integration protocol.
//!
//! Every WebSocket text frame is one JSON object with a `kind` field:
//!
//! ```json
//! {"kind":"req","id":7,"msg":"subscribe_events","msg_data":{"entity_ids":[]}}
//! {"kind":"resp","req_id":7,"code":200,"msg":"result","msg_data":{}}
//! {"kind":"event","msg":"entity_change","cat":"ENTITY","msg_data":{...}}
//! ```
//!
//! Inbound frames are parsed in two steps: the envelope first, then
//! `msg_data` according to `msg`.  That way an unknown `msg` can still be
//! answered with the request id it came with.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Version reported by `get_driver_version`.
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Integration identifier reported by `get_driver_version`.
pub const DRIVER_ID: &str = "kaleidescape";

/// Response status codes.
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const NOT_FOUND: u16 = 404;
    pub const SERVER_ERROR: u16 = 500;
    pub const NOT_IMPLEMENTED: u16 = 501;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
    pub const TIMEOUT: u16 = 504;
}

// ── Inbound ───────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct InboundFrame {
    kind: String,
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    msg_data: Value,
}

/// A parsed inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Request { id: u64, request: HostRequest },
    Event(HostEvent),
    /// Valid frame the integration has no use for (responses, unknown events).
    Ignored(String),
}

/// Requests the host can make.
#[derive(Debug, Clone, PartialEq)]
pub enum HostRequest {
    GetDriverVersion,
    GetDeviceState,
    GetAvailableEntities,
    GetEntityStates,
    SubscribeEvents { entity_ids: Vec<String> },
    UnsubscribeEvents { entity_ids: Vec<String> },
    EntityCommand(CommandRequest),
    SetupDriver(SetupRequest),
}

impl HostRequest {
    /// Name used in the `msg` field of the response.
    pub fn response_msg(&self) -> &'static str {
        match self {
            HostRequest::GetDriverVersion => "driver_version",
            HostRequest::GetDeviceState => "device_state",
            HostRequest::GetAvailableEntities => "available_entities",
            HostRequest::GetEntityStates => "entity_states",
            _ => "result",
        }
    }
}

/// Lifecycle notifications from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    Connect,
    Disconnect,
    EnterStandby,
    ExitStandby,
    AbortDriverSetup,
}

/// A command addressed to one entity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CommandRequest {
    #[serde(default)]
    pub entity_type: Option<String>,
    pub entity_id: String,
    pub cmd_id: String,
    #[serde(default)]
    pub params: Option<Map<String, Value>>,
}

/// Setup confirmation carrying the player address.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetupRequest {
    pub setup_data: SetupData,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SetupData {
    pub address: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct EntityIds {
    #[serde(default)]
    entity_ids: Vec<String>,
}

/// Why an inbound frame could not be turned into a request.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("unknown request {msg:?}")]
    UnknownRequest { id: u64, msg: String },

    #[error("invalid msg_data for {msg}: {detail}")]
    InvalidData { id: u64, msg: String, detail: String },
}

impl FrameError {
    /// The request id to answer, when the envelope carried one.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            FrameError::Malformed(_) => None,
            FrameError::UnknownRequest { id, .. } | FrameError::InvalidData { id, .. } => Some(*id),
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            FrameError::UnknownRequest { .. } => status::NOT_FOUND,
            FrameError::Malformed(_) | FrameError::InvalidData { .. } => status::BAD_REQUEST,
        }
    }
}

/// Parses one inbound text frame.
///
/// # Errors
///
/// Returns [`FrameError`] for invalid JSON, unknown requests and request
/// payloads that do not match the request.
pub fn parse_inbound(text: &str) -> Result<Inbound, FrameError> {
    let frame: InboundFrame =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;

    match frame.kind.as_str() {
        "req" => {
            let id = frame
                .id
                .ok_or_else(|| FrameError::Malformed("request without id".to_string()))?;
            let request = parse_request(id, &frame.msg, frame.msg_data)?;
            Ok(Inbound::Request { id, request })
        }
        "event" => Ok(match frame.msg.as_str() {
            "connect" => Inbound::Event(HostEvent::Connect),
            "disconnect" => Inbound::Event(HostEvent::Disconnect),
            "enter_standby" => Inbound::Event(HostEvent::EnterStandby),
            "exit_standby" => Inbound::Event(HostEvent::ExitStandby),
            "abort_driver_setup" => Inbound::Event(HostEvent::AbortDriverSetup),
            other => Inbound::Ignored(format!("event {other}")),
        }),
        other => Ok(Inbound::Ignored(format!("kind {other}"))),
    }
}

fn parse_request(id: u64, msg: &str, data: Value) -> Result<HostRequest, FrameError> {
    let invalid = |e: serde_json::Error| FrameError::InvalidData {
        id,
        msg: msg.to_string(),
        detail: e.to_string(),
    };
    // Hosts send `null`, `{}` or nothing for requests without payload.
    let data = if data.is_null() { json!({}) } else { data };

    Ok(match msg {
        "get_driver_version" => HostRequest::GetDriverVersion,
        "get_device_state" => HostRequest::GetDeviceState,
        "get_available_entities" => HostRequest::GetAvailableEntities,
        "get_entity_states" => HostRequest::GetEntityStates,
        "subscribe_events" => HostRequest::SubscribeEvents {
            entity_ids: serde_json::from_value::<EntityIds>(data)
                .map_err(invalid)?
                .entity_ids,
        },
        "unsubscribe_events" => HostRequest::UnsubscribeEvents {
            entity_ids: serde_json::from_value::<EntityIds>(data)
                .map_err(invalid)?
                .entity_ids,
        },
        "entity_command" => {
            HostRequest::EntityCommand(serde_json::from_value(data).map_err(invalid)?)
        }
        "setup_driver" => HostRequest::SetupDriver(serde_json::from_value(data).map_err(invalid)?),
        other => {
            return Err(FrameError::UnknownRequest {
                id,
                msg: other.to_string(),
            })
        }
    })
}

// ── Outbound ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventCategory {
    Entity,
    Device,
}

/// Connection state as the host understands it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HostDeviceState {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

/// A frame sent to the host.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum OutboundMsg {
    Resp {
        req_id: u64,
        code: u16,
        msg: String,
        msg_data: Value,
    },
    Event {
        msg: String,
        cat: EventCategory,
        msg_data: Value,
    },
}

impl OutboundMsg {
    pub fn response(req_id: u64, code: u16, msg: &str, msg_data: Value) -> Self {
        OutboundMsg::Resp {
            req_id,
            code,
            msg: msg.to_string(),
            msg_data,
        }
    }

    /// A 200 response with an empty payload.
    pub fn ok(req_id: u64) -> Self {
        Self::response(req_id, status::OK, "result", json!({}))
    }

    /// An error response carrying a human-readable message.
    pub fn error(req_id: u64, code: u16, message: &str) -> Self {
        Self::response(req_id, code, "result", json!({ "message": message }))
    }

    pub fn entity_change(entity_type: &str, entity_id: &str, attributes: Map<String, Value>) -> Self {
        OutboundMsg::Event {
            msg: "entity_change".to_string(),
            cat: EventCategory::Entity,
            msg_data: json!({
                "entity_type": entity_type,
                "entity_id": entity_id,
                "attributes": attributes,
            }),
        }
    }

    pub fn device_state(state: HostDeviceState) -> Self {
        OutboundMsg::Event {
            msg: "device_state".to_string(),
            cat: EventCategory::Device,
            msg_data: json!({ "state": state }),
        }
    }

    /// Final setup outcome; `error` is `None` on success.
    pub fn driver_setup_change(error: Option<&str>) -> Self {
        let msg_data = match error {
            None => json!({ "event_type": "STOP", "state": "OK" }),
            Some(reason) => json!({ "event_type": "STOP", "state": "ERROR", "error": reason }),
        };
        OutboundMsg::Event {
            msg: "driver_setup_change".to_string(),
            cat: EventCategory::Device,
            msg_data,
        }
    }
}
