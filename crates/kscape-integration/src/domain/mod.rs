//! Domain layer for kscape-integration.
//!
//! Pure types with no sockets, tasks or file I/O: the runtime configuration,
//! the host protocol frames and the entities a host can see.
//!
//! # What does NOT belong here?
//!
//! - Any `tokio`, `TcpStream` or WebSocket types
//! - Reading or writing `config.toml`

pub mod config;
pub mod entity;
pub mod messages;

pub use config::{BridgeConfig, ConfigurationError, DeviceEndpoint};
pub use entity::{entities_for, Availability, EntityDef, SensorKind};
pub use messages::{parse_inbound, HostEvent, HostRequest, Inbound, OutboundMsg};
