//! Application layer for kscape-integration.
//!
//! The long-running actors and the seams they talk through:
//!
//! - [`supervisor`] owns the device connection lifecycle;
//! - [`dispatcher`] serializes commands onto the live link;
//! - [`adapter`] owns the entities and the host subscriptions;
//! - [`device_link`] defines the traits the infrastructure layer implements.
//!
//! Nothing here opens a socket; every actor is tested against mocks.

pub mod adapter;
pub mod device_link;
pub mod dispatcher;
pub mod supervisor;

pub use adapter::{AdapterError, AdapterRequest, ConfigSink, ConnectionId, EntityAdapter};
pub use device_link::{Ack, ConnectError, DeviceConnector, DeviceLink, EventStream, Session};
pub use dispatcher::{run_dispatcher, CommandEnvelope};
pub use supervisor::{Supervisor, SupervisorControl, SupervisorEvent, SupervisorSettings};
