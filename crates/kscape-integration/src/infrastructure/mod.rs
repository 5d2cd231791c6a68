//! Infrastructure layer for kscape-integration.
//!
//! # Responsibilities
//!
//! - The TCP session to the player (line framing, handshake, reply matching)
//! - The host WebSocket server
//! - `config.toml` persistence
//! - Spawning and stopping the tasks of a running integration

pub mod bridge;
pub mod device_session;
pub mod storage;
pub mod ws_server;

pub use bridge::{start, BridgeHandle};
pub use device_session::{TcpConnector, TcpSession};
pub use ws_server::run_server;
