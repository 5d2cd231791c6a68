//! kscape-integration library crate.
//!
//! Exposes a Kaleidescape movie player to a remote-control host as a media
//! player, a remote and three sensors.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Remote-control host (JSON over WebSocket, port 9090)
//!         ↕
//! [kscape-integration]
//!   ├── domain/           BridgeConfig, host frames, entity definitions
//!   ├── application/      Supervisor, command dispatcher, entity adapter
//!   └── infrastructure/
//!         ├── ws_server/       host WebSocket accept loop (tokio-tungstenite)
//!         ├── device_session/  TCP session to the player (kscape-core codec)
//!         ├── storage/         config.toml
//!         └── bridge/          task wiring and shutdown
//!         ↕
//! Kaleidescape player (line protocol over TCP, port 10000)
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O and no async.
//! - `application` depends on `domain` and `kscape-core`; it reaches the
//!   device only through the [`application::DeviceLink`] and
//!   [`application::DeviceConnector`] traits.
//! - `infrastructure` depends on all other layers plus `tokio` and
//!   `tungstenite`.

/// Domain layer: configuration, host frames and entities (no I/O).
pub mod domain;

/// Application layer: supervisor, dispatcher and entity adapter.
pub mod application;

/// Infrastructure layer: device TCP session, WebSocket server, storage.
pub mod infrastructure;
