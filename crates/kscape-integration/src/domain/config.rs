//! Integration configuration types.
//!
//! [`BridgeConfig`] is the single source of truth for all runtime settings.
//! `main.rs` builds it from the CLI, environment and `config.toml`; tests build
//! it from [`BridgeConfig::default`] and override what they need.
//!
//! [`DeviceEndpoint`] is the one configured player.  The integration drives a
//! single player only, so the configuration holds at most one.

use std::net::SocketAddr;
use std::time::Duration;

use kscape_core::protocol::messages::DEFAULT_PORT;
use thiserror::Error;

/// Invalid device configuration.  Entities stay unregistered until it is fixed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("device id must not be empty")]
    EmptyId,

    #[error("device host must not be empty")]
    EmptyHost,

    #[error("invalid device port {0:?}")]
    InvalidPort(String),

    #[error("invalid device address {0:?}")]
    InvalidAddress(String),
}

/// The configured player.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEndpoint {
    /// Stable identifier used as the entity id suffix.
    pub id: String,
    /// Display name shown on the remote.
    pub name: String,
    pub host: String,
    pub port: u16,
}

impl DeviceEndpoint {
    /// Builds an endpoint from a `host[:port]` address as entered during setup.
    ///
    /// The id is derived from the host so that re-running setup against the
    /// same player keeps the same entity ids.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] if the address cannot be parsed.
    pub fn from_address(address: &str, name: Option<&str>) -> Result<Self, ConfigurationError> {
        let (host, port) = parse_address(address)?;
        let id = derive_id(&host);
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map_or_else(|| format!("Kaleidescape {host}"), str::to_string);
        let endpoint = Self {
            id,
            name,
            host,
            port,
        };
        endpoint.validate()?;
        Ok(endpoint)
    }

    /// Checks the fields a hand-edited config file could get wrong.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError`] for an empty id or host, a zero port or
    /// a host containing whitespace.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.id.trim().is_empty() {
            return Err(ConfigurationError::EmptyId);
        }
        if self.host.trim().is_empty() {
            return Err(ConfigurationError::EmptyHost);
        }
        if self.host.chars().any(char::is_whitespace) {
            return Err(ConfigurationError::InvalidAddress(self.host.clone()));
        }
        if self.port == 0 {
            return Err(ConfigurationError::InvalidPort("0".to_string()));
        }
        Ok(())
    }

    /// `host:port` string suitable for `TcpStream::connect`.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Splits `host[:port]`, defaulting the port to the control-protocol port.
///
/// Bracketed IPv6 literals (`[fe80::1]:10000`) and bare IPv6 literals are
/// both accepted.
///
/// # Errors
///
/// Returns [`ConfigurationError`] for an empty host or an unparsable port.
pub fn parse_address(input: &str) -> Result<(String, u16), ConfigurationError> {
    let input = input.trim();
    if input.is_empty() {
        return Err(ConfigurationError::EmptyHost);
    }

    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok((addr.ip().to_string(), addr.port()));
    }
    if input.parse::<std::net::Ipv6Addr>().is_ok() {
        return Ok((input.to_string(), DEFAULT_PORT));
    }

    let (host, port) = match input.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| ConfigurationError::InvalidPort(port.to_string()))?;
            (host, port)
        }
        None => (input, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(ConfigurationError::EmptyHost);
    }
    if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '[' || c == ']') {
        return Err(ConfigurationError::InvalidAddress(input.to_string()));
    }
    Ok((host.to_string(), port))
}

fn derive_id(host: &str) -> String {
    host.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// All runtime configuration for the integration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Address the host-facing WebSocket server binds to.
    pub ws_bind_addr: SocketAddr,

    /// The configured player, if setup has been completed.
    pub device: Option<DeviceEndpoint>,

    /// How long a lost connection may stay down before entities are reported
    /// Unavailable.
    pub grace_period: Duration,

    /// Idle time after which a health probe is sent.
    pub probe_interval: Duration,

    /// Consecutive failed probes that force a reconnect.
    pub probe_failure_limit: u32,

    /// Maximum wait for a command acknowledgement.
    pub command_timeout: Duration,

    /// Maximum wait for the TCP connect and the handshake.
    pub connect_timeout: Duration,

    /// First reconnect delay.
    pub backoff_initial: Duration,

    /// Reconnect delay ceiling.
    pub backoff_max: Duration,

    /// Pending outbound messages per host connection before it is dropped.
    pub host_queue_capacity: usize,
}

impl Default for BridgeConfig {
    /// | Field               | Default         |
    /// |---------------------|-----------------|
    /// | ws_bind_addr        | `0.0.0.0:9090`  |
    /// | device              | none            |
    /// | grace_period        | 10 seconds      |
    /// | probe_interval      | 30 seconds      |
    /// | probe_failure_limit | 3               |
    /// | command_timeout     | 5 seconds       |
    /// | connect_timeout     | 5 seconds       |
    /// | backoff_initial     | 1 second        |
    /// | backoff_max         | 30 seconds      |
    /// | host_queue_capacity | 64              |
    fn default() -> Self {
        Self {
            ws_bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            device: None,
            grace_period: Duration::from_secs(10),
            probe_interval: Duration::from_secs(30),
            probe_failure_limit: 3,
            command_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            backoff_initial: kscape_core::domain::backoff::DEFAULT_INITIAL,
            backoff_max: kscape_core::domain::backoff::DEFAULT_MAX,
            host_queue_capacity: 64,
        }
    }
}
