//! Kaleidescape integration: entry point.
//!
//! Serves the remote-control host on a WebSocket port and keeps one TCP
//! session to the configured Kaleidescape player.
//!
//! # Usage
//!
//! ```text
//! kscape-integration [OPTIONS]
//!
//! Options:
//!   --ws-port <PORT>            WebSocket listener port [default: 9090]
//!   --ws-bind <IP>              WebSocket bind address [default: 0.0.0.0]
//!   --device-host <HOST>        Player hostname or IP (overrides config.toml)
//!   --device-port <PORT>        Player control port [default: 10000]
//!   --config-dir <DIR>          Directory holding config.toml
//!   --grace-period <SECS>       Outage tolerated before entities go Unavailable [default: 10]
//!   --probe-interval <SECS>     Idle time before a health probe [default: 30]
//!   --command-timeout <SECS>    Acknowledgement timeout [default: 5]
//!   --connect-timeout <SECS>    Connect and handshake timeout [default: 5]
//!   --backoff-initial <SECS>    First reconnect delay [default: 1]
//!   --backoff-max <SECS>        Reconnect delay ceiling [default: 30]
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable                    | Flag             |
//! |-----------------------------|------------------|
//! | `UC_INTEGRATION_HTTP_PORT`  | `--ws-port`      |
//! | `KSCAPE_DEVICE_HOST`        | `--device-host`  |
//! | `UC_CONFIG_HOME`            | `--config-dir`   |
//!
//! The log filter comes from `RUST_LOG`, falling back to `log_level` in
//! `config.toml`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use kscape_core::protocol::messages::DEFAULT_PORT;
use kscape_integration::domain::{BridgeConfig, DeviceEndpoint};
use kscape_integration::infrastructure::storage::{config_dir, load_config, TomlConfigSink};
use kscape_integration::infrastructure::start;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Kaleidescape integration for remote-control hosts.
#[derive(Debug, Parser)]
#[command(
    name = "kscape-integration",
    about = "Exposes a Kaleidescape player to a remote-control host over WebSocket",
    version
)]
struct Cli {
    /// TCP port for the host WebSocket server.
    #[arg(long, env = "UC_INTEGRATION_HTTP_PORT")]
    ws_port: Option<u16>,

    /// IP address to bind the WebSocket server to.
    #[arg(long, default_value = "0.0.0.0")]
    ws_bind: String,

    /// Player hostname or IP.  Replaces the device in `config.toml`.
    #[arg(long, env = "KSCAPE_DEVICE_HOST")]
    device_host: Option<String>,

    /// Player control port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    device_port: u16,

    /// Directory holding `config.toml`.  Defaults to the platform config dir.
    #[arg(long, env = "UC_CONFIG_HOME")]
    config_dir: Option<PathBuf>,

    /// Seconds a lost connection may stay down before entities go Unavailable.
    #[arg(long, default_value_t = 10)]
    grace_period: u64,

    /// Seconds of silence before a health probe is sent.
    #[arg(long, default_value_t = 30)]
    probe_interval: u64,

    /// Seconds to wait for a command acknowledgement.
    #[arg(long, default_value_t = 5)]
    command_timeout: u64,

    /// Seconds to wait for the TCP connect and for the handshake.
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,

    /// First reconnect delay in seconds.
    #[arg(long, default_value_t = 1)]
    backoff_initial: u64,

    /// Reconnect delay ceiling in seconds.
    #[arg(long, default_value_t = 30)]
    backoff_max: u64,
}

impl Cli {
    /// Builds the runtime configuration.
    ///
    /// `file_port` is the `ws_port` from `config.toml`, used when no port was
    /// given on the command line.  `device` is the player from the file; a
    /// `--device-host` replaces it.
    ///
    /// # Errors
    ///
    /// Returns an error if `--ws-bind` is not an IP address or the
    /// `--device-host` entry is invalid.
    fn into_bridge_config(
        self,
        file_port: u16,
        device: Option<DeviceEndpoint>,
    ) -> anyhow::Result<BridgeConfig> {
        let ws_port = self.ws_port.unwrap_or(file_port);
        let ws_bind_addr: SocketAddr = format!("{}:{}", self.ws_bind, ws_port)
            .parse()
            .with_context(|| {
                format!("invalid WebSocket bind address: '{}:{}'", self.ws_bind, ws_port)
            })?;

        let device = match self.device_host {
            Some(host) => {
                let mut endpoint = DeviceEndpoint::from_address(&host, None)
                    .with_context(|| format!("invalid --device-host '{host}'"))?;
                endpoint.port = self.device_port;
                Some(endpoint)
            }
            None => device,
        };

        Ok(BridgeConfig {
            ws_bind_addr,
            device,
            grace_period: Duration::from_secs(self.grace_period),
            probe_interval: Duration::from_secs(self.probe_interval),
            command_timeout: Duration::from_secs(self.command_timeout),
            connect_timeout: Duration::from_secs(self.connect_timeout),
            backoff_initial: Duration::from_secs(self.backoff_initial),
            backoff_max: Duration::from_secs(self.backoff_max.max(self.backoff_initial)),
            ..BridgeConfig::default()
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let dir = config_dir(cli.config_dir.as_deref())?;
    let file = load_config(&dir).with_context(|| format!("failed to load config from {}", dir.display()))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new(&file.integration.log_level))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let stored = match file.device.as_ref().map(|d| d.to_endpoint()).transpose() {
        Ok(device) => device,
        Err(e) => {
            error!("ignoring device in {}: {e}", dir.display());
            None
        }
    };
    let mut config = cli.into_bridge_config(file.integration.ws_port, stored)?;

    if let Some(device) = &config.device {
        if let Err(e) = tokio::net::lookup_host(device.address()).await {
            error!(
                "player address {} does not resolve ({e}); waiting for setup",
                device.address()
            );
            config.device = None;
        }
    }

    match &config.device {
        Some(device) => info!(
            "Kaleidescape integration starting: ws={}, player={} ({})",
            config.ws_bind_addr,
            device.address(),
            device.name
        ),
        None => info!(
            "Kaleidescape integration starting: ws={}, no player configured",
            config.ws_bind_addr
        ),
    }

    let handle = start(config, Box::new(TomlConfigSink::new(dir))).await?;
    let running = handle.running();

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C; shutting down"),
        Err(e) => warn!("failed to listen for Ctrl+C signal: {e}"),
    }
    running.store(false, Ordering::Relaxed);
    handle.shutdown().await;

    info!("Kaleidescape integration stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["kscape-integration"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_cli_defaults() {
        // Arrange: parse with no arguments (all defaults apply)
        let cli = parse(&[]);

        // Assert
        assert_eq!(cli.ws_bind, "0.0.0.0");
        assert_eq!(cli.device_port, 10_000);
        assert_eq!(cli.grace_period, 10);
        assert_eq!(cli.probe_interval, 30);
        assert_eq!(cli.backoff_max, 30);
    }

    #[test]
    fn test_file_port_used_when_flag_absent() {
        let cli = Cli {
            ws_port: None,
            ..parse(&[])
        };

        let config = cli.into_bridge_config(9191, None).unwrap();

        assert_eq!(config.ws_bind_addr.port(), 9191);
    }

    #[test]
    fn test_ws_port_flag_beats_file() {
        let cli = parse(&["--ws-port", "9999"]);
        let config = cli.into_bridge_config(9090, None).unwrap();
        assert_eq!(config.ws_bind_addr.port(), 9999);
    }

    #[test]
    fn test_device_host_overrides_stored_device() {
        // Arrange
        let stored = DeviceEndpoint::from_address("10.0.0.1", Some("Old")).unwrap();
        let cli = parse(&["--device-host", "10.0.0.5", "--device-port", "10001"]);

        // Act
        let config = cli.into_bridge_config(9090, Some(stored)).unwrap();

        // Assert
        let device = config.device.unwrap();
        assert_eq!(device.host, "10.0.0.5");
        assert_eq!(device.port, 10_001);
    }

    #[test]
    fn test_stored_device_kept_without_flag() {
        let stored = DeviceEndpoint::from_address("10.0.0.1", Some("Theater")).unwrap();
        let cli = Cli {
            device_host: None,
            ..parse(&[])
        };

        let config = cli.into_bridge_config(9090, Some(stored.clone())).unwrap();

        assert_eq!(config.device, Some(stored));
    }

    #[test]
    fn test_timing_flags_become_durations() {
        let cli = parse(&[
            "--grace-period",
            "3",
            "--command-timeout",
            "2",
            "--backoff-initial",
            "4",
            "--backoff-max",
            "2",
        ]);

        let config = cli.into_bridge_config(9090, None).unwrap();

        assert_eq!(config.grace_period, Duration::from_secs(3));
        assert_eq!(config.command_timeout, Duration::from_secs(2));
        // The ceiling never drops below the first delay.
        assert_eq!(config.backoff_max, Duration::from_secs(4));
    }

    #[test]
    fn test_invalid_ws_bind_returns_error() {
        let cli = parse(&["--ws-bind", "not.an.ip"]);
        assert!(cli.into_bridge_config(9090, None).is_err());
    }
}
