//! TOML persistence for the integration settings and the configured player.
//!
//! The file lives at `<config dir>/config.toml`.  The config dir is taken from
//! `--config-dir` / `UC_CONFIG_HOME` when given, otherwise:
//! - Linux:    `$XDG_CONFIG_HOME/kscape-integration` or `~/.config/kscape-integration`
//! - macOS:    `~/Library/Application Support/KscapeIntegration`
//! - Windows:  `%APPDATA%\KscapeIntegration`
//!
//! ```toml
//! [integration]
//! log_level = "info"
//! ws_port = 9090
//!
//! [device]
//! id = "192_168_1_20"
//! name = "Theater"
//! host = "192.168.1.20"
//! port = 10000
//! ```
//!
//! Missing fields fall back to their serde defaults, and a missing file is the
//! same as an empty one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::application::adapter::{AdapterError, ConfigSink};
use crate::domain::config::DeviceEndpoint;

pub const CONFIG_FILE: &str = "config.toml";

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No config dir was given and the platform default could not be found.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub integration: IntegrationSection,
    /// At most one player.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IntegrationSection {
    /// `tracing` filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub host: String,
    #[serde(default = "default_device_port")]
    pub port: u16,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_ws_port() -> u16 {
    9090
}
fn default_device_port() -> u16 {
    kscape_core::protocol::messages::DEFAULT_PORT
}

impl Default for IntegrationSection {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            ws_port: default_ws_port(),
        }
    }
}

impl From<&DeviceEndpoint> for DeviceEntry {
    fn from(device: &DeviceEndpoint) -> Self {
        Self {
            id: device.id.clone(),
            name: device.name.clone(),
            host: device.host.clone(),
            port: device.port,
        }
    }
}

impl DeviceEntry {
    /// Converts the stored entry, filling in a display name if it is blank.
    ///
    /// # Errors
    ///
    /// Returns the validation error for an empty id or host or a zero port.
    pub fn to_endpoint(&self) -> Result<DeviceEndpoint, crate::domain::config::ConfigurationError> {
        let name = if self.name.trim().is_empty() {
            format!("Kaleidescape {}", self.host)
        } else {
            self.name.clone()
        };
        let endpoint = DeviceEndpoint {
            id: self.id.clone(),
            name,
            host: self.host.clone(),
            port: self.port,
        };
        endpoint.validate()?;
        Ok(endpoint)
    }
}

// ── Config repository ─────────────────────────────────────────────────────────

/// Picks the config dir: `explicit` if given, else the platform default.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] when neither is available.
pub fn config_dir(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
    match explicit {
        Some(dir) => Ok(dir.to_path_buf()),
        None => platform_config_dir().ok_or(ConfigError::NoPlatformConfigDir),
    }
}

/// Loads `config.toml` from `dir`, returning defaults if it does not exist.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system errors other than "not found" and
/// [`ConfigError::Parse`] for malformed TOML.
pub fn load_config(dir: &Path) -> Result<AppConfig, ConfigError> {
    let path = dir.join(CONFIG_FILE);
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Writes `config` to `dir/config.toml`, creating the directory if needed.
///
/// # Errors
///
/// [`ConfigError::Io`] for file-system failures and
/// [`ConfigError::Serialize`] if serialization fails.
pub fn save_config(dir: &Path, config: &AppConfig) -> Result<(), ConfigError> {
    std::fs::create_dir_all(dir).map_err(|source| ConfigError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let path = dir.join(CONFIG_FILE);
    let content = toml::to_string_pretty(config)?;
    std::fs::write(&path, content).map_err(|source| ConfigError::Io { path, source })?;
    Ok(())
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("KscapeIntegration"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("kscape-integration"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("KscapeIntegration")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Setup sink ────────────────────────────────────────────────────────────────

/// Stores confirmed setups in `config.toml`, keeping the other sections.
#[derive(Debug, Clone)]
pub struct TomlConfigSink {
    dir: PathBuf,
}

impl TomlConfigSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl ConfigSink for TomlConfigSink {
    fn persist_device(&self, device: &DeviceEndpoint) -> Result<(), AdapterError> {
        let persist = || -> Result<(), ConfigError> {
            let mut config = load_config(&self.dir)?;
            config.device = Some(DeviceEntry::from(device));
            save_config(&self.dir, &config)
        };
        persist().map_err(|e| AdapterError::Persist(e.to_string()))?;
        info!(
            "saved player {} to {}",
            device.address(),
            self.dir.join(CONFIG_FILE).display()
        );
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
