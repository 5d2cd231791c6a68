//! Storage infrastructure: the `config.toml` file.
//!
//! The integration keeps one small TOML file holding the integration settings
//! and the single configured player.  It is read once at startup and written
//! again whenever the host confirms a new setup.

pub mod config;

pub use config::{config_dir, load_config, save_config, AppConfig, ConfigError, TomlConfigSink};
