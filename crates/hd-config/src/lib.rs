//! Configuration loading for hassdaemon
//!
//! Reads `hassdaemon.yaml` from a config directory, resolving `!secret`,
//! `!env_var` and `!include` tags.
//!
//! # Example
//!
//! ```ignore
//! use hd_config::DaemonConfig;
//!
//! let config = DaemonConfig::load("/config")?;
//! println!("connecting to {}", config.hub.websocket_url());
//! ```

mod daemon_config;
mod error;
mod loader;
mod secrets;

pub use daemon_config::{DaemonConfig, DaemonSettings, HubConfig, LoggingConfig, CONFIG_FILE};
pub use error::{ConfigError, ConfigResult};
pub use loader::YamlLoader;
pub use secrets::{Secrets, SECRETS_FILE};
