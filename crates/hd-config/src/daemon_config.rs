//! Daemon configuration
//!
//! Parses `hassdaemon.yaml`:
//!
//! ```yaml
//! hub:
//!   host: homeassistant.local
//!   port: 8123
//!   ssl: false
//!   token: !secret hub_token
//! logging:
//!   level: info
//!   with_target: true
//! daemon:
//!   stop_timeout_secs: 5
//!   tts_service: tts.google_say
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use tracing::info;

use crate::error::{ConfigError, ConfigResult};
use crate::loader::YamlLoader;
use crate::secrets::Secrets;

pub const CONFIG_FILE: &str = "hassdaemon.yaml";

/// Connection settings for the hub
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub host: String,
    pub port: u16,
    pub ssl: bool,
    pub token: String,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            ssl: false,
            token: String::new(),
        }
    }
}

impl HubConfig {
    /// Websocket endpoint of the hub
    pub fn websocket_url(&self) -> String {
        let scheme = if self.ssl { "wss" } else { "ws" };
        format!("{scheme}://{}:{}/api/websocket", self.host, self.port)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::invalid("hub.host", "host must not be empty"));
        }
        if self.port == 0 {
            return Err(ConfigError::invalid("hub.port", "port must be between 1 and 65535"));
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::invalid("hub.token", "access token must not be empty"));
        }
        Ok(())
    }
}

impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("ssl", &self.ssl)
            .field("token", &"<redacted>")
            .finish()
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    pub with_target: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            with_target: true,
        }
    }
}

/// Runtime behaviour of the daemon itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// How long `stop()` waits for the dispatch loop to wind down
    pub stop_timeout_secs: u64,
    /// `domain.service` used to speak text on a media player
    pub tts_service: String,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            stop_timeout_secs: 5,
            tts_service: "tts.google_say".to_string(),
        }
    }
}

impl DaemonSettings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// The text-to-speech service split into domain and service
    pub fn tts_parts(&self) -> Option<(&str, &str)> {
        self.tts_service
            .split_once('.')
            .filter(|(domain, service)| !domain.is_empty() && !service.is_empty())
    }
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub hub: HubConfig,
    pub logging: LoggingConfig,
    pub daemon: DaemonSettings,
}

impl DaemonConfig {
    /// Load `hassdaemon.yaml` (and `secrets.yaml`) from `config_dir`
    pub fn load(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref();
        let mut loader = YamlLoader::new(config_dir)?;
        let yaml = loader.load_file(CONFIG_FILE)?;
        let config = Self::from_yaml(&yaml)?;
        info!(
            hub = %config.hub.websocket_url(),
            dir = %config_dir.display(),
            "Loaded daemon configuration"
        );
        Ok(config)
    }

    /// Parse configuration text; `!secret` tags resolve against `secrets`
    pub fn from_yaml_str_with_secrets(content: &str, secrets: Secrets) -> ConfigResult<Self> {
        let mut loader = YamlLoader::with_secrets(PathBuf::from("."), secrets);
        let yaml = loader.load_str(content, Path::new(CONFIG_FILE))?;
        Self::from_yaml(&yaml)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        Self::from_yaml_str_with_secrets(content, Secrets::default())
    }

    /// Build from an already resolved YAML value
    pub fn from_yaml(yaml: &Value) -> ConfigResult<Self> {
        let root = match yaml {
            Value::Null => return Self::validated(Self::default()),
            Value::Mapping(map) => map,
            _ => return Err(ConfigError::invalid("root", "configuration must be a mapping")),
        };

        let config = Self {
            hub: section(root, "hub")?,
            logging: section(root, "logging")?,
            daemon: section(root, "daemon")?,
        };
        Self::validated(config)
    }

    fn validated(config: Self) -> ConfigResult<Self> {
        config.hub.validate()?;
        if config.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level", "level must not be empty"));
        }
        if config.daemon.tts_parts().is_none() {
            return Err(ConfigError::invalid(
                "daemon.tts_service",
                "expected a 'domain.service' name",
            ));
        }
        Ok(config)
    }
}

/// Deserialize one top-level section, defaulting when absent
fn section<T>(root: &serde_yaml::Mapping, key: &str) -> ConfigResult<T>
where
    T: DeserializeOwned + Default,
{
    match root.get(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_yaml::from_value(value.clone())
            .map_err(|e| ConfigError::invalid(key, e.to_string())),
    }
}
