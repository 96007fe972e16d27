//! Tracing subscriber setup

use hd_config::LoggingConfig;
use tracing_subscriber::EnvFilter;

use crate::error::{DaemonError, DaemonResult};

/// Install the global fmt subscriber
///
/// `RUST_LOG` takes precedence over `config.level`. Fails with
/// [`DaemonError::LoggingInit`] when a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> DaemonResult<()> {
    let filter = env_filter(config)?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .try_init()
        .map_err(|e| DaemonError::LoggingInit(e.to_string()))
}

fn env_filter(config: &LoggingConfig) -> DaemonResult<EnvFilter> {
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => EnvFilter::try_new(&config.level)
            .map_err(|e| DaemonError::LoggingInit(format!("invalid level '{}': {e}", config.level))),
    }
}
