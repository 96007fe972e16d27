//! Error types for the daemon host

use hd_core::EntityIdError;
use hd_listeners::RegistrationError;
use thiserror::Error;

use crate::transport::TransportError;

/// Result type for daemon operations
pub type DaemonResult<T> = Result<T, DaemonError>;

/// Errors surfaced by [`DaemonHost`](crate::DaemonHost)
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Registration(#[from] RegistrationError),

    #[error("invalid entity id: {0}")]
    InvalidEntityId(#[from] EntityIdError),

    #[error("'{0}' is not a script entity")]
    NotAScript(String),

    #[error("text-to-speech service '{0}' is not a valid domain.service")]
    InvalidTtsService(String),

    #[error("daemon is already running")]
    AlreadyRunning,

    /// A stopped host cannot be started again
    #[error("daemon has been stopped")]
    Stopped,

    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}
