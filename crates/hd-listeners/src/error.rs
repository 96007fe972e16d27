//! Registration errors

use hd_core::EntityIdError;
use thiserror::Error;

/// Result type for listener registration
pub type RegistrationResult<T> = Result<T, RegistrationError>;

/// Rejections returned synchronously when a listener cannot be registered
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistrationError {
    #[error("pattern cannot be empty")]
    EmptyPattern,

    #[error("invalid entity pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: EntityIdError,
    },

    #[error("entity set cannot be empty")]
    EmptyEntitySet,

    #[error("event name cannot be empty")]
    EmptyEventName,

    #[error("service call filter needs both a domain and a service")]
    EmptyServiceFilter,

    #[error("attribute '{name}' set before any action")]
    AttributeWithoutAction { name: String },

    #[error("listener registry is closed")]
    Closed,
}
