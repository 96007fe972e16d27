//! Core types for hassdaemon
//!
//! This crate provides the value types shared by every other crate in the
//! workspace: entity ids, the tagged `StateValue` union, entity state
//! snapshots, and the inbound messages delivered by the hub transport.

mod entity_id;
mod message;
mod service_call;
mod state;
mod value;

pub use entity_id::{EntityId, EntityIdError};
pub use message::{HubEvent, HubMessage, StateChangedData};
pub use service_call::ServiceCall;
pub use state::{Attributes, EntityState};
pub use value::StateValue;

/// State value reported by the hub for entities it cannot reach
pub const STATE_UNAVAILABLE: &str = "unavailable";

/// State value reported by the hub when the state is not yet known
pub const STATE_UNKNOWN: &str = "unknown";

/// Event type names with special meaning
pub mod events {
    /// Wildcard event type that matches every event
    pub const MATCH_ALL: &str = "*";
}
