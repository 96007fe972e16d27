//! Boundary to the hub connection
//!
//! The daemon consumes an ordered stream of [`HubMessage`]s from a
//! [`HubClient`] and sends outbound calls back through it. Outbound failures
//! are surfaced to the caller as [`TransportError`] and never retried here.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use hd_config::HubConfig;
use hd_core::{Attributes, EntityId, EntityState, HubMessage, StateValue};
use thiserror::Error;

/// Result type for outbound hub operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Inbound message stream; ends when the connection closes
pub type HubMessageStream = BoxStream<'static, HubMessage>;

/// Errors reported by the hub connection
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("hub connection lost: {0}")]
    Disconnected(String),

    #[error("hub rejected request: {reason}")]
    Rejected { reason: String },

    #[error("hub did not answer within {0:?}")]
    Timeout(Duration),

    #[error("hub protocol error: {0}")]
    Protocol(String),
}

/// Connection to a smart-home hub
#[async_trait]
pub trait HubClient: Send + Sync {
    /// Open the connection and return the inbound message stream
    async fn connect(&self, config: &HubConfig) -> TransportResult<HubMessageStream>;

    /// Current state of every entity, used to seed the state store
    async fn get_states(&self) -> TransportResult<Vec<EntityState>>;

    /// Set an entity state on the hub, returning the state the hub stored
    async fn set_state(
        &self,
        entity_id: &EntityId,
        state: StateValue,
        attributes: Attributes,
    ) -> TransportResult<Option<EntityState>>;

    /// Call `domain.service`, optionally waiting for the hub to confirm
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<serde_json::Value>,
        wait_for_response: bool,
    ) -> TransportResult<()>;

    /// Fire a custom event; returns whether the hub accepted it
    async fn send_event(
        &self,
        event_type: &str,
        data: Option<serde_json::Value>,
    ) -> TransportResult<bool>;
}

/// Thread-safe handle to a hub connection
pub type SharedHubClient = Arc<dyn HubClient>;
