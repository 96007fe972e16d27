//! Inbound messages delivered by the hub transport

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityId, EntityState, ServiceCall};

/// Payload of a state change
///
/// `old_state` is absent the first time the daemon observes an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateChangedData {
    pub entity_id: EntityId,
    #[serde(default)]
    pub old_state: Option<EntityState>,
    pub new_state: EntityState,
}

impl StateChangedData {
    pub fn new(old_state: Option<EntityState>, new_state: EntityState) -> Self {
        Self {
            entity_id: new_state.entity_id.clone(),
            old_state,
            new_state,
        }
    }

    /// Whether the state value differs (attribute-only updates return false)
    ///
    /// Values are compared loosely, so `"21"` to `21` is not a change.
    pub fn state_changed(&self) -> bool {
        self.old_state
            .as_ref()
            .map_or(true, |old| !old.state.loosely_equals(&self.new_state.state))
    }
}

/// A generic hub event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubEvent {
    pub event_type: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub time_fired: DateTime<Utc>,
}

impl HubEvent {
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            time_fired: Utc::now(),
        }
    }
}

/// A message consumed by the dispatch loop, in arrival order
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HubMessage {
    StateChanged(StateChangedData),
    Event(HubEvent),
    ServiceCall(ServiceCall),
}

impl HubMessage {
    /// Short label used in log fields
    pub fn kind(&self) -> &'static str {
        match self {
            HubMessage::StateChanged(_) => "state_changed",
            HubMessage::Event(_) => "event",
            HubMessage::ServiceCall(_) => "service_call",
        }
    }
}

impl From<StateChangedData> for HubMessage {
    fn from(data: StateChangedData) -> Self {
        HubMessage::StateChanged(data)
    }
}

impl From<HubEvent> for HubMessage {
    fn from(event: HubEvent) -> Self {
        HubMessage::Event(event)
    }
}

impl From<ServiceCall> for HubMessage {
    fn from(call: ServiceCall) -> Self {
        HubMessage::ServiceCall(call)
    }
}
