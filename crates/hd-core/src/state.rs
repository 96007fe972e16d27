//! Entity state snapshot

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EntityId, StateValue, STATE_UNAVAILABLE, STATE_UNKNOWN};

/// Attribute mapping carried by an entity state
pub type Attributes = HashMap<String, StateValue>;

/// The state of an entity at a point in time
///
/// Includes the state value, any attributes, and timestamps for when the
/// state value last changed and when the entity was last updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    /// The entity this state belongs to
    pub entity_id: EntityId,

    /// The state value (e.g., "on", "off", "23.5", "unavailable")
    pub state: StateValue,

    /// Additional attributes associated with the state
    #[serde(default)]
    pub attributes: Attributes,

    /// When the state value last changed
    pub last_changed: DateTime<Utc>,

    /// When the entity was last updated (even if the value didn't change)
    pub last_updated: DateTime<Utc>,
}

impl EntityState {
    /// Create a new state stamped with the current time
    pub fn new(entity_id: EntityId, state: impl Into<StateValue>, attributes: Attributes) -> Self {
        let now = Utc::now();
        Self {
            entity_id,
            state: state.into(),
            attributes,
            last_changed: now,
            last_updated: now,
        }
    }

    /// Derive the next state, keeping `last_changed` when the value is unchanged
    pub fn with_update(&self, state: impl Into<StateValue>, attributes: Attributes) -> Self {
        let now = Utc::now();
        let state = state.into();
        let last_changed = if state.loosely_equals(&self.state) {
            self.last_changed
        } else {
            now
        };

        Self {
            entity_id: self.entity_id.clone(),
            state,
            attributes,
            last_changed,
            last_updated: now,
        }
    }

    /// Numeric view of the state value, `None` when not a number
    pub fn numeric_state(&self) -> Option<f64> {
        self.state.as_f64()
    }

    pub fn is_unavailable(&self) -> bool {
        self.state.as_str() == Some(STATE_UNAVAILABLE)
    }

    pub fn is_unknown(&self) -> bool {
        self.state.as_str() == Some(STATE_UNKNOWN)
    }

    pub fn attribute(&self, key: &str) -> Option<&StateValue> {
        self.attributes.get(key)
    }
}

impl PartialEq for EntityState {
    fn eq(&self, other: &Self) -> bool {
        // Timestamps are not compared
        self.entity_id == other.entity_id
            && self.state == other.state
            && self.attributes == other.attributes
    }
}
