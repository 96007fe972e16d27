//! Entity state storage with domain indexing for hassdaemon
//!
//! This crate provides the EntityStateStore, which caches the most recently
//! observed state of every entity the hub has reported. The dispatch loop is
//! its only writer; listeners and applications read snapshots from it.

use dashmap::DashMap;
use hd_core::{EntityState, StateChangedData, StateValue};
use std::sync::Arc;
use tracing::{debug, instrument, trace};

/// The latest known state of every observed entity
///
/// The EntityStateStore is responsible for:
/// - Keeping one live state per entity id (last write wins)
/// - Maintaining a domain index for domain-based queries
/// - Handing out owned copies so readers never race with updates
pub struct EntityStateStore {
    /// All entity states keyed by entity_id string
    states: DashMap<String, EntityState>,
    /// Index of entity_ids by domain
    domain_index: DashMap<String, Vec<String>>,
}

impl EntityStateStore {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
            domain_index: DashMap::new(),
        }
    }

    /// Replace the store contents with the hub's full state dump
    #[instrument(skip_all, fields(count = states.len()))]
    pub fn seed(&self, states: Vec<EntityState>) {
        self.states.clear();
        self.domain_index.clear();
        for state in states {
            self.insert(state);
        }
        debug!("Seeded entity state store");
    }

    /// Apply a state change, overwriting the entry for its entity
    #[instrument(skip(self, change), fields(entity_id = %change.entity_id))]
    pub fn update(&self, change: &StateChangedData) {
        trace!(state = %change.new_state.state, "Updating entity state");
        self.insert(change.new_state.clone());
    }

    fn insert(&self, state: EntityState) {
        let key = state.entity_id.to_string();
        let domain = state.entity_id.domain().to_string();

        if self.states.insert(key.clone(), state).is_none() {
            self.domain_index.entry(domain).or_default().push(key);
        }
    }

    /// Get the current state of an entity
    pub fn get(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|s| s.clone())
    }

    /// Get the state value, or None if the entity was never observed
    pub fn get_state_value(&self, entity_id: &str) -> Option<StateValue> {
        self.states.get(entity_id).map(|s| s.state.clone())
    }

    /// Check if an entity is in a specific state
    pub fn is_state(&self, entity_id: &str, state: impl Into<StateValue>) -> bool {
        let expected = state.into();
        self.get_state_value(entity_id)
            .is_some_and(|current| current.loosely_equals(&expected))
    }

    /// Get all entity IDs for a domain
    pub fn entity_ids(&self, domain: &str) -> Vec<String> {
        self.domain_index
            .get(domain)
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Get all states for a domain
    pub fn domain_states(&self, domain: &str) -> Vec<EntityState> {
        self.entity_ids(domain)
            .iter()
            .filter_map(|id| self.get(id))
            .collect()
    }

    /// Point-in-time copy of every state
    pub fn all(&self) -> Vec<EntityState> {
        self.states.iter().map(|r| r.value().clone()).collect()
    }

    pub fn entity_count(&self) -> usize {
        self.states.len()
    }
}

impl Default for EntityStateStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for EntityStateStore
pub type SharedStateStore = Arc<EntityStateStore>;
