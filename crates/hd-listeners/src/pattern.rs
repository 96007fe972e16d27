//! Pattern matching for state, event and service call listeners
//!
//! Every listener carries a filter implementing [`Matcher`] for the payload
//! it listens to. The dispatch loop asks each filter whether an incoming
//! message concerns its listener; user predicates that panic are logged and
//! count as a non-match.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use hd_core::{events, EntityId, EntityState, HubEvent, ServiceCall, StateChangedData, StateValue};
use tracing::{trace, warn};

use crate::error::{RegistrationError, RegistrationResult};

/// Decides whether a payload concerns a listener
pub trait Matcher<A>: Send + Sync {
    fn matches(&self, args: &A) -> bool;
}

/// Predicate over a `(new, old)` state pair
pub type StatePredicate = Arc<dyn Fn(&EntityState, Option<&EntityState>) -> bool + Send + Sync>;

/// Predicate over an incoming event
pub type EventPredicate = Arc<dyn Fn(&HubEvent) -> bool + Send + Sync>;

/// Which entities a state listener watches
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityPattern {
    /// Every entity (`*`)
    Any,
    /// Every entity of a domain (`light`, `light.` or `light.*`)
    Domain(String),
    /// A single entity
    Exact(EntityId),
    /// Any entity of an explicit set
    Set(Vec<EntityId>),
}

impl EntityPattern {
    /// Parse a textual pattern: `*`, a domain, `domain.`, `domain.*` or an entity id
    pub fn parse(pattern: &str) -> RegistrationResult<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(RegistrationError::EmptyPattern);
        }
        if pattern == "*" {
            return Ok(EntityPattern::Any);
        }

        let invalid = |source| RegistrationError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        };

        let domain = pattern
            .strip_suffix(".*")
            .or_else(|| pattern.strip_suffix('.'))
            .or_else(|| (!pattern.contains('.')).then_some(pattern));

        match domain {
            Some(domain) => {
                EntityId::validate_domain(domain).map_err(invalid)?;
                Ok(EntityPattern::Domain(domain.to_string()))
            }
            None => pattern.parse().map(EntityPattern::Exact).map_err(invalid),
        }
    }

    /// Build a set pattern from entity id strings
    pub fn entities<I, S>(ids: I) -> RegistrationResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut ids = ids
            .into_iter()
            .map(|id| {
                let id = id.as_ref();
                id.parse::<EntityId>()
                    .map_err(|source| RegistrationError::InvalidPattern {
                        pattern: id.to_string(),
                        source,
                    })
            })
            .collect::<RegistrationResult<Vec<_>>>()?;

        match ids.len() {
            0 => Err(RegistrationError::EmptyEntitySet),
            1 => Ok(EntityPattern::Exact(ids.remove(0))),
            _ => Ok(EntityPattern::Set(ids)),
        }
    }

    pub fn matches(&self, entity_id: &EntityId) -> bool {
        match self {
            EntityPattern::Any => true,
            EntityPattern::Domain(domain) => entity_id.in_domain(domain),
            EntityPattern::Exact(id) => id == entity_id,
            EntityPattern::Set(ids) => ids.contains(entity_id),
        }
    }
}

impl fmt::Display for EntityPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityPattern::Any => f.write_str("*"),
            EntityPattern::Domain(domain) => write!(f, "{domain}.*"),
            EntityPattern::Exact(id) => write!(f, "{id}"),
            EntityPattern::Set(ids) => {
                let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", ids.join(", "))
            }
        }
    }
}

/// What a matching state change must look like
#[derive(Clone)]
pub enum StateCondition {
    /// Value filters on the transition
    ///
    /// With `all_changes` false, updates that leave the state value unchanged
    /// (attribute-only updates) are ignored.
    Filter {
        to: Option<StateValue>,
        from: Option<StateValue>,
        all_changes: bool,
    },
    /// Arbitrary predicate over `(new, old)`; value filters do not apply
    Predicate(StatePredicate),
}

impl StateCondition {
    /// Fire on any change of the state value
    pub fn any_change() -> Self {
        Self::transition(None::<StateValue>, None::<StateValue>)
    }

    /// Fire on every update, including attribute-only ones
    pub fn all_changes() -> Self {
        StateCondition::Filter {
            to: None,
            from: None,
            all_changes: true,
        }
    }

    /// Fire when the new state equals `to`
    pub fn to(to: impl Into<StateValue>) -> Self {
        Self::transition(Some(to), None::<StateValue>)
    }

    /// Fire on a transition with optional `to`/`from` filters
    pub fn transition<T, F>(to: Option<T>, from: Option<F>) -> Self
    where
        T: Into<StateValue>,
        F: Into<StateValue>,
    {
        StateCondition::Filter {
            to: to.map(Into::into),
            from: from.map(Into::into),
            all_changes: false,
        }
    }

    /// Fire when a predicate over `(new, old)` holds
    pub fn when<P>(predicate: P) -> Self
    where
        P: Fn(&EntityState, Option<&EntityState>) -> bool + Send + Sync + 'static,
    {
        StateCondition::Predicate(Arc::new(predicate))
    }

    /// Fire when the new state is numeric and satisfies `predicate`
    ///
    /// Missing or non-numeric states (e.g. "unavailable") never match.
    pub fn numeric<P>(predicate: P) -> Self
    where
        P: Fn(f64) -> bool + Send + Sync + 'static,
    {
        Self::when(move |new, _| new.numeric_state().is_some_and(&predicate))
    }

    fn accepts(&self, change: &StateChangedData) -> bool {
        let new = &change.new_state;
        let old = change.old_state.as_ref();

        match self {
            StateCondition::Filter {
                to,
                from,
                all_changes,
            } => {
                if let Some(to) = to {
                    if !new.state.loosely_equals(to) {
                        return false;
                    }
                }
                if let Some(from) = from {
                    if !old.is_some_and(|old| old.state.loosely_equals(from)) {
                        return false;
                    }
                }
                *all_changes || change.state_changed()
            }
            StateCondition::Predicate(predicate) => {
                match catch_unwind(AssertUnwindSafe(|| predicate(new, old))) {
                    Ok(matched) => matched,
                    Err(_) => {
                        warn!(
                            entity_id = %change.entity_id,
                            "State predicate panicked, treating as no match"
                        );
                        false
                    }
                }
            }
        }
    }
}

impl Default for StateCondition {
    fn default() -> Self {
        Self::any_change()
    }
}

impl fmt::Debug for StateCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateCondition::Filter {
                to,
                from,
                all_changes,
            } => f
                .debug_struct("Filter")
                .field("to", to)
                .field("from", from)
                .field("all_changes", all_changes)
                .finish(),
            StateCondition::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Filter of a state listener
#[derive(Debug, Clone)]
pub struct StateFilter {
    pub pattern: EntityPattern,
    pub condition: StateCondition,
}

impl StateFilter {
    pub fn new(pattern: EntityPattern, condition: StateCondition) -> Self {
        Self { pattern, condition }
    }
}

impl Matcher<StateChangedData> for StateFilter {
    fn matches(&self, change: &StateChangedData) -> bool {
        if !self.pattern.matches(&change.entity_id) {
            return false;
        }
        let matched = self.condition.accepts(change);
        trace!(pattern = %self.pattern, entity_id = %change.entity_id, matched, "Evaluated state filter");
        matched
    }
}

/// Filter of an event listener
#[derive(Clone)]
pub enum EventPattern {
    /// Every event (`*`)
    Any,
    /// Events with this event type
    Named(String),
    /// Events with any of these event types
    Names(Vec<String>),
    /// Events accepted by a predicate
    Predicate(EventPredicate),
}

impl EventPattern {
    /// Match events by type; `*` matches every event
    pub fn named(name: &str) -> RegistrationResult<Self> {
        match name.trim() {
            "" => Err(RegistrationError::EmptyEventName),
            events::MATCH_ALL => Ok(EventPattern::Any),
            name => Ok(EventPattern::Named(name.to_string())),
        }
    }

    /// Match any of several event types; a `*` among them matches every event
    pub fn names<I, S>(names: I) -> RegistrationResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut patterns = names
            .into_iter()
            .map(|name| Self::named(name.as_ref()))
            .collect::<RegistrationResult<Vec<_>>>()?;
        if patterns.iter().any(|p| matches!(p, EventPattern::Any)) {
            return Ok(EventPattern::Any);
        }
        if patterns.len() == 1 {
            return patterns.pop().ok_or(RegistrationError::EmptyEventName);
        }
        let names: Vec<String> = patterns
            .into_iter()
            .filter_map(|p| match p {
                EventPattern::Named(name) => Some(name),
                _ => None,
            })
            .collect();
        if names.is_empty() {
            return Err(RegistrationError::EmptyEventName);
        }
        Ok(EventPattern::Names(names))
    }

    pub fn when<P>(predicate: P) -> Self
    where
        P: Fn(&HubEvent) -> bool + Send + Sync + 'static,
    {
        EventPattern::Predicate(Arc::new(predicate))
    }
}

impl fmt::Debug for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPattern::Any => f.write_str("Any"),
            EventPattern::Named(name) => f.debug_tuple("Named").field(name).finish(),
            EventPattern::Names(names) => f.debug_tuple("Names").field(names).finish(),
            EventPattern::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

impl Matcher<HubEvent> for EventPattern {
    fn matches(&self, event: &HubEvent) -> bool {
        match self {
            EventPattern::Any => true,
            EventPattern::Named(name) => &event.event_type == name,
            EventPattern::Names(names) => names.iter().any(|name| &event.event_type == name),
            EventPattern::Predicate(predicate) => {
                catch_unwind(AssertUnwindSafe(|| predicate(event))).unwrap_or_else(|_| {
                    warn!(
                        event_type = %event.event_type,
                        "Event predicate panicked, treating as no match"
                    );
                    false
                })
            }
        }
    }
}

/// Filter of a service call listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceCallFilter {
    pub domain: String,
    pub service: String,
}

impl ServiceCallFilter {
    pub fn new(domain: impl Into<String>, service: impl Into<String>) -> RegistrationResult<Self> {
        let domain = domain.into();
        let service = service.into();
        if domain.trim().is_empty() || service.trim().is_empty() {
            return Err(RegistrationError::EmptyServiceFilter);
        }
        Ok(Self { domain, service })
    }
}

impl Matcher<ServiceCall> for ServiceCallFilter {
    fn matches(&self, call: &ServiceCall) -> bool {
        call.domain == self.domain && call.service == self.service
    }
}
