//! Listener registry and pattern matching for hassdaemon
//!
//! # Key Types
//!
//! - [`ListenerRegistry`] - Ordered arena of state, event and service call listeners
//! - [`StateFilter`] - Entity pattern plus a transition condition
//! - [`EventPattern`] - Event name or predicate
//! - [`ServiceCallFilter`] - Domain and service of observed service calls
//! - [`ListenerId`] - Never-reused registration id
//!
//! Matching listeners receive payloads on their own worker task, one at a
//! time and in dispatch order.

mod error;
mod listener;
mod pattern;
mod registry;

pub use error::{RegistrationError, RegistrationResult};
pub use listener::{
    callback, panic_message, Callback, CallbackFuture, Delivery, Listener, ListenerId,
};
pub use pattern::{
    EntityPattern, EventPattern, EventPredicate, Matcher, ServiceCallFilter, StateCondition,
    StateFilter, StatePredicate,
};
pub use registry::{
    EventListener, ListenerKind, ListenerRegistry, ServiceCallListener, SharedListenerRegistry,
    StateListener,
};
