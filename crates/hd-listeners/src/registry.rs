//! Listener registry
//!
//! Holds every active state, event and service call listener in registration
//! order. Readers take snapshots, so callbacks may register or cancel
//! listeners while a dispatch is iterating without affecting that dispatch.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use hd_core::{HubEvent, ServiceCall, StateChangedData};
use indexmap::IndexMap;
use tracing::{debug, info, instrument};

use crate::error::{RegistrationError, RegistrationResult};
use crate::listener::{callback, Delivery, Listener, ListenerId};
use crate::pattern::{EventPattern, Matcher, ServiceCallFilter, StateFilter};

/// Listener watching entity state changes
pub type StateListener = Listener<StateFilter, StateChangedData>;

/// Listener watching hub events
pub type EventListener = Listener<EventPattern, HubEvent>;

/// Listener watching service call notifications
pub type ServiceCallListener = Listener<ServiceCallFilter, ServiceCall>;

/// The three listener kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    State,
    Event,
    ServiceCall,
}

/// Insertion-ordered entries of one listener kind
struct ListenerTable<F, A> {
    entries: RwLock<IndexMap<ListenerId, Arc<Listener<F, A>>>>,
}

impl<F, A> ListenerTable<F, A>
where
    F: Matcher<A>,
    A: Delivery,
{
    fn new() -> Self {
        Self {
            entries: RwLock::new(IndexMap::new()),
        }
    }

    fn insert(&self, listener: Listener<F, A>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(listener.id(), Arc::new(listener));
    }

    fn remove(&self, id: ListenerId) -> Option<Arc<Listener<F, A>>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.shift_remove(&id)
    }

    fn drain(&self) -> Vec<Arc<Listener<F, A>>> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.drain(..).map(|(_, listener)| listener).collect()
    }

    fn snapshot(&self) -> Vec<Arc<Listener<F, A>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn contains(&self, id: ListenerId) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }
}

/// Registry of all active listeners
///
/// The ListenerRegistry is responsible for:
/// - Handing out never-reused listener ids
/// - Registering and cancelling listeners from any thread or callback
/// - Providing ordered snapshots to the dispatch loop
pub struct ListenerRegistry {
    state: ListenerTable<StateFilter, StateChangedData>,
    event: ListenerTable<EventPattern, HubEvent>,
    service_call: ListenerTable<ServiceCallFilter, ServiceCall>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self {
            state: ListenerTable::new(),
            event: ListenerTable::new(),
            service_call: ListenerTable::new(),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn next_listener_id(&self) -> RegistrationResult<ListenerId> {
        if self.is_closed() {
            return Err(RegistrationError::Closed);
        }
        Ok(ListenerId::new(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }

    /// Register a state listener
    #[instrument(skip(self, filter, handler), fields(pattern = %filter.pattern))]
    pub fn register_state<H, Fut>(&self, filter: StateFilter, handler: H) -> RegistrationResult<ListenerId>
    where
        H: Fn(StateChangedData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_listener_id()?;
        debug!(listener_id = %id, condition = ?filter.condition, "Registering state listener");
        self.admit(&self.state, Listener::new(id, filter, callback(handler)))
    }

    /// Register an event listener
    #[instrument(skip(self, pattern, handler))]
    pub fn register_event<H, Fut>(&self, pattern: EventPattern, handler: H) -> RegistrationResult<ListenerId>
    where
        H: Fn(HubEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_listener_id()?;
        debug!(listener_id = %id, pattern = ?pattern, "Registering event listener");
        self.admit(&self.event, Listener::new(id, pattern, callback(handler)))
    }

    /// Register a service call listener
    #[instrument(skip(self, filter, handler), fields(domain = %filter.domain, service = %filter.service))]
    pub fn register_service_call<H, Fut>(
        &self,
        filter: ServiceCallFilter,
        handler: H,
    ) -> RegistrationResult<ListenerId>
    where
        H: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.next_listener_id()?;
        debug!(listener_id = %id, "Registering service call listener");
        self.admit(&self.service_call, Listener::new(id, filter, callback(handler)))
    }

    /// Insert a listener unless the registry closed meanwhile
    fn admit<F, A>(&self, table: &ListenerTable<F, A>, listener: Listener<F, A>) -> RegistrationResult<ListenerId>
    where
        F: Matcher<A>,
        A: Delivery,
    {
        let id = listener.id();
        table.insert(listener);
        if self.is_closed() {
            if let Some(listener) = table.remove(id) {
                listener.retire();
            }
            return Err(RegistrationError::Closed);
        }
        Ok(id)
    }

    /// Cancel a listener of any kind
    ///
    /// Returns false for unknown or already-cancelled ids; that is not an error.
    pub fn cancel(&self, id: ListenerId) -> bool {
        let retired = if let Some(listener) = self.state.remove(id) {
            listener.retire()
        } else if let Some(listener) = self.event.remove(id) {
            listener.retire()
        } else if let Some(listener) = self.service_call.remove(id) {
            listener.retire()
        } else {
            false
        };

        if retired {
            debug!(listener_id = %id, "Cancelled listener");
        }
        retired
    }

    /// Cancel every listener, returning how many were active
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for listener in self.state.drain() {
            count += usize::from(listener.retire());
        }
        for listener in self.event.drain() {
            count += usize::from(listener.retire());
        }
        for listener in self.service_call.drain() {
            count += usize::from(listener.retire());
        }
        count
    }

    /// Cancel everything and reject further registrations
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.cancel_all();
        info!(cancelled = count, "Listener registry closed");
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Snapshot of state listeners in registration order
    pub fn state_listeners(&self) -> Vec<Arc<StateListener>> {
        self.state.snapshot()
    }

    /// Snapshot of event listeners in registration order
    pub fn event_listeners(&self) -> Vec<Arc<EventListener>> {
        self.event.snapshot()
    }

    /// Snapshot of service call listeners in registration order
    pub fn service_call_listeners(&self) -> Vec<Arc<ServiceCallListener>> {
        self.service_call.snapshot()
    }

    /// Number of active listeners of a kind
    pub fn count(&self, kind: ListenerKind) -> usize {
        match kind {
            ListenerKind::State => self.state.len(),
            ListenerKind::Event => self.event.len(),
            ListenerKind::ServiceCall => self.service_call.len(),
        }
    }

    /// Whether a listener is still registered
    pub fn contains(&self, id: ListenerId) -> bool {
        self.state.contains(id) || self.event.contains(id) || self.service_call.contains(id)
    }
}

impl Default for ListenerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for ListenerRegistry
pub type SharedListenerRegistry = Arc<ListenerRegistry>;
