//! Cancellable waits on state conditions
//!
//! A [`DelayResult`] resolves `true` when its transient state listener first
//! matches, or `false` when it is cancelled, dropped or the daemon stops.
//! Settlement is first-writer-wins: exactly one outcome is ever observed, and
//! the transient listener is removed on either path.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use dashmap::DashMap;
use hd_listeners::{ListenerId, ListenerRegistry, RegistrationResult, SharedListenerRegistry, StateFilter};
use tokio::sync::watch;
use tracing::{debug, trace};

#[derive(Default)]
struct SettleState {
    listener: Option<ListenerId>,
    outcome: Option<bool>,
}

/// Outcome cell shared by a DelayResult, its listener and the tracker
pub(crate) struct Settlement {
    id: u64,
    state: Mutex<SettleState>,
    outcome_tx: watch::Sender<Option<bool>>,
    registry: Weak<ListenerRegistry>,
    tracker: Weak<DelayTracker>,
}

impl Settlement {
    fn lock(&self) -> MutexGuard<'_, SettleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Settle with `value`; false if an outcome was already recorded
    pub(crate) fn settle(&self, value: bool) -> bool {
        let listener = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                return false;
            }
            state.outcome = Some(value);
            state.listener.take()
        };

        if let (Some(id), Some(registry)) = (listener, self.registry.upgrade()) {
            registry.cancel(id);
        }
        if let Some(tracker) = self.tracker.upgrade() {
            tracker.pending.remove(&self.id);
        }
        self.outcome_tx.send_replace(Some(value));
        debug!(delay_id = self.id, outcome = value, "Delay settled");
        true
    }

    /// Attach the transient listener, removing it at once if already settled
    fn bind(&self, listener: ListenerId) {
        let settled = {
            let mut state = self.lock();
            if state.outcome.is_some() {
                true
            } else {
                state.listener = Some(listener);
                false
            }
        };

        if settled {
            if let Some(registry) = self.registry.upgrade() {
                registry.cancel(listener);
            }
        }
    }

    fn outcome(&self) -> Option<bool> {
        self.lock().outcome
    }
}

/// Outstanding delays, settled `false` on shutdown
#[derive(Default)]
pub struct DelayTracker {
    pending: DashMap<u64, Arc<Settlement>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl DelayTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transient listener for `filter` and return its DelayResult
    pub fn delay_until(
        self: &Arc<Self>,
        registry: &SharedListenerRegistry,
        filter: StateFilter,
    ) -> RegistrationResult<DelayResult> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let settlement = Arc::new(Settlement {
            id,
            state: Mutex::new(SettleState::default()),
            outcome_tx,
            registry: Arc::downgrade(registry),
            tracker: Arc::downgrade(self),
        });
        self.pending.insert(id, settlement.clone());

        let weak = Arc::downgrade(&settlement);
        let registered = registry.register_state(filter, move |change| {
            if let Some(settlement) = weak.upgrade() {
                trace!(delay_id = settlement.id, entity_id = %change.entity_id, "Delay condition met");
                settlement.settle(true);
            }
            async { Ok(()) }
        });

        let listener = match registered {
            Ok(listener) => listener,
            Err(e) => {
                self.pending.remove(&id);
                return Err(e);
            }
        };
        settlement.bind(listener);

        // Shutdown may have swept the tracker before this delay was inserted
        if self.closed.load(Ordering::SeqCst) {
            settlement.settle(false);
        }

        debug!(delay_id = id, listener_id = %listener, "Delay registered");
        Ok(DelayResult {
            settlement,
            outcome_rx,
        })
    }

    /// Settle every outstanding delay `false`, returning how many were pending
    pub fn settle_all(&self) -> usize {
        let pending: Vec<Arc<Settlement>> =
            self.pending.iter().map(|entry| entry.value().clone()).collect();
        pending.iter().filter(|s| s.settle(false)).count()
    }

    /// Settle everything and make later delays resolve `false` immediately
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        self.settle_all()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Awaitable outcome of a delay-until-condition wait
///
/// Dropping an unsettled DelayResult cancels it.
pub struct DelayResult {
    settlement: Arc<Settlement>,
    outcome_rx: watch::Receiver<Option<bool>>,
}

impl DelayResult {
    /// Wait for the outcome: true when the condition was met, false when cancelled
    pub async fn wait(&self) -> bool {
        let mut rx = self.outcome_rx.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => *outcome,
            Err(_) => self.settlement.outcome(),
        };
        outcome.unwrap_or(false)
    }

    /// Cancel the wait; returns false if it had already settled
    pub fn cancel(&self) -> bool {
        self.settlement.settle(false)
    }

    /// Outcome if settled
    pub fn outcome(&self) -> Option<bool> {
        self.settlement.outcome()
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }
}

impl Drop for DelayResult {
    fn drop(&mut self) {
        if self.settlement.settle(false) {
            trace!(delay_id = self.settlement.id, "Delay cancelled on drop");
        }
    }
}

impl fmt::Debug for DelayResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayResult")
            .field("id", &self.settlement.id)
            .field("outcome", &self.outcome())
            .finish()
    }
}
