//! Dispatch loop
//!
//! A single task consumes the hub stream in arrival order. Each state change
//! is written to the store before any listener sees it, so callbacks reading
//! the store observe at least that change. Matching is done against a
//! registry snapshot taken per message; callbacks run on listener workers.

use futures::StreamExt;
use hd_core::{HubEvent, HubMessage, ServiceCall, StateChangedData};
use hd_listeners::SharedListenerRegistry;
use hd_state_store::SharedStateStore;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, trace};

use crate::transport::HubMessageStream;

/// Why the loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Shutdown,
    StreamEnded,
}

/// Routes hub messages to the store and matching listeners
#[derive(Clone)]
pub struct Dispatcher {
    store: SharedStateStore,
    registry: SharedListenerRegistry,
}

impl Dispatcher {
    pub fn new(store: SharedStateStore, registry: SharedListenerRegistry) -> Self {
        Self { store, registry }
    }

    /// Consume `stream` until it ends or a shutdown signal arrives
    pub async fn run(
        &self,
        mut stream: HubMessageStream,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> StopReason {
        info!("Dispatch loop started");
        let reason = loop {
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => {
                    info!("Received shutdown signal");
                    break StopReason::Shutdown;
                }
                message = stream.next() => match message {
                    Some(message) => {
                        self.dispatch(message);
                    }
                    None => {
                        info!("Hub stream ended");
                        break StopReason::StreamEnded;
                    }
                },
            }
        };
        info!(?reason, "Dispatch loop stopped");
        reason
    }

    /// Process one message, returning how many listeners it was queued to
    #[instrument(skip_all, fields(kind = message.kind()))]
    pub fn dispatch(&self, message: HubMessage) -> usize {
        let matched = match &message {
            HubMessage::StateChanged(change) => self.dispatch_state(change),
            HubMessage::Event(event) => self.dispatch_event(event),
            HubMessage::ServiceCall(call) => self.dispatch_service_call(call),
        };
        trace!(matched, "Message dispatched");
        matched
    }

    fn dispatch_state(&self, change: &StateChangedData) -> usize {
        self.store.update(change);

        let mut matched = 0;
        for listener in self.registry.state_listeners() {
            if listener.is_live() && listener.offer(change) {
                debug!(
                    listener_id = %listener.id(),
                    entity_id = %change.entity_id,
                    "State listener matched"
                );
                matched += 1;
            }
        }
        matched
    }

    fn dispatch_event(&self, event: &HubEvent) -> usize {
        let mut matched = 0;
        for listener in self.registry.event_listeners() {
            if listener.is_live() && listener.offer(event) {
                debug!(listener_id = %listener.id(), event_type = %event.event_type, "Event listener matched");
                matched += 1;
            }
        }
        matched
    }

    fn dispatch_service_call(&self, call: &ServiceCall) -> usize {
        self.registry
            .service_call_listeners()
            .into_iter()
            .filter(|listener| listener.is_live() && listener.offer(call))
            .count()
    }
}
