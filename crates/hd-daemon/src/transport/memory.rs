//! In-process hub
//!
//! `MemoryHub` stands in for a real hub connection. Messages pushed into it
//! reach the daemon in order, outbound calls are recorded, and outbound calls
//! are echoed back the way a hub reports them: `set_state` as a state change,
//! `call_service` as a service call and `send_event` as an event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::channel::mpsc;
use futures::StreamExt;
use hd_config::HubConfig;
use hd_core::{
    Attributes, EntityId, EntityState, HubEvent, HubMessage, ServiceCall, StateChangedData,
    StateValue,
};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{HubClient, HubMessageStream, TransportError, TransportResult};

/// Outbound call recorded by [`MemoryHub`]
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundCall {
    SetState {
        entity_id: EntityId,
        state: StateValue,
        attributes: Attributes,
    },
    CallService {
        domain: String,
        service: String,
        data: Option<Value>,
        wait_for_response: bool,
    },
    SendEvent {
        event_type: String,
        data: Option<Value>,
    },
}

impl OutboundCall {
    /// `domain.service` for service calls
    pub fn service_id(&self) -> Option<String> {
        match self {
            OutboundCall::CallService {
                domain, service, ..
            } => Some(format!("{domain}.{service}")),
            _ => None,
        }
    }
}

/// Hub living in the same process as the daemon
pub struct MemoryHub {
    sender: Mutex<Option<mpsc::UnboundedSender<HubMessage>>>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<HubMessage>>>,
    states: DashMap<String, EntityState>,
    calls: Mutex<Vec<OutboundCall>>,
    call_count: watch::Sender<usize>,
    online: AtomicBool,
}

impl MemoryHub {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded();
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(Some(rx)),
            states: DashMap::new(),
            calls: Mutex::new(Vec::new()),
            call_count: watch::Sender::new(0),
            online: AtomicBool::new(true),
        }
    }

    /// Store a hub-side state without announcing it, as if it existed before connect
    pub fn seed_state(&self, state: EntityState) {
        self.states.insert(state.entity_id.to_string(), state);
    }

    /// Queue a message for the daemon; false once the stream is closed
    pub fn push(&self, message: impl Into<HubMessage>) -> bool {
        let message = message.into();
        trace!(kind = message.kind(), "Memory hub pushing message");
        match lock(&self.sender).as_ref() {
            Some(tx) => tx.unbounded_send(message).is_ok(),
            None => false,
        }
    }

    /// Change a hub-side state and announce the transition
    pub fn push_state(
        &self,
        entity_id: &EntityId,
        state: impl Into<StateValue>,
        attributes: Attributes,
    ) -> StateChangedData {
        let key = entity_id.to_string();
        let old = self.states.get(&key).map(|s| s.value().clone());
        let new = match &old {
            Some(old) => old.with_update(state, attributes),
            None => EntityState::new(entity_id.clone(), state, attributes),
        };
        self.states.insert(key, new.clone());

        let change = StateChangedData::new(old, new);
        self.push(change.clone());
        change
    }

    /// Fire an event from the hub side
    pub fn push_event(&self, event_type: &str, data: Value) {
        self.push(HubEvent::new(event_type, data));
    }

    /// End the inbound stream, as a dropped connection would
    pub fn close(&self) {
        debug!("Memory hub closing stream");
        lock(&self.sender).take();
    }

    /// While offline every outbound call fails with `Disconnected`
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Hub-side view of an entity
    pub fn state(&self, entity_id: &str) -> Option<EntityState> {
        self.states.get(entity_id).map(|s| s.value().clone())
    }

    /// Outbound calls received so far, in order
    pub fn calls(&self) -> Vec<OutboundCall> {
        lock(&self.calls).clone()
    }

    /// Wait until at least `count` outbound calls were received
    pub async fn wait_for_calls(&self, count: usize) -> Vec<OutboundCall> {
        let mut rx = self.call_count.subscribe();
        // The sender lives in self, so the channel cannot close while awaited
        let _ = rx.wait_for(|n| *n >= count).await;
        self.calls()
    }

    fn ensure_online(&self) -> TransportResult<()> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Disconnected("memory hub is offline".to_string()))
        }
    }

    fn record(&self, call: OutboundCall) {
        trace!(?call, "Memory hub recorded call");
        lock(&self.calls).push(call);
        self.call_count.send_modify(|n| *n += 1);
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HubClient for MemoryHub {
    async fn connect(&self, config: &HubConfig) -> TransportResult<HubMessageStream> {
        self.ensure_online()?;
        let rx = lock(&self.receiver)
            .take()
            .ok_or_else(|| TransportError::Protocol("memory hub stream already taken".into()))?;
        debug!(url = %config.websocket_url(), "Memory hub connected");
        Ok(rx.boxed())
    }

    async fn get_states(&self) -> TransportResult<Vec<EntityState>> {
        self.ensure_online()?;
        Ok(self.states.iter().map(|s| s.value().clone()).collect())
    }

    async fn set_state(
        &self,
        entity_id: &EntityId,
        state: StateValue,
        attributes: Attributes,
    ) -> TransportResult<Option<EntityState>> {
        self.ensure_online()?;
        self.record(OutboundCall::SetState {
            entity_id: entity_id.clone(),
            state: state.clone(),
            attributes: attributes.clone(),
        });
        let change = self.push_state(entity_id, state, attributes);
        Ok(Some(change.new_state))
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<Value>,
        wait_for_response: bool,
    ) -> TransportResult<()> {
        self.ensure_online()?;
        self.record(OutboundCall::CallService {
            domain: domain.to_string(),
            service: service.to_string(),
            data: data.clone(),
            wait_for_response,
        });
        self.push(ServiceCall::new(domain, service, data.unwrap_or(Value::Null)));
        Ok(())
    }

    async fn send_event(&self, event_type: &str, data: Option<Value>) -> TransportResult<bool> {
        self.ensure_online()?;
        self.record(OutboundCall::SendEvent {
            event_type: event_type.to_string(),
            data: data.clone(),
        });
        Ok(self.push(HubEvent::new(event_type, data.unwrap_or(Value::Null))))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn id(s: &str) -> EntityId {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_stream_delivers_in_order_and_ends_on_close() {
        let hub = MemoryHub::new();
        hub.push_state(&id("light.kitchen"), "on", Attributes::new());
        hub.push_event("custom", json!({"n": 1}));

        let mut stream = hub.connect(&HubConfig::default()).await.unwrap();
        hub.close();

        assert!(matches!(stream.next().await, Some(HubMessage::StateChanged(_))));
        assert!(matches!(stream.next().await, Some(HubMessage::Event(_))));
        assert!(stream.next().await.is_none());
        assert!(!hub.push(HubEvent::new("late", Value::Null)));
    }

    #[tokio::test]
    async fn test_second_connect_is_protocol_error() {
        let hub = MemoryHub::new();
        let _stream = hub.connect(&HubConfig::default()).await.unwrap();
        let second = hub.connect(&HubConfig::default()).await;
        assert!(matches!(second, Err(TransportError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_push_state_tracks_old_state() {
        let hub = MemoryHub::new();
        let first = hub.push_state(&id("switch.fan"), "off", Attributes::new());
        let second = hub.push_state(&id("switch.fan"), "on", Attributes::new());

        assert!(first.old_state.is_none());
        assert_eq!(second.old_state.unwrap().state, StateValue::from("off"));
        assert_eq!(hub.state("switch.fan").unwrap().state, StateValue::from("on"));
    }

    #[tokio::test]
    async fn test_offline_calls_fail_and_are_not_recorded() {
        let hub = MemoryHub::new();
        hub.set_online(false);

        let result = hub.call_service("light", "turn_on", None, false).await;
        assert!(matches!(result, Err(TransportError::Disconnected(_))));
        assert!(hub.calls().is_empty());

        hub.set_online(true);
        hub.call_service("light", "turn_on", None, false).await.unwrap();
        assert_eq!(hub.calls()[0].service_id().as_deref(), Some("light.turn_on"));
    }

    #[tokio::test]
    async fn test_set_state_echoes_state_change() {
        let hub = MemoryHub::new();
        let mut stream = hub.connect(&HubConfig::default()).await.unwrap();

        let stored = hub
            .set_state(&id("input_boolean.guest"), StateValue::Bool(true), Attributes::new())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, StateValue::Bool(true));

        match stream.next().await {
            Some(HubMessage::StateChanged(change)) => {
                assert_eq!(change.entity_id.to_string(), "input_boolean.guest");
            }
            other => panic!("expected state change, got {other:?}"),
        }
        assert_eq!(hub.wait_for_calls(1).await.len(), 1);
    }
}
