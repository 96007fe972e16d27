//! Test harness for daemon integration tests
//!
//! Wraps a [`DaemonHost`] connected to a [`MemoryHub`] with helpers for
//! driving state changes and collecting callback output.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use hd_config::DaemonConfig;
use hd_core::{Attributes, EntityId, StateChangedData, StateValue};
use hd_daemon::{DaemonHost, MemoryHub};
use tokio::sync::mpsc;

pub const WAIT: Duration = Duration::from_secs(5);

/// A started daemon on an in-process hub
pub struct TestDaemon {
    pub hub: Arc<MemoryHub>,
    pub host: Arc<DaemonHost>,
}

impl TestDaemon {
    /// Create a daemon without starting it
    pub fn new() -> Self {
        let hub = Arc::new(MemoryHub::new());
        let mut config = DaemonConfig::default();
        config.hub.token = "test-token".to_string();
        config.daemon.stop_timeout_secs = 2;
        let host = Arc::new(DaemonHost::new(hub.clone(), config));
        Self { hub, host }
    }

    pub async fn started() -> Self {
        let daemon = Self::new();
        tokio_test::assert_ok!(daemon.host.start().await);
        daemon
    }

    /// Announce a state change from the hub
    pub fn push_state(&self, entity_id: &str, state: impl Into<StateValue>) -> StateChangedData {
        self.push_state_with(entity_id, state, Attributes::new())
    }

    pub fn push_state_with(
        &self,
        entity_id: &str,
        state: impl Into<StateValue>,
        attributes: Attributes,
    ) -> StateChangedData {
        self.hub.push_state(&id(entity_id), state, attributes)
    }

    /// Assert the local store holds `expected` for an entity
    pub fn assert_state(&self, entity_id: &str, expected: impl Into<StateValue>) {
        let expected = expected.into();
        let actual = self.host.get_state(entity_id).map(|s| s.state);
        assert_eq!(
            actual.as_ref(),
            Some(&expected),
            "Expected entity {entity_id} to be in state {expected}, but was {actual:?}"
        );
    }
}

pub fn id(entity_id: &str) -> EntityId {
    entity_id.parse().expect("invalid entity id")
}

pub fn attrs(pairs: &[(&str, i64)]) -> Attributes {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), StateValue::from(*v)))
        .collect()
}

/// Receive the next value or fail after [`WAIT`]
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for callback")
        .expect("callback channel closed")
}

/// Receive exactly `n` values, then assert nothing else is queued
pub async fn recv_exactly<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, n: usize) -> Vec<T> {
    let mut values = Vec::with_capacity(n);
    for _ in 0..n {
        values.push(recv(rx).await);
    }
    if let Ok(extra) = rx.try_recv() {
        panic!("unexpected extra callback: {extra:?}");
    }
    values
}
