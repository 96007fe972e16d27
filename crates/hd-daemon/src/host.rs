//! Application-facing daemon host
//!
//! `DaemonHost` wires the transport, state store, listener registry,
//! delay tracker and scheduler together and exposes the API automations
//! are written against.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use hd_config::DaemonConfig;
use hd_core::{Attributes, EntityId, EntityState, HubEvent, ServiceCall, StateChangedData, StateValue};
use hd_listeners::{
    EntityPattern, EventPattern, ListenerId, ListenerRegistry, RegistrationResult,
    ServiceCallFilter, SharedListenerRegistry, StateCondition, StateFilter,
};
use hd_scheduler::{Scheduler, SharedScheduler};
use hd_state_store::{EntityStateStore, SharedStateStore};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::delay::{DelayResult, DelayTracker};
use crate::dispatch::Dispatcher;
use crate::error::{DaemonError, DaemonResult};
use crate::fluent::{EntitySelection, EventSelection, ScriptAction, TimerSelection};
use crate::transport::{HubMessageStream, SharedHubClient};

/// Lifecycle of a host; a stopped host is never restarted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    Running,
    Stopped,
}

/// The reactive automation host
pub struct DaemonHost {
    client: SharedHubClient,
    config: DaemonConfig,
    store: SharedStateStore,
    registry: SharedListenerRegistry,
    scheduler: SharedScheduler,
    delays: Arc<DelayTracker>,
    state: Arc<watch::Sender<HostState>>,
    shutdown_tx: broadcast::Sender<()>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl DaemonHost {
    pub fn new(client: SharedHubClient, config: DaemonConfig) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            client,
            config,
            store: Arc::new(EntityStateStore::new()),
            registry: Arc::new(ListenerRegistry::new()),
            scheduler: Arc::new(Scheduler::new()),
            delays: Arc::new(DelayTracker::new()),
            state: Arc::new(watch::Sender::new(HostState::Created)),
            shutdown_tx,
            loop_task: Mutex::new(None),
        }
    }

    /// Connect, seed the state store and spawn the dispatch loop
    pub async fn start(&self) -> DaemonResult<()> {
        let mut previous = HostState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == HostState::Created {
                *state = HostState::Running;
                true
            } else {
                false
            }
        });
        match previous {
            HostState::Created => {}
            HostState::Running => return Err(DaemonError::AlreadyRunning),
            HostState::Stopped => return Err(DaemonError::Stopped),
        }

        info!(hub = %self.config.hub.websocket_url(), "Starting daemon");
        let shutdown_rx = self.shutdown_tx.subscribe();
        let stream = match self.connect().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "Failed to connect to hub");
                self.state.send_replace(HostState::Created);
                return Err(e);
            }
        };

        let dispatcher = Dispatcher::new(self.store.clone(), self.registry.clone());
        let teardown = self.teardown_parts();
        let state = self.state.clone();
        let handle = tokio::spawn(async move {
            let reason = dispatcher.run(stream, shutdown_rx).await;
            teardown.run();
            state.send_replace(HostState::Stopped);
            info!(?reason, "Daemon stopped");
        });
        *lock(&self.loop_task) = Some(handle);
        Ok(())
    }

    async fn connect(&self) -> DaemonResult<HubMessageStream> {
        let stream = self.client.connect(&self.config.hub).await?;
        let states = self.client.get_states().await?;
        info!(entities = states.len(), "Seeding state store");
        self.store.seed(states);
        Ok(stream)
    }

    /// Start and wait until the dispatch loop stops
    pub async fn run(&self) -> DaemonResult<()> {
        self.start().await?;
        self.stopped().await;
        Ok(())
    }

    /// Wait until the host reaches [`HostState::Stopped`]
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == HostState::Stopped).await;
    }

    /// Stop the dispatch loop and release every listener, delay and timer
    ///
    /// When this returns, every outstanding delay has settled `false` and no
    /// scheduled callback will start again.
    pub async fn stop(&self) {
        let mut previous = HostState::Created;
        self.state.send_if_modified(|state| {
            previous = *state;
            if *state == HostState::Created {
                *state = HostState::Stopped;
                true
            } else {
                false
            }
        });
        match previous {
            HostState::Created => {
                self.teardown_parts().run();
                return;
            }
            HostState::Stopped => return,
            HostState::Running => {}
        }

        info!("Stopping daemon");
        let mut rx = self.state.subscribe();
        let _ = self.shutdown_tx.send(());

        let timeout = self.config.daemon.stop_timeout();
        let stopped = tokio::time::timeout(timeout, rx.wait_for(|s| *s == HostState::Stopped))
            .await
            .is_ok();
        if !stopped {
            warn!(?timeout, "Dispatch loop did not stop in time, aborting it");
            if let Some(handle) = lock(&self.loop_task).take() {
                handle.abort();
            }
            self.teardown_parts().run();
            self.state.send_replace(HostState::Stopped);
        }
    }

    pub fn is_running(&self) -> bool {
        *self.state.borrow() == HostState::Running
    }

    pub fn host_state(&self) -> HostState {
        *self.state.borrow()
    }

    fn teardown_parts(&self) -> Teardown {
        Teardown {
            registry: self.registry.clone(),
            delays: self.delays.clone(),
            scheduler: self.scheduler.clone(),
        }
    }

    /// Call `handler` whenever the state value of an entity matching `pattern` changes
    ///
    /// `pattern` is an entity id, a domain (`light`, `light.*`) or `*`.
    pub fn listen_state<H, Fut>(&self, pattern: &str, handler: H) -> RegistrationResult<ListenerId>
    where
        H: Fn(StateChangedData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.listen_state_with(pattern, StateCondition::any_change(), handler)
    }

    pub fn listen_state_with<H, Fut>(
        &self,
        pattern: &str,
        condition: StateCondition,
        handler: H,
    ) -> RegistrationResult<ListenerId>
    where
        H: Fn(StateChangedData) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let filter = StateFilter::new(EntityPattern::parse(pattern)?, condition);
        self.registry.register_state(filter, handler)
    }

    /// Cancel a state listener; unknown ids are ignored
    pub fn cancel_listen_state(&self, id: ListenerId) -> bool {
        self.registry.cancel(id)
    }

    /// Cancel a listener of any kind
    pub fn cancel_listener(&self, id: ListenerId) -> bool {
        self.registry.cancel(id)
    }

    /// Call `handler` for events of type `event_type` (`*` for all)
    pub fn listen_event<H, Fut>(&self, event_type: &str, handler: H) -> RegistrationResult<ListenerId>
    where
        H: Fn(HubEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.register_event(EventPattern::named(event_type)?, handler)
    }

    pub fn listen_event_when<P, H, Fut>(&self, predicate: P, handler: H) -> RegistrationResult<ListenerId>
    where
        P: Fn(&HubEvent) -> bool + Send + Sync + 'static,
        H: Fn(HubEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry.register_event(EventPattern::when(predicate), handler)
    }

    /// Call `handler` whenever the hub reports a call of `domain.service`
    pub fn listen_service_call<H, Fut>(
        &self,
        domain: &str,
        service: &str,
        handler: H,
    ) -> RegistrationResult<ListenerId>
    where
        H: Fn(ServiceCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.registry
            .register_service_call(ServiceCallFilter::new(domain, service)?, handler)
    }

    /// Wait until one of `entity_ids` changes with the given filters
    pub fn delay_until_state_change<I, S>(
        &self,
        entity_ids: I,
        to: Option<StateValue>,
        from: Option<StateValue>,
        all_changes: bool,
    ) -> RegistrationResult<DelayResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let condition = StateCondition::Filter {
            to,
            from,
            all_changes,
        };
        let filter = StateFilter::new(EntityPattern::entities(entity_ids)?, condition);
        self.delays.delay_until(&self.registry, filter)
    }

    /// Wait until a change of one of `entity_ids` satisfies `predicate(new, old)`
    pub fn delay_until_state_predicate<I, S, P>(
        &self,
        entity_ids: I,
        predicate: P,
    ) -> RegistrationResult<DelayResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        P: Fn(&EntityState, Option<&EntityState>) -> bool + Send + Sync + 'static,
    {
        let filter = StateFilter::new(
            EntityPattern::entities(entity_ids)?,
            StateCondition::when(predicate),
        );
        self.delays.delay_until(&self.registry, filter)
    }

    pub fn get_state(&self, entity_id: &str) -> Option<EntityState> {
        self.store.get(entity_id)
    }

    pub fn states(&self) -> Vec<EntityState> {
        self.store.all()
    }

    pub fn store(&self) -> &SharedStateStore {
        &self.store
    }

    pub fn registry(&self) -> &SharedListenerRegistry {
        &self.registry
    }

    pub fn scheduler(&self) -> &SharedScheduler {
        &self.scheduler
    }

    pub fn client(&self) -> &SharedHubClient {
        &self.client
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    /// Ask the hub to set an entity state
    ///
    /// The local store is not written here; it follows the hub's state change.
    #[instrument(skip(self, state, attributes))]
    pub async fn set_state(
        &self,
        entity_id: &str,
        state: impl Into<StateValue>,
        attributes: Attributes,
    ) -> DaemonResult<Option<EntityState>> {
        let entity_id = entity_id.parse()?;
        let stored = self
            .client
            .set_state(&entity_id, state.into(), attributes)
            .await?;
        Ok(stored)
    }

    #[instrument(skip(self, data))]
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Option<serde_json::Value>,
    ) -> DaemonResult<()> {
        debug!("Calling service");
        self.client.call_service(domain, service, data, false).await?;
        Ok(())
    }

    /// Call a service and wait for the hub to confirm it ran
    #[instrument(skip(self, data))]
    pub async fn call_service_and_wait(
        &self,
        domain: &str,
        service: &str,
        data: Option<serde_json::Value>,
    ) -> DaemonResult<()> {
        self.client.call_service(domain, service, data, true).await?;
        Ok(())
    }

    /// Announce `message` on a media player through the configured TTS service
    #[instrument(skip(self, message))]
    pub async fn speak(&self, entity_id: &str, message: &str) -> DaemonResult<()> {
        let entity_id: EntityId = entity_id.parse()?;
        let (domain, service) = self
            .config
            .daemon
            .tts_parts()
            .ok_or_else(|| DaemonError::InvalidTtsService(self.config.daemon.tts_service.clone()))?;
        let data = serde_json::json!({
            "entity_id": entity_id.to_string(),
            "message": message,
        });
        self.call_service(domain, service, Some(data)).await
    }

    #[instrument(skip(self, data))]
    pub async fn send_event(
        &self,
        event_type: &str,
        data: Option<serde_json::Value>,
    ) -> DaemonResult<bool> {
        Ok(self.client.send_event(event_type, data).await?)
    }

    /// Start a fluent automation triggered by these entities
    pub fn entity<I, S>(&self, entity_ids: I) -> EntitySelection<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        EntitySelection::new(self, entity_ids)
    }

    /// Start a fluent automation over the current entities accepted by `predicate`
    pub fn entities_where<P>(&self, predicate: P) -> EntitySelection<'_>
    where
        P: Fn(&EntityState) -> bool,
    {
        EntitySelection::matching(self, predicate)
    }

    /// Start a fluent automation triggered by events of this type
    pub fn event(&self, event_type: &str) -> EventSelection<'_> {
        EventSelection::new(self, EventPattern::named(event_type))
    }

    /// Start a fluent automation triggered by any of these event types
    pub fn events<I, S>(&self, event_types: I) -> EventSelection<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        EventSelection::new(self, EventPattern::names(event_types))
    }

    pub fn events_when<P>(&self, predicate: P) -> EventSelection<'_>
    where
        P: Fn(&HubEvent) -> bool + Send + Sync + 'static,
    {
        EventSelection::new(self, Ok(EventPattern::when(predicate)))
    }

    /// Run scripts by id (`script.<name>` or `<name>`)
    pub fn run_script<I, S>(&self, script_ids: I) -> ScriptAction<'_>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ScriptAction::new(self, script_ids)
    }

    /// Start a fluent automation triggered by time
    pub fn timer(&self) -> TimerSelection<'_> {
        TimerSelection::new(self)
    }
}

/// Everything released when the dispatch loop stops
struct Teardown {
    registry: SharedListenerRegistry,
    delays: Arc<DelayTracker>,
    scheduler: SharedScheduler,
}

impl Teardown {
    fn run(&self) {
        let listeners = self.registry.close();
        let delays = self.delays.close();
        let tasks = self.scheduler.close();
        info!(listeners, delays, tasks, "Released daemon resources");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;
    use crate::transport::TransportError;

    fn host() -> (Arc<MemoryHub>, DaemonHost) {
        let hub = Arc::new(MemoryHub::new());
        let host = DaemonHost::new(hub.clone(), DaemonConfig::default());
        (hub, host)
    }

    #[tokio::test]
    async fn test_lifecycle() {
        let (_hub, host) = host();
        assert_eq!(host.host_state(), HostState::Created);

        host.start().await.unwrap();
        assert!(host.is_running());
        assert!(matches!(host.start().await, Err(DaemonError::AlreadyRunning)));

        host.stop().await;
        assert_eq!(host.host_state(), HostState::Stopped);
        assert!(matches!(host.start().await, Err(DaemonError::Stopped)));
        assert!(host.registry().is_closed());
    }

    #[tokio::test]
    async fn test_failed_connect_allows_retry() {
        let (hub, host) = host();
        hub.set_online(false);
        assert!(matches!(
            host.start().await,
            Err(DaemonError::Transport(TransportError::Disconnected(_)))
        ));
        assert_eq!(host.host_state(), HostState::Created);

        hub.set_online(true);
        host.start().await.unwrap();
        host.stop().await;
    }

    #[tokio::test]
    async fn test_start_seeds_store() {
        let (hub, host) = host();
        let id = "sun.sun".parse().unwrap();
        hub.seed_state(EntityState::new(id, "above_horizon", Attributes::new()));

        host.start().await.unwrap();
        assert_eq!(host.states().len(), 1);
        assert!(host.store().is_state("sun.sun", "above_horizon"));
        host.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_registrations() {
        let (_hub, host) = host();
        assert!(host.listen_state("Not Valid", |_| async { Ok(()) }).is_err());
        assert!(host.listen_event("", |_| async { Ok(()) }).is_err());
        assert!(host.listen_service_call("light", "", |_| async { Ok(()) }).is_err());
        assert!(host
            .delay_until_state_change(Vec::<&str>::new(), None, None, false)
            .is_err());
        assert!(matches!(
            host.set_state("bad id", "on", Attributes::new()).await,
            Err(DaemonError::InvalidEntityId(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_before_start_releases_everything() {
        let (_hub, host) = host();
        let delay = host
            .delay_until_state_change(["light.a"], Some("on".into()), None, false)
            .unwrap();

        host.stop().await;
        assert_eq!(delay.outcome(), Some(false));
        assert!(host.registry().is_closed());
        assert!(host.scheduler().is_closed());
    }
}
