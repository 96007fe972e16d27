//! Fluent automation builder
//!
//! ```ignore
//! host.entity(["binary_sensor.hall_pir"])
//!     .state_changed_to("on")
//!     .entity(["light.hall"])
//!     .turn_on()
//!     .with_attribute("transition", 0)
//!     .execute()?;
//!
//! host.timer()
//!     .every(Duration::from_secs(10))
//!     .entity(["light.hall"])
//!     .toggle()
//!     .execute()?;
//!
//! host.events(["doorbell_pressed", "gate_opened"])
//!     .entities_where(|s| s.entity_id.in_domain("light"))
//!     .turn_on()
//!     .execute()?;
//!
//! host.run_script(["goodnight"]).execute().await?;
//! ```
//!
//! Builders only accumulate an [`AutomationSpec`]; nothing is registered
//! until `execute()`. Each action calls `<domain>.<turn_on|turn_off|toggle>`
//! once per target entity with `entity_id` plus the configured attributes.

use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Context;
use hd_core::{EntityId, EntityState, ServiceCall, StateValue};
use hd_listeners::{
    EntityPattern, EventPattern, ListenerId, ListenerRegistry, RegistrationError,
    RegistrationResult, StateCondition, StateFilter,
};
use hd_scheduler::ScheduledHandle;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::error::{DaemonError, DaemonResult};
use crate::host::DaemonHost;
use crate::transport::SharedHubClient;

/// Entity service an action invokes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityAction {
    TurnOn,
    TurnOff,
    Toggle,
}

impl EntityAction {
    pub fn service(&self) -> &'static str {
        match self {
            EntityAction::TurnOn => "turn_on",
            EntityAction::TurnOff => "turn_off",
            EntityAction::Toggle => "toggle",
        }
    }
}

/// One action of an automation
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSpec {
    pub entities: Vec<EntityId>,
    pub action: EntityAction,
    pub attributes: Map<String, Value>,
}

impl ActionSpec {
    /// The service calls this action issues, one per entity
    pub fn service_calls(&self) -> Vec<ServiceCall> {
        self.entities
            .iter()
            .map(|entity_id| {
                let mut data = self.attributes.clone();
                data.insert("entity_id".to_string(), Value::String(entity_id.to_string()));
                ServiceCall::new(entity_id.domain(), self.action.service(), Value::Object(data))
            })
            .collect()
    }
}

/// What starts an automation
#[derive(Debug, Clone)]
pub enum Trigger {
    StateChange {
        pattern: EntityPattern,
        condition: StateCondition,
    },
    Event(EventPattern),
    Every(Duration),
}

/// Immutable description of an automation
#[derive(Debug, Clone)]
pub struct AutomationSpec {
    trigger: Trigger,
    actions: Vec<ActionSpec>,
}

impl AutomationSpec {
    pub fn trigger(&self) -> &Trigger {
        &self.trigger
    }

    pub fn actions(&self) -> &[ActionSpec] {
        &self.actions
    }

    /// Register the trigger on `host`
    pub fn install(self, host: &DaemonHost) -> RegistrationResult<AutomationHandle> {
        let client = host.client().clone();
        let actions: Arc<[ActionSpec]> = self.actions.into();

        match self.trigger {
            Trigger::StateChange { pattern, condition } => {
                let filter = StateFilter::new(pattern, condition);
                let id = host.registry().register_state(filter, move |change| {
                    let client = client.clone();
                    let actions = actions.clone();
                    async move {
                        debug!(entity_id = %change.entity_id, "Automation triggered");
                        run_actions(&client, &actions).await
                    }
                })?;
                info!(listener_id = %id, "Installed state automation");
                Ok(AutomationHandle::Listener {
                    id,
                    registry: Arc::downgrade(host.registry()),
                })
            }
            Trigger::Event(pattern) => {
                let id = host.registry().register_event(pattern, move |event| {
                    let client = client.clone();
                    let actions = actions.clone();
                    async move {
                        debug!(event_type = %event.event_type, "Automation triggered");
                        run_actions(&client, &actions).await
                    }
                })?;
                info!(listener_id = %id, "Installed event automation");
                Ok(AutomationHandle::Listener {
                    id,
                    registry: Arc::downgrade(host.registry()),
                })
            }
            Trigger::Every(interval) => {
                if host.scheduler().is_closed() {
                    return Err(RegistrationError::Closed);
                }
                let handle = host.scheduler().run_every(interval, move || {
                    let client = client.clone();
                    let actions = actions.clone();
                    async move { run_actions(&client, &actions).await }
                });
                info!(task_id = %handle.id(), ?interval, "Installed timer automation");
                Ok(AutomationHandle::Scheduled(handle))
            }
        }
    }
}

async fn run_actions(client: &SharedHubClient, actions: &[ActionSpec]) -> anyhow::Result<()> {
    for action in actions {
        for call in action.service_calls() {
            client
                .call_service(&call.domain, &call.service, Some(call.service_data.clone()), false)
                .await
                .with_context(|| format!("automation action {} failed", call.service_id()))?;
        }
    }
    Ok(())
}

/// Handle to an installed automation
#[derive(Debug)]
pub enum AutomationHandle {
    Listener {
        id: ListenerId,
        registry: Weak<ListenerRegistry>,
    },
    Scheduled(ScheduledHandle),
}

impl AutomationHandle {
    /// Stop the automation; false if it was already stopped
    pub fn cancel(&self) -> bool {
        match self {
            AutomationHandle::Listener { id, registry } => registry
                .upgrade()
                .map(|registry| registry.cancel(*id))
                .unwrap_or(false),
            AutomationHandle::Scheduled(handle) => handle.cancel(),
        }
    }

    pub fn listener_id(&self) -> Option<ListenerId> {
        match self {
            AutomationHandle::Listener { id, .. } => Some(*id),
            AutomationHandle::Scheduled(_) => None,
        }
    }
}

fn parse_entities<I, S>(ids: I) -> RegistrationResult<Vec<EntityId>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let ids = ids
        .into_iter()
        .map(|id| {
            let id = id.as_ref();
            id.parse().map_err(|source| RegistrationError::InvalidPattern {
                pattern: id.to_string(),
                source,
            })
        })
        .collect::<RegistrationResult<Vec<EntityId>>>()?;
    if ids.is_empty() {
        return Err(RegistrationError::EmptyEntitySet);
    }
    Ok(ids)
}

/// Ids of the current entities accepted by `predicate`, in store order
fn select_entities<P>(host: &DaemonHost, predicate: P) -> RegistrationResult<Vec<EntityId>>
where
    P: Fn(&EntityState) -> bool,
{
    let ids: Vec<EntityId> = host
        .states()
        .into_iter()
        .filter(|state| predicate(state))
        .map(|state| state.entity_id)
        .collect();
    if ids.is_empty() {
        return Err(RegistrationError::EmptyEntitySet);
    }
    Ok(ids)
}

/// Entities selected with `host.entity(..)` or `host.entities_where(..)`
pub struct EntitySelection<'a> {
    host: &'a DaemonHost,
    entities: RegistrationResult<Vec<EntityId>>,
}

impl<'a> EntitySelection<'a> {
    pub(crate) fn new<I, S>(host: &'a DaemonHost, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            host,
            entities: parse_entities(ids),
        }
    }

    pub(crate) fn matching<P>(host: &'a DaemonHost, predicate: P) -> Self
    where
        P: Fn(&EntityState) -> bool,
    {
        Self {
            host,
            entities: select_entities(host, predicate),
        }
    }

    fn trigger(self, condition: StateCondition) -> AutomationBuilder<'a> {
        let trigger = self.entities.map(|ids| Trigger::StateChange {
            pattern: EntityPattern::Set(ids),
            condition,
        });
        AutomationBuilder::new(self.host, trigger)
    }

    /// Trigger on a state change with optional `to`/`from` filters
    pub fn state_changed<T, F>(self, to: Option<T>, from: Option<F>) -> AutomationBuilder<'a>
    where
        T: Into<StateValue>,
        F: Into<StateValue>,
    {
        self.trigger(StateCondition::transition(to, from))
    }

    pub fn state_changed_to(self, to: impl Into<StateValue>) -> AutomationBuilder<'a> {
        self.trigger(StateCondition::to(to))
    }

    /// Trigger when `predicate(new, old)` holds
    pub fn state_changed_when<P>(self, predicate: P) -> AutomationBuilder<'a>
    where
        P: Fn(&EntityState, Option<&EntityState>) -> bool + Send + Sync + 'static,
    {
        self.trigger(StateCondition::when(predicate))
    }

    pub fn turn_on(self) -> ImmediateAction<'a> {
        self.immediate(EntityAction::TurnOn)
    }

    pub fn turn_off(self) -> ImmediateAction<'a> {
        self.immediate(EntityAction::TurnOff)
    }

    pub fn toggle(self) -> ImmediateAction<'a> {
        self.immediate(EntityAction::Toggle)
    }

    fn immediate(self, action: EntityAction) -> ImmediateAction<'a> {
        ImmediateAction {
            host: self.host,
            action: self.entities.map(|entities| ActionSpec {
                entities,
                action,
                attributes: Map::new(),
            }),
        }
    }
}

/// Entry point of a timer-triggered automation
pub struct TimerSelection<'a> {
    host: &'a DaemonHost,
}

impl<'a> TimerSelection<'a> {
    pub(crate) fn new(host: &'a DaemonHost) -> Self {
        Self { host }
    }

    /// Trigger every `interval`, first after one interval
    pub fn every(self, interval: Duration) -> AutomationBuilder<'a> {
        AutomationBuilder::new(self.host, Ok(Trigger::Every(interval)))
    }
}

/// Entry point of an event-triggered automation
pub struct EventSelection<'a> {
    host: &'a DaemonHost,
    pattern: RegistrationResult<EventPattern>,
}

impl<'a> EventSelection<'a> {
    pub(crate) fn new(host: &'a DaemonHost, pattern: RegistrationResult<EventPattern>) -> Self {
        Self { host, pattern }
    }

    /// Select the entities the first action targets
    pub fn entity<I, S>(self, ids: I) -> ActionTarget<'a>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.into_builder().entity(ids)
    }

    pub fn entities_where<P>(self, predicate: P) -> ActionTarget<'a>
    where
        P: Fn(&EntityState) -> bool,
    {
        self.into_builder().entities_where(predicate)
    }

    fn into_builder(self) -> AutomationBuilder<'a> {
        AutomationBuilder::new(self.host, self.pattern.map(Trigger::Event))
    }
}

/// Automation with a trigger, accumulating actions
pub struct AutomationBuilder<'a> {
    host: &'a DaemonHost,
    trigger: RegistrationResult<Trigger>,
    actions: Vec<ActionSpec>,
    error: Option<RegistrationError>,
}

impl<'a> AutomationBuilder<'a> {
    fn new(host: &'a DaemonHost, trigger: RegistrationResult<Trigger>) -> Self {
        Self {
            host,
            trigger,
            actions: Vec::new(),
            error: None,
        }
    }

    /// Select the entities the next action targets
    pub fn entity<I, S>(self, ids: I) -> ActionTarget<'a>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        ActionTarget {
            builder: self,
            entities: parse_entities(ids),
        }
    }

    /// Target the current entities accepted by `predicate`
    ///
    /// The store is read once, here; entities appearing later are not added.
    pub fn entities_where<P>(self, predicate: P) -> ActionTarget<'a>
    where
        P: Fn(&EntityState) -> bool,
    {
        let entities = select_entities(self.host, predicate);
        ActionTarget {
            builder: self,
            entities,
        }
    }

    /// Add a service data attribute to the most recent action
    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        match self.actions.last_mut() {
            Some(action) => {
                action.attributes.insert(name.to_string(), value.into());
            }
            None => {
                self.error
                    .get_or_insert(RegistrationError::AttributeWithoutAction {
                        name: name.to_string(),
                    });
            }
        }
        self
    }

    /// Finish building without registering anything
    pub fn build(self) -> RegistrationResult<AutomationSpec> {
        if let Some(error) = self.error {
            return Err(error);
        }
        Ok(AutomationSpec {
            trigger: self.trigger?,
            actions: self.actions,
        })
    }

    /// Build and install the automation
    pub fn execute(self) -> RegistrationResult<AutomationHandle> {
        let host = self.host;
        self.build()?.install(host)
    }
}

/// Entities awaiting an action verb
pub struct ActionTarget<'a> {
    builder: AutomationBuilder<'a>,
    entities: RegistrationResult<Vec<EntityId>>,
}

impl<'a> ActionTarget<'a> {
    pub fn turn_on(self) -> AutomationBuilder<'a> {
        self.push(EntityAction::TurnOn)
    }

    pub fn turn_off(self) -> AutomationBuilder<'a> {
        self.push(EntityAction::TurnOff)
    }

    pub fn toggle(self) -> AutomationBuilder<'a> {
        self.push(EntityAction::Toggle)
    }

    fn push(self, action: EntityAction) -> AutomationBuilder<'a> {
        let mut builder = self.builder;
        match self.entities {
            Ok(entities) => builder.actions.push(ActionSpec {
                entities,
                action,
                attributes: Map::new(),
            }),
            Err(e) => {
                builder.error.get_or_insert(e);
            }
        }
        builder
    }
}

/// Action run right away, without a trigger
pub struct ImmediateAction<'a> {
    host: &'a DaemonHost,
    action: RegistrationResult<ActionSpec>,
}

impl<'a> ImmediateAction<'a> {
    pub fn with_attribute(mut self, name: &str, value: impl Into<Value>) -> Self {
        if let Ok(action) = &mut self.action {
            action.attributes.insert(name.to_string(), value.into());
        }
        self
    }

    /// Issue the service calls now
    pub async fn execute(self) -> DaemonResult<()> {
        let action = self.action?;
        for call in action.service_calls() {
            self.host
                .call_service(&call.domain, &call.service, Some(call.service_data))
                .await?;
        }
        Ok(())
    }
}

/// Scripts started with `host.run_script(..)`
pub struct ScriptAction<'a> {
    host: &'a DaemonHost,
    scripts: DaemonResult<Vec<EntityId>>,
}

impl<'a> ScriptAction<'a> {
    /// Accepts `script.<name>` or a bare `<name>`
    pub(crate) fn new<I, S>(host: &'a DaemonHost, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            host,
            scripts: parse_scripts(ids),
        }
    }

    pub fn scripts(&self) -> Option<&[EntityId]> {
        self.scripts.as_deref().ok()
    }

    /// Call `script.<name>` for each script, in order
    pub async fn execute(self) -> DaemonResult<()> {
        for script in self.scripts? {
            self.host.call_service("script", script.object_id(), None).await?;
        }
        Ok(())
    }
}

fn parse_scripts<I, S>(ids: I) -> DaemonResult<Vec<EntityId>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let qualified: Vec<String> = ids
        .into_iter()
        .map(|id| {
            let id = id.as_ref().trim();
            if id.contains('.') {
                id.to_string()
            } else {
                format!("script.{id}")
            }
        })
        .collect();
    let scripts = parse_entities(qualified)?;
    if let Some(other) = scripts.iter().find(|id| !id.in_domain("script")) {
        return Err(DaemonError::NotAScript(other.to_string()));
    }
    Ok(scripts)
}
