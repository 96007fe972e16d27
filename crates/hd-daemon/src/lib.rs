//! Reactive automation host for hassdaemon
//!
//! The daemon consumes the hub's message stream on a single dispatch loop,
//! keeps the entity state store current, and hands matching state changes,
//! events and service calls to registered listeners. On top of that it
//! offers cancellable delay-until-condition waits, time-based scheduling and
//! a fluent automation builder.
//!
//! # Key Types
//!
//! - [`DaemonHost`] - Lifecycle plus the listener, delay and outbound API
//! - [`Dispatcher`] - Ordered consumer of hub messages
//! - [`DelayResult`] - Awaitable outcome of a delay-until-condition wait
//! - [`HubClient`] - Boundary to the hub connection
//! - [`MemoryHub`] - In-process hub for tests and demos
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use hd_config::DaemonConfig;
//! use hd_daemon::{DaemonHost, MemoryHub};
//!
//! let config = DaemonConfig::load("/config")?;
//! hd_daemon::logging::init(&config.logging)?;
//!
//! let host = Arc::new(DaemonHost::new(Arc::new(MemoryHub::new()), config));
//! host.entity(["binary_sensor.hall_pir"])
//!     .state_changed_to("on")
//!     .entity(["light.hall"])
//!     .turn_on()
//!     .execute()?;
//! host.run().await?;
//! ```

pub mod delay;
pub mod dispatch;
mod error;
pub mod fluent;
mod host;
pub mod logging;
pub mod transport;

pub use delay::{DelayResult, DelayTracker};
pub use dispatch::{Dispatcher, StopReason};
pub use error::{DaemonError, DaemonResult};
pub use fluent::{
    ActionSpec, ActionTarget, AutomationBuilder, AutomationHandle, AutomationSpec, EntityAction,
    EntitySelection, EventSelection, ScriptAction, TimerSelection, Trigger,
};
pub use host::{DaemonHost, HostState};
pub use transport::memory::{MemoryHub, OutboundCall};
pub use transport::{HubClient, HubMessageStream, SharedHubClient, TransportError, TransportResult};
