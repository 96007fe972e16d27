//! Listener entries and their callback workers
//!
//! Each listener owns an unbounded queue drained by its own tokio task, so a
//! listener sees payloads in the order the dispatch loop matched them while a
//! slow callback only delays itself.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use hd_core::{HubEvent, ServiceCall, StateChangedData};
use tokio::sync::mpsc;
use tracing::{error, trace, warn};

use crate::pattern::Matcher;

/// Future returned by listener callbacks
pub type CallbackFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Listener callback type
pub type Callback<A> = Arc<dyn Fn(A) -> CallbackFuture + Send + Sync>;

/// Box an async closure into a [`Callback`]
pub fn callback<A, F, Fut>(f: F) -> Callback<A>
where
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)) as CallbackFuture)
}

/// Opaque id of a registered listener
///
/// Ids come from a monotonic counter and are never handed out twice, so a
/// stale id can never cancel a newer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn new(sequence: u64) -> Self {
        Self(sequence)
    }

    pub fn sequence(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Payload that can be queued to a listener
pub trait Delivery: Clone + Send + 'static {
    /// Short description for log fields
    fn describe(&self) -> String;
}

impl Delivery for StateChangedData {
    fn describe(&self) -> String {
        self.entity_id.to_string()
    }
}

impl Delivery for HubEvent {
    fn describe(&self) -> String {
        self.event_type.clone()
    }
}

impl Delivery for ServiceCall {
    fn describe(&self) -> String {
        self.service_id()
    }
}

/// A registered listener
pub struct Listener<F, A> {
    id: ListenerId,
    filter: F,
    callback: Callback<A>,
    live: Arc<AtomicBool>,
    worker: OnceLock<mpsc::UnboundedSender<A>>,
}

impl<F, A> Listener<F, A>
where
    F: Matcher<A>,
    A: Delivery,
{
    pub(crate) fn new(id: ListenerId, filter: F, callback: Callback<A>) -> Self {
        Self {
            id,
            filter,
            callback,
            live: Arc::new(AtomicBool::new(true)),
            worker: OnceLock::new(),
        }
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn filter(&self) -> &F {
        &self.filter
    }

    /// False once the listener has been cancelled
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Mark the listener cancelled; true only for the first call
    pub(crate) fn retire(&self) -> bool {
        self.live.swap(false, Ordering::SeqCst)
    }

    /// Queue `args` if the filter matches, returning whether it matched
    pub fn offer(&self, args: &A) -> bool {
        if !self.filter.matches(args) {
            return false;
        }
        self.deliver(args.clone());
        true
    }

    /// Queue `args` for the callback, spawning the worker on first use
    ///
    /// Must be called from within a tokio runtime.
    pub fn deliver(&self, args: A) {
        let tx = self.worker.get_or_init(|| self.spawn_worker());
        if tx.send(args).is_err() {
            warn!(listener_id = %self.id, "Listener worker has stopped, dropping delivery");
        }
    }

    fn spawn_worker(&self) -> mpsc::UnboundedSender<A> {
        let (tx, mut rx) = mpsc::unbounded_channel::<A>();
        let id = self.id;
        let callback = self.callback.clone();
        let live = self.live.clone();

        tokio::spawn(async move {
            while let Some(args) = rx.recv().await {
                // Cancelled listeners never start another invocation
                if !live.load(Ordering::SeqCst) {
                    trace!(listener_id = %id, "Skipping delivery to cancelled listener");
                    continue;
                }
                invoke(id, &callback, args).await;
            }
            trace!(listener_id = %id, "Listener worker finished");
        });

        tx
    }
}

impl<F: fmt::Debug, A> fmt::Debug for Listener<F, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("live", &self.live.load(Ordering::SeqCst))
            .finish()
    }
}

/// Run one callback, containing errors and panics
async fn invoke<A: Delivery>(id: ListenerId, callback: &Callback<A>, args: A) {
    let subject = args.describe();
    let outcome = match catch_unwind(AssertUnwindSafe(|| callback(args))) {
        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    match outcome {
        Ok(Ok(())) => trace!(listener_id = %id, subject = %subject, "Listener callback completed"),
        Ok(Err(e)) => warn!(
            listener_id = %id,
            subject = %subject,
            error = %e,
            "Listener callback failed"
        ),
        Err(panic) => error!(
            listener_id = %id,
            subject = %subject,
            panic = panic_message(panic.as_ref()),
            "Listener callback panicked"
        ),
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "non-string panic payload"
    }
}
