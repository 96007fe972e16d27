//! Time-based scheduling for hassdaemon
//!
//! The Scheduler runs callbacks after a delay, at a wall-clock instant, on a
//! fixed interval, or daily at a local time. Every scheduled entry is its own
//! tokio task and is controlled through a [`ScheduledHandle`].
//!
//! Periodic entries re-arm after each firing completes, so the callback's
//! execution time adds to the gap and missed ticks are never caught up.

use std::any::Any;
use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

/// Future returned by scheduled callbacks
pub type TaskFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Scheduled callback type
pub type TaskCallback = Arc<dyn Fn() -> TaskFuture + Send + Sync>;

/// Unique identifier of a scheduled entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// When an entry fires
#[derive(Debug, Clone, Copy)]
enum Schedule {
    Once(Duration),
    Every(Duration),
    Daily(NaiveTime),
}

impl Schedule {
    fn first_delay(&self) -> Duration {
        match self {
            Schedule::Once(delay) | Schedule::Every(delay) => *delay,
            Schedule::Daily(time) => until_next(*time, Local::now().naive_local()),
        }
    }

    /// Delay before the next firing, `None` when the entry is done
    fn next_delay(&self) -> Option<Duration> {
        match self {
            Schedule::Once(_) => None,
            Schedule::Every(interval) => Some(*interval),
            Schedule::Daily(time) => Some(until_next(*time, Local::now().naive_local())),
        }
    }
}

/// Time from `now` until the next occurrence of `time`, strictly in the future
fn until_next(time: NaiveTime, now: NaiveDateTime) -> Duration {
    let mut next = now.date().and_time(time);
    if next <= now {
        next += chrono::Duration::days(1);
    }
    (next - now).to_std().unwrap_or_default()
}

thread_local! {
    /// Task whose callback is being invoked on this thread
    static STARTING: Cell<Option<TaskId>> = const { Cell::new(None) };
}

/// Cancellation flag shared by a handle and its task
///
/// Starting a firing and cancelling both take `gate`, so once `cancel`
/// returns no new invocation can begin.
struct CancelSignal {
    id: TaskId,
    cancelled: AtomicBool,
    gate: Mutex<()>,
    notify: Notify,
}

impl CancelSignal {
    fn new(id: TaskId) -> Self {
        Self {
            id,
            cancelled: AtomicBool::new(false),
            gate: Mutex::new(()),
            notify: Notify::new(),
        }
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns true for the first cancellation only
    fn cancel(&self) -> bool {
        // A callback cancelling its own entry already holds the gate
        let _gate = (STARTING.with(Cell::get) != Some(self.id)).then(|| self.gate());
        let first = !self.cancelled.swap(true, Ordering::SeqCst);
        self.notify.notify_one();
        first
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        while !self.is_cancelled() {
            self.notify.notified().await;
        }
    }

    /// Invoke `callback` unless cancelled, atomically with respect to `cancel`
    fn start(&self, callback: &TaskCallback) -> Option<std::thread::Result<TaskFuture>> {
        let _gate = self.gate();
        if self.is_cancelled() {
            return None;
        }
        STARTING.with(|starting| starting.set(Some(self.id)));
        let started = catch_unwind(AssertUnwindSafe(|| callback()));
        STARTING.with(|starting| starting.set(None));
        Some(started)
    }
}

/// Handle to a scheduled entry
///
/// Cancelling prevents every firing that has not started yet; an in-flight
/// invocation runs to completion.
#[derive(Clone)]
pub struct ScheduledHandle {
    id: TaskId,
    signal: Arc<CancelSignal>,
}

impl ScheduledHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Cancel the entry; returns false if it was already cancelled
    pub fn cancel(&self) -> bool {
        let first = self.signal.cancel();
        if first {
            debug!(task_id = %self.id, "Cancelled scheduled task");
        }
        first
    }

    pub fn is_cancelled(&self) -> bool {
        self.signal.is_cancelled()
    }
}

impl fmt::Debug for ScheduledHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduledHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Scheduler for time-based callbacks
///
/// The Scheduler is responsible for:
/// - Spawning one timer task per scheduled entry
/// - Containing callback errors and panics without stopping periodic entries
/// - Cancelling every pending entry on shutdown
pub struct Scheduler {
    tasks: Arc<DashMap<TaskId, Arc<CancelSignal>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    /// Run `callback` once after `delay`
    pub fn run_in<F, Fut>(&self, delay: Duration, callback: F) -> ScheduledHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.schedule(Schedule::Once(delay), callback)
    }

    /// Run `callback` every `interval`, first after one interval
    pub fn run_every<F, Fut>(&self, interval: Duration, callback: F) -> ScheduledHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.schedule(Schedule::Every(interval), callback)
    }

    /// Run `callback` once at `at`, immediately if `at` is in the past
    pub fn run_at<F, Fut>(&self, at: DateTime<Utc>, callback: F) -> ScheduledHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        self.schedule(Schedule::Once(delay), callback)
    }

    /// Run `callback` every day at local `time`
    pub fn run_daily<F, Fut>(&self, time: NaiveTime, callback: F) -> ScheduledHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.schedule(Schedule::Daily(time), callback)
    }

    fn schedule<F, Fut>(&self, schedule: Schedule, callback: F) -> ScheduledHandle
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let callback: TaskCallback = Arc::new(move || Box::pin(callback()) as TaskFuture);
        let id = TaskId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let signal = Arc::new(CancelSignal::new(id));
        let handle = ScheduledHandle {
            id,
            signal: signal.clone(),
        };

        if self.is_closed() {
            warn!(task_id = %id, "Scheduler is closed, task will never run");
            signal.cancel();
            return handle;
        }

        debug!(task_id = %id, ?schedule, "Scheduling task");
        self.tasks.insert(id, signal.clone());
        if self.is_closed() {
            signal.cancel();
        }

        let tasks = self.tasks.clone();
        tokio::spawn(async move {
            let mut delay = schedule.first_delay();
            loop {
                tokio::select! {
                    biased;
                    _ = signal.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                if !run_guarded(id, &signal, &callback).await {
                    break;
                }

                match schedule.next_delay() {
                    Some(next) => delay = next,
                    None => break,
                }
            }
            tasks.remove(&id);
            trace!(task_id = %id, "Scheduled task finished");
        });

        handle
    }

    /// Cancel every pending entry, returning how many were active
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for entry in self.tasks.iter() {
            count += usize::from(entry.value().cancel());
        }
        count
    }

    /// Cancel everything and refuse new entries
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let count = self.cancel_all();
        info!(cancelled = count, "Scheduler closed");
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of entries that have not finished
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for Scheduler
pub type SharedScheduler = Arc<Scheduler>;

/// Run one firing, containing errors and panics; false if cancelled first
async fn run_guarded(id: TaskId, signal: &CancelSignal, callback: &TaskCallback) -> bool {
    let Some(started) = signal.start(callback) else {
        return false;
    };
    trace!(task_id = %id, "Firing scheduled task");
    let outcome = match started {
        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(task_id = %id, error = %e, "Scheduled task failed"),
        Err(panic) => error!(
            task_id = %id,
            panic = panic_text(panic.as_ref()),
            "Scheduled task panicked"
        ),
    }
    true
}

fn panic_text(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
