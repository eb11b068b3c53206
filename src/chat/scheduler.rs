//! Background task scheduling for incremental flushes
//!
//! The persistence engine never writes to storage on the caller's path.
//! Instead it hands a flush pass to a [`BackgroundScheduler`], which decides
//! when the pass runs and when a running pass should stop and give the host
//! back control.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Unit of background work
pub type BackgroundTask = BoxFuture<'static, ()>;

/// Runs background tasks and bounds how long a single pass may take
pub trait BackgroundScheduler: Send + Sync {
    /// Queue `task` to run when the host is idle, and no later than `timeout`
    fn schedule(&self, task: BackgroundTask, timeout: Duration);

    /// Whether a pass that began at `pass_started` should stop and reschedule
    fn should_yield(&self, pass_started: Instant) -> bool;
}

/// Scheduler that spawns tasks onto the current tokio runtime
///
/// A task waits for the idle delay (capped by its timeout) before running,
/// so bursts of mutations coalesce into one flush pass. A pass yields once it
/// has run for longer than the time budget.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    idle_delay: Duration,
    time_budget: Duration,
}

impl TokioScheduler {
    /// Create a scheduler
    ///
    /// # Arguments
    ///
    /// * `idle_delay` - How long a task waits before running
    /// * `time_budget` - How long a single pass may run before yielding
    pub fn new(idle_delay: Duration, time_budget: Duration) -> Self {
        Self {
            idle_delay,
            time_budget,
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), Duration::from_millis(8))
    }
}

impl BackgroundScheduler for TokioScheduler {
    fn schedule(&self, task: BackgroundTask, timeout: Duration) {
        let delay = self.idle_delay.min(timeout);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    task.await;
                });
            }
            Err(_) => {
                tracing::warn!("No tokio runtime available; dropping background task");
            }
        }
    }

    fn should_yield(&self, pass_started: Instant) -> bool {
        pass_started.elapsed() >= self.time_budget
    }
}

/// Scheduler that queues tasks until the host drives them explicitly
///
/// Useful when the embedding application owns its own event loop, and in
/// tests that need to observe the save state between passes.
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<VecDeque<BackgroundTask>>,
    always_yield: AtomicBool,
}

impl ManualScheduler {
    /// Create an empty scheduler
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every pass stop after its first unit of work
    pub fn set_always_yield(&self, always_yield: bool) {
        self.always_yield.store(always_yield, Ordering::SeqCst);
    }

    /// Number of queued tasks
    pub fn pending(&self) -> usize {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Run the task at the head of the queue; returns false when empty
    pub async fn run_next(&self) -> bool {
        let task = self
            .queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match task {
            Some(task) => {
                task.await;
                true
            }
            None => false,
        }
    }

    /// Run queued tasks, including ones they schedule, until the queue is empty
    ///
    /// Returns the number of tasks run.
    pub async fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        while self.run_next().await {
            ran += 1;
        }
        ran
    }
}

impl BackgroundScheduler for ManualScheduler {
    fn schedule(&self, task: BackgroundTask, _timeout: Duration) {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(task);
    }

    fn should_yield(&self, _pass_started: Instant) -> bool {
        self.always_yield.load(Ordering::SeqCst)
    }
}
