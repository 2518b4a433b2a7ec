// src/rabbitmq/scheduler.rs
// Deferred execution of reconnection attempts

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::runtime::Handle;

pub type ScheduledTask = BoxFuture<'static, ()>;

/// Runs a task once `delay` has elapsed without blocking the caller.
pub trait Scheduler: Send + Sync + 'static {
    fn schedule(&self, delay: Duration, task: ScheduledTask);
}

/// Spawns delayed tasks on a tokio runtime.
///
/// The runtime handle is captured up front because close notifications can
/// arrive on threads that are not part of the runtime.
pub struct TokioScheduler {
    handle: Handle,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self { handle }
    }

    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}

/// Holds scheduled tasks until the owner runs them, recording every
/// requested delay. Lets backoff behaviour be driven step by step.
#[derive(Default)]
pub struct ManualScheduler {
    pending: Mutex<Vec<(Duration, ScheduledTask)>>,
    requested: Mutex<Vec<Duration>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every delay requested so far, in order.
    pub fn requested_delays(&self) -> Vec<Duration> {
        self.requested
            .lock()
            .map(|requested| requested.clone())
            .unwrap_or_default()
    }

    pub fn pending(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    /// Run the oldest pending task to completion, returning its delay.
    pub async fn run_next(&self) -> Option<Duration> {
        let next = {
            let mut pending = self.pending.lock().ok()?;
            if pending.is_empty() {
                None
            } else {
                Some(pending.remove(0))
            }
        };

        let (delay, task) = next?;
        task.await;
        Some(delay)
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: ScheduledTask) {
        if let Ok(mut requested) = self.requested.lock() {
            requested.push(delay);
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.push((delay, task));
        }
    }
}
