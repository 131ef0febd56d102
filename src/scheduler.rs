//! Background scheduling over a host-owned tokio runtime, with cooperative
//! cancellation and a serialized dispatch thread for applying results.
//!
//! The scheduler never owns a runtime. Hosts hand it a
//! [`tokio::runtime::Handle`]; every task runs there, carries a
//! [`TaskContext`] with its cancellation token, and reports how it ended
//! through an explicit [`TaskOutcome`].

mod dispatch;
pub mod task;

use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use self::dispatch::Dispatcher;
pub use self::task::{TaskContext, TaskHandle, TaskOutcome, TaskState};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("the scheduler is shut down")]
    Shutdown,
    #[error("the dispatch thread is no longer accepting work")]
    DispatchClosed,
}

/// Schedules cancellable background work on the host runtime.
///
/// Shutting the scheduler down cancels every outstanding task through a
/// shared root token; tasks observe it cooperatively via their
/// [`TaskContext`].
#[derive(Debug)]
pub struct Scheduler {
    runtime: Handle,
    root: CancellationToken,
    dispatcher: Dispatcher,
}

impl Scheduler {
    pub fn new(runtime: Handle) -> anyhow::Result<Self> {
        Ok(Self {
            runtime,
            root: CancellationToken::new(),
            dispatcher: Dispatcher::spawn()?,
        })
    }

    /// Schedules `action` and returns immediately with a handle. The action
    /// is not invoked at all if the task is cancelled while still pending.
    pub fn spawn<F, Fut>(&self, action: F) -> Result<TaskHandle, ScheduleError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.root.is_cancelled() {
            return Err(ScheduleError::Shutdown);
        }

        let context = TaskContext {
            id: Uuid::new_v4(),
            cancel: self.root.child_token(),
        };
        let (state_tx, state_rx) = watch::channel(TaskState::Pending);
        let state_tx = Arc::new(state_tx);
        let handle = TaskHandle {
            id: context.id,
            cancel: context.cancel.clone(),
            state_tx: state_tx.clone(),
            state_rx,
        };

        tracing::debug!("scheduling task {}", context.id);
        self.runtime
            .spawn(task::supervise(action, context, state_tx));
        Ok(handle)
    }

    /// Schedules `action` and waits for it to finish. Cancellation and
    /// failure come back as outcomes, not errors; [`ScheduleError`] is only
    /// for work that could not be scheduled in the first place.
    pub async fn run<F, Fut>(&self, action: F) -> Result<TaskOutcome, ScheduleError>
    where
        F: FnOnce(TaskContext) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handle = self.spawn(action)?;
        Ok(handle.wait().await)
    }

    /// Queues `job` on the dispatch thread, after everything queued before
    /// it. Returns as soon as the job is queued.
    pub fn dispatch<F>(&self, job: F) -> Result<(), ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.root.is_cancelled() {
            return Err(ScheduleError::Shutdown);
        }
        self.dispatcher.dispatch(job)
    }

    /// Queues `job` on the dispatch thread and waits for its result.
    pub async fn dispatch_and_wait<R, F>(&self, job: F) -> Result<R, ScheduleError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.root.is_cancelled() {
            return Err(ScheduleError::Shutdown);
        }
        self.dispatcher.dispatch_and_wait(job).await
    }

    /// Cancels every outstanding task and stops the dispatch thread after
    /// it drains the jobs already queued. Idempotent; scheduling anything
    /// afterwards returns [`ScheduleError::Shutdown`].
    pub fn shutdown(&self) {
        if !self.root.is_cancelled() {
            tracing::debug!("shutting the scheduler down");
            self.root.cancel();
        }
        self.dispatcher.shutdown();
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Tasks must not keep running against a toolkit that is gone.
        if !self.root.is_cancelled() {
            self.root.cancel();
        }
    }
}
