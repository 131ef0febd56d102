use std::future::Future;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a scheduled task.
///
/// `Pending -> Running -> {Completed | Cancelled | Failed}`, with one
/// shortcut: a task cancelled before it starts jumps straight from `Pending`
/// to `Cancelled` and its action is never invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        self.terminal_outcome().is_some()
    }

    fn terminal_outcome(self) -> Option<TaskOutcome> {
        match self {
            TaskState::Pending | TaskState::Running => None,
            TaskState::Completed => Some(TaskOutcome::Completed),
            TaskState::Cancelled => Some(TaskOutcome::Cancelled),
            TaskState::Failed => Some(TaskOutcome::Failed),
        }
    }
}

/// How a task ended. Cancellation is an ordinary outcome here, never an
/// error and never silently folded into "completed".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// Handed to every action when it starts. Carries the task's cancellation
/// token; long-running actions poll it at their own safe points.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub(crate) id: Uuid,
    pub(crate) cancel: CancellationToken,
}

impl TaskContext {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once cancellation is requested; for use in `select!` arms
    /// around the action's slow calls.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// Observer side of one scheduled task. Cloneable; every clone cancels and
/// watches the same task.
#[derive(Debug, Clone)]
pub struct TaskHandle {
    pub(crate) id: Uuid,
    pub(crate) cancel: CancellationToken,
    pub(crate) state_tx: Arc<watch::Sender<TaskState>>,
    pub(crate) state_rx: watch::Receiver<TaskState>,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> TaskState {
        *self.state_rx.borrow()
    }

    /// Requests cooperative cancellation. Safe to call any number of times,
    /// in any state. A task that has not started yet is finished on the
    /// spot and its action will never be invoked; a running task keeps
    /// running until it observes the token.
    pub fn cancel(&self) {
        self.cancel.cancel();
        self.state_tx.send_if_modified(|state| {
            if *state == TaskState::Pending {
                *state = TaskState::Cancelled;
                true
            } else {
                false
            }
        });
    }

    /// Waits for the task to reach a terminal state.
    pub async fn wait(&self) -> TaskOutcome {
        let mut rx = self.state_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow_and_update().terminal_outcome() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Publisher vanished without a terminal state; nothing will
                // ever run this task to completion.
                return TaskOutcome::Cancelled;
            }
        }
    }

    /// Blocking flavor of [`TaskHandle::wait`] for callers that do not live
    /// on the runtime. Must not be called from a runtime worker thread.
    pub fn wait_blocking(&self) -> TaskOutcome {
        futures::executor::block_on(self.wait())
    }
}

/// Publishes `Cancelled` if the supervisor future is dropped before it could
/// publish a terminal state (runtime teardown, abort). Terminal states
/// already published win.
struct CompletionGuard {
    state_tx: Arc<watch::Sender<TaskState>>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = TaskState::Cancelled;
                true
            }
        });
    }
}

/// Runs one action under the task state machine: gates the start against
/// early cancellation, catches panics and errors at the boundary, and
/// publishes the terminal state.
pub(crate) async fn supervise<F, Fut>(
    action: F,
    context: TaskContext,
    state_tx: Arc<watch::Sender<TaskState>>,
) where
    F: FnOnce(TaskContext) -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let _guard = CompletionGuard {
        state_tx: state_tx.clone(),
    };

    let started = state_tx.send_if_modified(|state| {
        if *state == TaskState::Pending {
            *state = TaskState::Running;
            true
        } else {
            false
        }
    });
    if !started {
        tracing::debug!("task {} was cancelled before it started", context.id());
        return;
    }

    let action_context = context.clone();
    let future = std::panic::AssertUnwindSafe(async move { action(action_context).await });
    let outcome = future.catch_unwind().await;

    let terminal = match outcome {
        Err(panic) => {
            tracing::error!("task {} panicked: {}", context.id(), panic_message(&*panic));
            TaskState::Failed
        }
        Ok(Err(err)) if context.is_cancelled() => {
            // Cancelled actions routinely fail on the way out; that is a
            // cancellation, not a failure.
            tracing::debug!("task {} ended after cancellation: {err:#}", context.id());
            TaskState::Cancelled
        }
        Ok(Err(err)) => {
            tracing::error!("task {} failed: {err:#}", context.id());
            TaskState::Failed
        }
        Ok(Ok(())) if context.is_cancelled() => TaskState::Cancelled,
        Ok(Ok(())) => TaskState::Completed,
    };
    state_tx.send_replace(terminal);
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}
