use std::sync::Mutex;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot};

use crate::scheduler::ScheduleError;
use crate::scheduler::task::panic_message;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Serializes closures onto one long-lived thread, in submission order.
/// Stands in for a host UI/event thread: results computed in the background
/// are marshalled here instead of being applied from arbitrary workers.
pub(crate) struct Dispatcher {
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Dispatcher {
    pub(crate) fn spawn() -> anyhow::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let thread = std::thread::Builder::new()
            .name("az-toolkit-dispatch".to_string())
            .spawn(move || run_dispatch_loop(rx))
            .context("spawning the dispatch thread")?;
        Ok(Self {
            tx: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub(crate) fn dispatch<F>(&self, job: F) -> Result<(), ScheduleError>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let tx = guard.as_ref().ok_or(ScheduleError::DispatchClosed)?;
        tx.send(Box::new(job))
            .map_err(|_| ScheduleError::DispatchClosed)
    }

    /// Runs `job` on the dispatch thread and hands its result back. A job
    /// that panics is logged by the dispatch loop and surfaces here as
    /// [`ScheduleError::DispatchClosed`].
    pub(crate) async fn dispatch_and_wait<R, F>(&self, job: F) -> Result<R, ScheduleError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        self.dispatch(move || {
            let _ = result_tx.send(job());
        })?;
        result_rx.await.map_err(|_| ScheduleError::DispatchClosed)
    }

    /// Closes the queue and joins the thread. Jobs already queued still run
    /// before the thread exits. Later calls are no-ops.
    pub(crate) fn shutdown(&self) {
        let tx = self
            .tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(tx);

        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                tracing::warn!("the dispatch thread exited by panicking");
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let open = self
            .tx
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        f.debug_struct("Dispatcher").field("open", &open).finish()
    }
}

fn run_dispatch_loop(mut rx: mpsc::UnboundedReceiver<Job>) {
    tracing::debug!("dispatch thread started");
    while let Some(job) = rx.blocking_recv() {
        // One bad closure must not take the thread down with it.
        if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
            tracing::error!("dispatched closure panicked: {}", panic_message(&*panic));
        }
    }
    tracing::debug!("dispatch thread stopped");
}
