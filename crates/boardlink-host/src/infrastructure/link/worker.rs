//! Cancellable background tasks.
//!
//! A [`Worker`] is a tokio task plus a halt signal.  The task body receives a
//! [`Halt`] and races it against whatever it blocks on (a socket read, a queue
//! take), so halting never has to wait for the next natural read boundary.
//!
//! Every worker registers with a [`WorkerTracker`] while it runs.  The tracker
//! is what `ConnectionManager::join` waits on: it reaches zero only after every
//! worker task has actually finished, including aborted ones.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Counts running workers.
#[derive(Debug, Clone)]
pub(crate) struct WorkerTracker {
    active: watch::Sender<usize>,
}

impl WorkerTracker {
    pub(crate) fn new() -> Self {
        let (active, _) = watch::channel(0);
        Self { active }
    }

    pub(crate) fn active(&self) -> usize {
        *self.active.borrow()
    }

    /// Waits until no worker is running.  Returns at once if none ever started.
    pub(crate) async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        loop {
            let idle = *rx.borrow_and_update() == 0;
            if idle {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Spawns `fut` and counts it as running until it completes or is aborted.
    ///
    /// Used directly for tasks that nobody halts (the per-epoch coordinator);
    /// halted tasks go through [`Worker::spawn`].
    pub(crate) fn spawn<Fut>(&self, name: &'static str, fut: Fut) -> JoinHandle<()>
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let guard = self.enter();
        debug!(worker = name, "worker started");
        tokio::spawn(async move {
            let _guard = guard;
            fut.await;
        })
    }

    fn enter(&self) -> ActiveGuard {
        self.active.send_modify(|n| *n += 1);
        ActiveGuard {
            active: self.active.clone(),
        }
    }
}

/// Decrements the tracker when the worker's future is dropped, including
/// when the task is aborted.
struct ActiveGuard {
    active: watch::Sender<usize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// The receiving side of a worker's halt signal.
#[derive(Debug, Clone)]
pub(crate) struct Halt {
    rx: watch::Receiver<bool>,
}

impl Halt {
    /// Completes once the worker has been told to stop.
    ///
    /// Cancel-safe, so it can sit in one arm of `tokio::select!`.
    pub(crate) async fn halted(&mut self) {
        loop {
            let halted = *self.rx.borrow_and_update();
            if halted {
                return;
            }
            if self.rx.changed().await.is_err() {
                // The Worker handle is gone; nobody can halt us any more, so stop.
                return;
            }
        }
    }
}

/// How a [`Worker::halt`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HaltOutcome {
    /// The worker saw the signal and returned on its own.
    Stopped,
    /// The worker was aborted or panicked, possibly in the middle of an I/O
    /// call.  Whatever channel it was writing to may hold a partial frame.
    Aborted,
}

/// Handle to a running worker task.
pub(crate) struct Worker {
    name: &'static str,
    halt_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawns `body` on the tokio runtime and registers it with `tracker`.
    pub(crate) fn spawn<F, Fut>(name: &'static str, tracker: &WorkerTracker, body: F) -> Self
    where
        F: FnOnce(Halt) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (halt_tx, halt_rx) = watch::channel(false);
        let handle = tracker.spawn(name, body(Halt { rx: halt_rx }));
        Self {
            name,
            halt_tx,
            handle,
        }
    }

    /// Signals the worker to stop and waits for it.
    ///
    /// A worker that has not exited after `grace` is aborted.
    pub(crate) async fn halt(mut self, grace: Duration) -> HaltOutcome {
        self.halt_tx.send_replace(true);
        match tokio::time::timeout(grace, &mut self.handle).await {
            Ok(Ok(())) => {
                debug!(worker = self.name, "worker halted");
                HaltOutcome::Stopped
            }
            Ok(Err(e)) => {
                warn!(worker = self.name, "worker task failed: {e}");
                HaltOutcome::Aborted
            }
            Err(_) => {
                warn!(
                    worker = self.name,
                    "worker did not stop within {grace:?}; aborting"
                );
                self.handle.abort();
                let _ = (&mut self.handle).await;
                HaltOutcome::Aborted
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
