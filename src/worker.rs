//! Background worker handles

use std::future::Future;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A spawned background loop with its stop signal
///
/// The loop receives a `watch::Receiver<bool>` that flips to `true` on stop;
/// [`WorkerHandle::stop`] signals it and waits for the task to finish.
pub struct WorkerHandle {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn spawn<F, Fut>(name: &'static str, worker: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(worker(shutdown_rx));
        debug!(worker = name, "Worker started");
        Self {
            name,
            shutdown_tx,
            join,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Signal the worker and wait until its current iteration has finished
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            warn!(worker = self.name, error = %e, "Worker ended abnormally");
        } else {
            debug!(worker = self.name, "Worker stopped");
        }
    }
}
