// src/rabbitmq/worker.rs
use std::future::Future;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::info;

use super::errors::Result;

/// A consume or serve loop running on its own tokio task.
pub struct Worker {
    name: String,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<()>>,
}

impl Worker {
    /// Spawns `run`, handing it a future that resolves once shutdown is
    /// requested (or the `Worker` is dropped).
    pub fn spawn<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: FnOnce(ShutdownSignal) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = tokio::spawn(run(ShutdownSignal(rx)));
        Worker {
            name: name.into(),
            shutdown: Some(tx),
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Asks the loop to stop and waits for it.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            // The loop may already be gone; its result is still in the handle.
            let _ = tx.send(());
        }
        info!(worker = %self.name, "Waiting for worker to stop");
        self.handle.await?
    }

    /// Waits for the loop to end on its own, normally after a transport
    /// failure, and returns its result.
    pub async fn join(mut self) -> Result<()> {
        let _keep_running = self.shutdown.take();
        self.handle.await?
    }
}

/// Resolves when the owning `Worker` requests shutdown.
pub struct ShutdownSignal(oneshot::Receiver<()>);

impl ShutdownSignal {
    pub async fn recv(self) {
        let _ = self.0.await;
    }
}
