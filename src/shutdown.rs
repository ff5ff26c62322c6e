//! Hard shutdown handling for cluster background work.
//!
//! [`ShutdownCoordinator`] is shared by the dispatcher and the background
//! sweeps of one cluster. Stopping the cluster fires it once; every task
//! wrapped with [`ShutdownAware::with_shutdown`] is abandoned at its next
//! suspension point rather than drained.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

/// Shutdown coordinator for cancelling in-flight cluster work.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Broadcast channel for shutdown signal.
    shutdown_tx: broadcast::Sender<()>,
    /// Watch channel for checking if shutdown is in progress.
    shutdown_watch: watch::Receiver<bool>,
    /// Internal sender for watch channel.
    shutdown_watch_tx: Arc<watch::Sender<bool>>,
    /// Flag indicating if shutdown has been initiated.
    is_shutting_down: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let (shutdown_watch_tx, shutdown_watch) = watch::channel(false);

        Self {
            shutdown_tx,
            shutdown_watch,
            shutdown_watch_tx: Arc::new(shutdown_watch_tx),
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Subscribe to shutdown signals.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Get a watch receiver for shutdown status.
    pub fn watch(&self) -> watch::Receiver<bool> {
        self.shutdown_watch.clone()
    }

    /// Check if shutdown is in progress.
    pub fn is_shutting_down(&self) -> bool {
        self.is_shutting_down.load(Ordering::SeqCst)
    }

    /// Initiate shutdown. Returns `false` if shutdown was already initiated.
    pub fn shutdown(&self) -> bool {
        if self
            .is_shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            info!("Initiating shutdown");

            let _ = self.shutdown_watch_tx.send(true);
            let _ = self.shutdown_tx.send(());
            true
        } else {
            false
        }
    }

    /// Wait for shutdown signal (for use in select! macros).
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.shutdown_watch.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Extension trait for futures to make them shutdown-aware.
pub trait ShutdownAware: Sized {
    /// Run until completion or shutdown signal.
    fn with_shutdown(
        self,
        coordinator: &ShutdownCoordinator,
    ) -> impl Future<Output = Option<Self::Output>> + Send
    where
        Self: Future + Send,
        Self::Output: Send;
}

impl<F> ShutdownAware for F
where
    F: Future + Send,
    F::Output: Send,
{
    async fn with_shutdown(self, coordinator: &ShutdownCoordinator) -> Option<F::Output> {
        tokio::select! {
            biased;
            _ = coordinator.wait_for_shutdown() => {
                debug!("Task cancelled due to shutdown");
                None
            }
            result = self => Some(result),
        }
    }
}
