//! Shared worker pool for fanning invocations out to backends.

use crate::config::PoolConfig;
use crate::error::{Result, TandemError};
use crate::shutdown::{ShutdownAware, ShutdownCoordinator};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

/// Bounds how many backend tasks run at once.
///
/// `max_threads` is enforced through a semaphore. Resizing swaps in a new
/// semaphore; tasks already holding a permit from the old one finish
/// unaffected. `min_threads` and `max_idle` are kept for the administrative
/// surface; the runtime owns the actual worker threads.
pub struct WorkerPool {
    config: RwLock<PoolConfig>,
    semaphore: RwLock<Arc<Semaphore>>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            semaphore: RwLock::new(Arc::new(Semaphore::new(config.max_threads))),
            config: RwLock::new(config),
        }
    }

    pub fn config(&self) -> PoolConfig {
        *self.config.read()
    }

    pub fn min_threads(&self) -> usize {
        self.config.read().min_threads
    }

    pub fn max_threads(&self) -> usize {
        self.config.read().max_threads
    }

    pub fn max_idle(&self) -> u64 {
        self.config.read().max_idle
    }

    pub fn set_min_threads(&self, min_threads: usize) -> Result<()> {
        let mut config = self.config.write();
        let updated = PoolConfig {
            min_threads,
            ..*config
        };
        updated.validate()?;
        *config = updated;
        Ok(())
    }

    pub fn set_max_threads(&self, max_threads: usize) -> Result<()> {
        let mut config = self.config.write();
        let updated = PoolConfig {
            max_threads,
            ..*config
        };
        updated.validate()?;
        *config = updated;
        *self.semaphore.write() = Arc::new(Semaphore::new(max_threads));
        debug!(max_threads, "Resized worker pool");
        Ok(())
    }

    pub fn set_max_idle(&self, max_idle: u64) {
        self.config.write().max_idle = max_idle;
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.semaphore.read().available_permits()
    }

    /// Run `task` once a permit is free. The task is abandoned with
    /// [`TandemError::Shutdown`] as soon as `shutdown` fires.
    pub fn spawn<F, T>(&self, shutdown: &ShutdownCoordinator, task: F) -> JoinHandle<Result<T>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let semaphore = self.semaphore.read().clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let work = async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|_| TandemError::Shutdown)?;
                Ok(task.await)
            };
            work.with_shutdown(&shutdown)
                .await
                .unwrap_or(Err(TandemError::Shutdown))
        })
    }
}
