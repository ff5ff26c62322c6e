//! Node-local named exclusive locks.

use super::LockManager;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Guard for a held local lock. The lock is released when dropped.
pub type LocalLockGuard = OwnedMutexGuard<()>;

/// Named exclusive locks held within one process.
#[derive(Default)]
pub struct LocalLockManager {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Guards taken through the [`LockManager`] interface, by name.
    held: Mutex<HashMap<String, LocalLockGuard>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, name: &str) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Take the lock without waiting. Returns `None` if it is held.
    pub fn try_lock(&self, name: &str) -> Option<LocalLockGuard> {
        self.entry(name).try_lock_owned().ok()
    }

    /// Wait for the lock.
    pub async fn lock(&self, name: &str) -> LocalLockGuard {
        self.entry(name).lock_owned().await
    }

    /// Whether the lock is currently held by anyone.
    pub fn is_locked(&self, name: &str) -> bool {
        match self.locks.lock().get(name) {
            Some(lock) => lock.try_lock().is_err(),
            None => false,
        }
    }
}

#[async_trait]
impl LockManager for LocalLockManager {
    async fn acquire(&self, lock_id: &str) -> Result<()> {
        let guard = self.lock(lock_id).await;
        self.held.lock().insert(lock_id.to_string(), guard);
        debug!(lock = lock_id, "Acquired local lock");
        Ok(())
    }

    async fn release(&self, lock_id: &str) -> Result<()> {
        if self.held.lock().remove(lock_id).is_some() {
            debug!(lock = lock_id, "Released local lock");
        }
        Ok(())
    }
}
