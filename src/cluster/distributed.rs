//! Membership changes replicated across cooperating nodes.

use super::DatabaseCluster;
use crate::error::Result;
use crate::lock::{Decree, DecreeExecutor, DistributedLockManager, GroupChannel, LockManager};
use crate::types::DatabaseId;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// A [`DatabaseCluster`] whose administrative transitions are serialized
/// and replicated through the lock decree protocol.
///
/// Activation and deactivation take the cluster-wide lock named after the
/// cluster id, perform the transition locally, then broadcast a membership
/// decree so every other node applies the same change without repeating
/// the synchronization.
pub struct DistributedCluster {
    cluster: Arc<DatabaseCluster>,
    locks: DistributedLockManager,
    executor: Arc<DecreeExecutor>,
}

impl DistributedCluster {
    /// Wrap `cluster` and register it with this node's decree executor so
    /// membership decrees from other nodes reach it.
    pub fn new(
        cluster: Arc<DatabaseCluster>,
        channel: Arc<dyn GroupChannel>,
        executor: Arc<DecreeExecutor>,
    ) -> Self {
        executor.register_cluster(cluster.id(), cluster.clone());
        let locks = DistributedLockManager::new(channel, *cluster.lock_config());
        Self {
            cluster,
            locks,
            executor,
        }
    }

    pub fn cluster(&self) -> &Arc<DatabaseCluster> {
        &self.cluster
    }

    pub fn locks(&self) -> &DistributedLockManager {
        &self.locks
    }

    pub async fn start(&self) -> Result<()> {
        self.cluster.start().await
    }

    /// Stop the local cluster and stop applying remote membership decrees.
    pub fn stop(&self) {
        self.executor.unregister_cluster(self.cluster.id());
        self.cluster.stop();
    }

    pub async fn activate(&self, id: &DatabaseId) -> Result<bool> {
        let strategy = self.cluster.default_strategy().to_string();
        self.activate_with(id, &strategy).await
    }

    pub async fn activate_with(&self, id: &DatabaseId, strategy_id: &str) -> Result<bool> {
        let decree = Decree::Activate {
            cluster_id: self.cluster.id().to_string(),
            database: id.clone(),
            origin: self.locks.local_address().clone(),
        };
        self.exclusively(self.cluster.activate_with(id, strategy_id), decree)
            .await
    }

    pub async fn deactivate(&self, id: &DatabaseId) -> Result<bool> {
        let decree = Decree::Deactivate {
            cluster_id: self.cluster.id().to_string(),
            database: id.clone(),
            origin: self.locks.local_address().clone(),
        };
        self.exclusively(async { self.cluster.deactivate(id) }, decree)
            .await
    }

    /// Run `transition` while holding the cluster-wide lock, replicating
    /// `decree` if the transition changed local membership.
    async fn exclusively<F>(&self, transition: F, decree: Decree) -> Result<bool>
    where
        F: Future<Output = Result<bool>>,
    {
        let lock_id = self.cluster.id();
        self.locks.acquire(lock_id).await?;
        let result = transition.await;
        if let Ok(true) = result {
            self.replicate(decree).await;
        }
        if let Err(e) = self.locks.release(lock_id).await {
            warn!(cluster = %lock_id, error = %e, "Failed to release cluster-wide lock");
        }
        result
    }

    async fn replicate(&self, decree: Decree) {
        let outcome = self.locks.execute(decree.clone()).await;
        if outcome.unacknowledged.is_empty() {
            debug!(cluster = %self.cluster.id(), decree = %decree, "Replicated membership change");
        } else {
            warn!(
                cluster = %self.cluster.id(),
                decree = %decree,
                members = ?outcome.unacknowledged,
                "Membership change not acknowledged by every node"
            );
        }
    }
}
