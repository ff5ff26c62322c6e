// Cluster fixtures for integration tests

use super::backend::{MockBackend, MockDriver};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tandem::config::{ClusterConfig, DatabaseDescriptor};
use tandem::state::{MemoryStateStore, StateStore};
use tandem::sync::{StrategyRegistry, SynchronizationContext, SynchronizationStrategy};
use tandem::types::DatabaseId;
use tandem::{BackendError, DatabaseCluster};

pub const RECORDING_STRATEGY: &str = "recording";

/// One call to [`RecordingStrategy::synchronize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncCall {
    pub target: DatabaseId,
    pub source: DatabaseId,
    pub tables: usize,
}

/// Synchronization strategy that records its calls and copies nothing.
pub struct RecordingStrategy {
    locking: bool,
    delay: Mutex<Option<Duration>>,
    failure: Mutex<Option<BackendError>>,
    calls: Mutex<Vec<SyncCall>>,
}

impl RecordingStrategy {
    pub fn new(locking: bool) -> Arc<Self> {
        Arc::new(Self {
            locking,
            delay: Mutex::new(None),
            failure: Mutex::new(None),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<SyncCall> {
        self.calls.lock().clone()
    }

    pub fn fail_with(&self, error: BackendError) {
        *self.failure.lock() = Some(error);
    }

    pub fn succeed(&self) {
        *self.failure.lock() = None;
    }

    /// Make each synchronization take at least `delay`.
    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }
}

#[async_trait]
impl SynchronizationStrategy for RecordingStrategy {
    fn id(&self) -> &str {
        RECORDING_STRATEGY
    }

    async fn synchronize(&self, context: SynchronizationContext<'_>) -> Result<(), BackendError> {
        self.calls.lock().push(SyncCall {
            target: context.target_id.clone(),
            source: context.source_id.clone(),
            tables: context.schema_map.table_count(),
        });

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // Touch both sides so tests can see the strategy ran on them
        context.source.execute("SELECT * FROM public.orders").await?;
        context.target.execute("INSERT INTO public.orders SELECT 1").await?;

        let failure = self.failure.lock().clone();
        match failure {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn requires_table_locking(&self) -> bool {
        self.locking
    }
}

/// Configuration for a cluster of `mock://` databases.
pub fn cluster_config(id: &str, databases: &[&str]) -> ClusterConfig {
    ClusterConfig {
        id: id.to_string(),
        databases: databases
            .iter()
            .map(|db| DatabaseDescriptor::new(*db, format!("mock://{}", db)))
            .collect(),
        default_sync_strategy: RECORDING_STRATEGY.to_string(),
        ..ClusterConfig::default()
    }
}

/// A cluster wired to mock backends, a memory state store and a
/// table-locking [`RecordingStrategy`] as its default strategy.
pub struct TestCluster {
    pub cluster: Arc<DatabaseCluster>,
    pub driver: Arc<MockDriver>,
    pub store: Arc<MemoryStateStore>,
    pub strategy: Arc<RecordingStrategy>,
}

impl TestCluster {
    pub fn new(databases: &[&str]) -> Self {
        Self::with_config(cluster_config("test", databases), Arc::new(MemoryStateStore::new()))
    }

    pub fn with_store(databases: &[&str], store: Arc<MemoryStateStore>) -> Self {
        Self::with_config(cluster_config("test", databases), store)
    }

    pub fn with_config(config: ClusterConfig, store: Arc<MemoryStateStore>) -> Self {
        let driver = MockDriver::new();
        let strategy = RecordingStrategy::new(true);
        let cluster = DatabaseCluster::new(
            &config,
            driver.clone(),
            store.clone(),
            StrategyRegistry::default().with(strategy.clone()),
        )
        .expect("valid test cluster");

        Self {
            cluster: Arc::new(cluster),
            driver,
            store,
            strategy,
        }
    }

    pub fn backend(&self, id: &str) -> Arc<MockBackend> {
        self.driver.backend(id)
    }

    /// The persisted record of this cluster.
    pub fn persisted(&self) -> Option<String> {
        self.store.load(self.cluster.id()).expect("memory store never fails")
    }

    /// Activate each database in order, asserting each one joins.
    pub async fn activate_all(&self, databases: &[&str]) {
        for db in databases {
            let activated = self
                .cluster
                .activate(&DatabaseId::new(*db))
                .await
                .expect("activation");
            assert!(activated, "{} should activate", db);
        }
    }
}

pub fn ids(ids: &[&str]) -> Vec<DatabaseId> {
    ids.iter().map(|id| DatabaseId::new(*id)).collect()
}
