//! Cluster membership state machine.
//!
//! A [`DatabaseCluster`] owns the registered backends and decides which of
//! them are active. Membership changes follow two rules:
//!
//! - Activation (including synchronization) runs under the cluster's write
//!   lock, so no dispatched invocation, which holds the read side, can reach
//!   any backend while a new one is being brought in sync.
//! - Deactivation only takes the short membership mutex. It is triggered
//!   from inside dispatch (while the read lock is held) when a backend fails
//!   its liveness probe, so it must never wait for the write lock.
//!
//! Every change that actually alters the active set is persisted through the
//! cluster's [`StateStore`].

mod activation;
mod distributed;
mod pool;
mod sweep;

pub use distributed::DistributedCluster;
pub use pool::WorkerPool;
pub use sweep::SweepKind;

use crate::balancer::{self, Balancer};
use crate::config::{ClusterConfig, DatabaseDescriptor, LockConfig, PoolConfig};
use crate::database::{Database, Driver};
use crate::dialect::{Dialect, StandardDialect};
use crate::error::{BackendError, Result, TandemError};
use crate::lock::MembershipHandler;
use crate::observability;
use crate::scheduling::CronExpr;
use crate::shutdown::ShutdownCoordinator;
use crate::state::{self, StateStore};
use crate::sync::StrategyRegistry;
use crate::types::DatabaseId;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{RwLock as AsyncRwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of one registered database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseState {
    Inactive,
    /// Being synchronized, not yet eligible for dispatch.
    Activating,
    Active,
    Deactivating,
}

impl fmt::Display for DatabaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Inactive => "inactive",
            Self::Activating => "activating",
            Self::Active => "active",
            Self::Deactivating => "deactivating",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Default)]
struct Schedules {
    failure_detection: Option<CronExpr>,
    auto_activation: Option<CronExpr>,
}

/// A set of backends kept in lockstep.
pub struct DatabaseCluster {
    id: String,
    /// Registered databases, in registration order.
    databases: RwLock<Vec<Arc<Database>>>,
    states: Mutex<HashMap<DatabaseId, DatabaseState>>,
    balancer: Arc<dyn Balancer>,
    dialect: Arc<dyn Dialect>,
    driver: Arc<dyn Driver>,
    state_store: Arc<dyn StateStore>,
    strategies: StrategyRegistry,
    default_strategy: String,
    lock_config: LockConfig,
    /// Held for read by every invocation, for write by activation.
    cluster_lock: AsyncRwLock<()>,
    /// Serializes changes to the active set and the registered list.
    membership: Mutex<()>,
    pool: WorkerPool,
    schedules: Mutex<Schedules>,
    sweeps: Mutex<HashMap<SweepKind, JoinHandle<()>>>,
    shutdown: ShutdownCoordinator,
    started: AtomicBool,
}

impl DatabaseCluster {
    /// Build a cluster from configuration, registering every configured
    /// database as inactive.
    pub fn new(
        config: &ClusterConfig,
        driver: Arc<dyn Driver>,
        state_store: Arc<dyn StateStore>,
        strategies: StrategyRegistry,
    ) -> Result<Self> {
        config.validate()?;
        // Fail fast on a default strategy nobody registered
        strategies.get(&config.default_sync_strategy)?;

        let mut databases = Vec::with_capacity(config.databases.len());
        let mut states = HashMap::with_capacity(config.databases.len());
        for descriptor in &config.databases {
            let database = Database::from_descriptor(descriptor.clone(), driver.as_ref())?;
            states.insert(descriptor.id.clone(), DatabaseState::Inactive);
            databases.push(Arc::new(database));
        }

        let schedules = Schedules {
            failure_detection: config.failure_detection_cron()?,
            auto_activation: config.auto_activation_cron()?,
        };

        info!(
            cluster = %config.id,
            databases = databases.len(),
            balancer = ?config.balancer,
            "Created database cluster"
        );

        Ok(Self {
            id: config.id.clone(),
            databases: RwLock::new(databases),
            states: Mutex::new(states),
            balancer: balancer::create(config.balancer),
            dialect: Arc::new(StandardDialect),
            driver,
            state_store,
            strategies,
            default_strategy: config.default_sync_strategy.clone(),
            lock_config: config.lock,
            cluster_lock: AsyncRwLock::new(()),
            membership: Mutex::new(()),
            pool: WorkerPool::new(config.pool),
            schedules: Mutex::new(schedules),
            sweeps: Mutex::new(HashMap::new()),
            shutdown: ShutdownCoordinator::new(),
            started: AtomicBool::new(false),
        })
    }

    /// Replace the dialect used for liveness probes and table locks.
    pub fn with_dialect(mut self, dialect: Arc<dyn Dialect>) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn balancer(&self) -> &Arc<dyn Balancer> {
        &self.balancer
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect.as_ref()
    }

    pub fn strategies(&self) -> &StrategyRegistry {
        &self.strategies
    }

    pub fn default_strategy(&self) -> &str {
        &self.default_strategy
    }

    pub fn lock_config(&self) -> &LockConfig {
        &self.lock_config
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn shutdown(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Shared side of the cluster-wide lock.
    pub async fn read_lock(&self) -> RwLockReadGuard<'_, ()> {
        self.cluster_lock.read().await
    }

    /// Exclusive side of the cluster-wide lock.
    pub async fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.cluster_lock.write().await
    }

    // Membership queries

    /// Look up a registered database.
    pub fn database(&self, id: &DatabaseId) -> Result<Arc<Database>> {
        self.find(id)
            .ok_or_else(|| TandemError::UnknownDatabase(id.clone()))
    }

    /// All registered databases, in registration order.
    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.databases.read().clone()
    }

    /// Active database ids, in activation order.
    pub fn active_databases(&self) -> Vec<DatabaseId> {
        self.balancer
            .all()
            .iter()
            .map(|db| db.id().clone())
            .collect()
    }

    /// Registered databases that are not active, in registration order.
    pub fn inactive_databases(&self) -> Vec<DatabaseId> {
        self.inactive()
            .into_iter()
            .map(|db| db.id().clone())
            .collect()
    }

    pub fn state(&self, id: &DatabaseId) -> Option<DatabaseState> {
        self.states.lock().get(id).copied()
    }

    /// Probe a registered database.
    pub async fn is_alive(&self, id: &DatabaseId) -> Result<bool> {
        let database = self.database(id)?;
        Ok(database.is_alive(self.dialect.as_ref()).await)
    }

    // Administrative transitions

    /// Activate `id` using the default synchronization strategy.
    pub async fn activate(&self, id: &DatabaseId) -> Result<bool> {
        let strategy = self.default_strategy.clone();
        self.activate_with(id, &strategy).await
    }

    /// Activate `id`, synchronizing it with `strategy_id` first when other
    /// databases are already active.
    ///
    /// Returns `false` if the database was already active or is not alive.
    /// A failed synchronization leaves it inactive and is returned as an
    /// error.
    pub async fn activate_with(&self, id: &DatabaseId, strategy_id: &str) -> Result<bool> {
        self.ensure_running()?;
        let database = self.database(id)?;
        let strategy = self.strategies.get(strategy_id)?;

        if self.balancer.contains(id) {
            return Ok(false);
        }
        if !database.is_alive(self.dialect.as_ref()).await {
            debug!(cluster = %self.id, database = %id, "Not activating database that failed liveness probe");
            return Ok(false);
        }

        let _guard = self.cluster_lock.write().await;
        if self.balancer.contains(id) {
            return Ok(false);
        }
        self.set_state(id, DatabaseState::Activating);

        if !self.balancer.is_empty() {
            if let Err(e) = self.synchronize(&database, strategy.as_ref()).await {
                self.set_state(id, DatabaseState::Inactive);
                self.log_activation_failure(id, &e);
                return Err(e);
            }
        }

        Ok(self.admit(&database, true))
    }

    /// Deactivate `id`. Returns whether the active set changed.
    pub fn deactivate(&self, id: &DatabaseId) -> Result<bool> {
        let database = self.database(id)?;
        Ok(self.deactivate_database(&database))
    }

    /// Classify a failed operation against `database`.
    ///
    /// A database that still answers its liveness probe stays active and the
    /// original error is returned to the caller. A dead one is deactivated
    /// and the error is swallowed.
    pub async fn handle_failure(&self, database: &Database, error: BackendError) -> Result<()> {
        if database.is_alive(self.dialect.as_ref()).await {
            return Err(TandemError::backend(database.id(), error));
        }

        error!(
            cluster = %self.id,
            database = %database.id(),
            error = %error,
            "Database failed liveness probe after error, deactivating"
        );
        self.deactivate_database(database);
        Ok(())
    }

    /// Register a new database as inactive.
    pub fn add(&self, descriptor: DatabaseDescriptor) -> Result<Arc<Database>> {
        descriptor.validate()?;
        let _membership = self.membership.lock();
        if self.find(&descriptor.id).is_some() {
            return Err(TandemError::DuplicateDatabase(descriptor.id));
        }

        let database = Arc::new(Database::from_descriptor(descriptor, self.driver.as_ref())?);
        database.mark_dirty();
        self.databases.write().push(database.clone());
        self.states
            .lock()
            .insert(database.id().clone(), DatabaseState::Inactive);
        self.update_gauges();

        info!(cluster = %self.id, database = %database.id(), "Added database");
        Ok(database)
    }

    /// Unregister an inactive database.
    pub fn remove(&self, id: &DatabaseId) -> Result<Arc<Database>> {
        let _membership = self.membership.lock();
        // A database being activated is not in the balancer yet but must not
        // be unregistered under the activation
        match self.state(id) {
            Some(DatabaseState::Inactive) | None => {}
            Some(_) => return Err(TandemError::DatabaseStillActive(id.clone())),
        }

        let removed = {
            let mut databases = self.databases.write();
            let index = databases
                .iter()
                .position(|db| db.id() == id)
                .ok_or_else(|| TandemError::UnknownDatabase(id.clone()))?;
            databases.remove(index)
        };
        self.states.lock().remove(id);
        self.update_gauges();

        info!(cluster = %self.id, database = %id, "Removed database");
        Ok(removed)
    }

    // Lifecycle

    /// Seed membership and start the background sweeps.
    ///
    /// A valid persisted record is trusted as is. Without one, every
    /// registered database is probed and the live ones are activated in
    /// registration order.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.ensure_running()?;
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.load_state()? {
            Some(databases) => {
                let _guard = self.cluster_lock.write().await;
                for database in &databases {
                    self.admit(database, false);
                }
                info!(
                    cluster = %self.id,
                    active = databases.len(),
                    "Restored persisted cluster state"
                );
            }
            None => {
                for database in self.databases() {
                    if self.balancer.contains(database.id()) {
                        continue;
                    }
                    match self.activate(database.id()).await {
                        Ok(true) => {}
                        Ok(false) => {
                            debug!(cluster = %self.id, database = %database.id(), "Database not activated at startup")
                        }
                        Err(e) => {
                            error!(cluster = %self.id, database = %database.id(), error = %e, "Failed to activate database at startup")
                        }
                    }
                }
            }
        }

        self.schedule(SweepKind::FailureDetection);
        self.schedule(SweepKind::AutoActivation);

        info!(
            cluster = %self.id,
            active = self.balancer.all().len(),
            "Started database cluster"
        );
        Ok(())
    }

    /// Cancel all in-flight dispatch and background sweeps.
    ///
    /// Outstanding work is abandoned, not drained.
    pub fn stop(&self) {
        if self.shutdown.shutdown() {
            info!(cluster = %self.id, "Stopping database cluster");
        }
        for (kind, handle) in self.sweeps.lock().drain() {
            debug!(cluster = %self.id, sweep = %kind, "Cancelling sweep");
            handle.abort();
        }
        self.started.store(false, Ordering::Release);
    }

    /// Read the persisted active set.
    ///
    /// Returns `None` when nothing was persisted, or when the record names a
    /// database that is not registered; such a record is discarded.
    pub fn load_state(&self) -> Result<Option<Vec<Arc<Database>>>> {
        let Some(record) = self.state_store.load(&self.id)? else {
            return Ok(None);
        };

        let ids = state::decode(&record);
        let mut databases = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.find(id) {
                Some(database) => databases.push(database),
                None => {
                    warn!(
                        cluster = %self.id,
                        database = %id,
                        record = %record,
                        "Persisted state names an unknown database, discarding it"
                    );
                    if let Err(e) = self.state_store.remove(&self.id) {
                        warn!(cluster = %self.id, error = %e, "Failed to discard persisted state");
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(databases))
    }

    // Pool sizing

    pub fn min_threads(&self) -> usize {
        self.pool.min_threads()
    }

    pub fn set_min_threads(&self, min_threads: usize) -> Result<()> {
        self.pool.set_min_threads(min_threads)
    }

    pub fn max_threads(&self) -> usize {
        self.pool.max_threads()
    }

    pub fn set_max_threads(&self, max_threads: usize) -> Result<()> {
        self.pool.set_max_threads(max_threads)
    }

    pub fn max_idle(&self) -> u64 {
        self.pool.max_idle()
    }

    pub fn set_max_idle(&self, max_idle: u64) {
        self.pool.set_max_idle(max_idle)
    }

    pub fn pool_config(&self) -> PoolConfig {
        self.pool.config()
    }

    // Schedules

    pub fn failure_detection_schedule(&self) -> Option<String> {
        self.schedules
            .lock()
            .failure_detection
            .as_ref()
            .map(|cron| cron.as_str().to_string())
    }

    /// Change or clear the failure-detection schedule. A running sweep is
    /// rescheduled immediately.
    pub fn set_failure_detection_schedule(self: &Arc<Self>, schedule: Option<&str>) -> Result<()> {
        let cron = schedule.map(CronExpr::parse).transpose()?;
        self.schedules.lock().failure_detection = cron;
        if self.is_started() {
            self.schedule(SweepKind::FailureDetection);
        }
        Ok(())
    }

    pub fn auto_activation_schedule(&self) -> Option<String> {
        self.schedules
            .lock()
            .auto_activation
            .as_ref()
            .map(|cron| cron.as_str().to_string())
    }

    /// Change or clear the auto-activation schedule. A running sweep is
    /// rescheduled immediately.
    pub fn set_auto_activation_schedule(self: &Arc<Self>, schedule: Option<&str>) -> Result<()> {
        let cron = schedule.map(CronExpr::parse).transpose()?;
        self.schedules.lock().auto_activation = cron;
        if self.is_started() {
            self.schedule(SweepKind::AutoActivation);
        }
        Ok(())
    }

    // Internals

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.shutdown.is_shutting_down() {
            Err(TandemError::Shutdown)
        } else {
            Ok(())
        }
    }

    pub(crate) fn no_active_database(&self) -> TandemError {
        TandemError::NoActiveDatabase {
            cluster: self.id.clone(),
        }
    }

    fn find(&self, id: &DatabaseId) -> Option<Arc<Database>> {
        self.databases
            .read()
            .iter()
            .find(|db| db.id() == id)
            .cloned()
    }

    fn inactive(&self) -> Vec<Arc<Database>> {
        self.databases
            .read()
            .iter()
            .filter(|db| !self.balancer.contains(db.id()))
            .cloned()
            .collect()
    }

    fn schedule_for(&self, kind: SweepKind) -> Option<CronExpr> {
        let schedules = self.schedules.lock();
        match kind {
            SweepKind::FailureDetection => schedules.failure_detection.clone(),
            SweepKind::AutoActivation => schedules.auto_activation.clone(),
        }
    }

    /// Update the state of a registered database. Unregistered ids are
    /// ignored.
    fn set_state(&self, id: &DatabaseId, state: DatabaseState) {
        if let Some(current) = self.states.lock().get_mut(id) {
            *current = state;
        }
    }

    /// Add `database` to the active set.
    fn admit(&self, database: &Arc<Database>, persist: bool) -> bool {
        let _membership = self.membership.lock();
        let id = database.id();
        if !self.find(id).is_some_and(|registered| Arc::ptr_eq(&registered, database)) {
            warn!(cluster = %self.id, database = %id, "Not admitting database that is no longer registered");
            return false;
        }
        if !self.balancer.add(database.clone()) {
            return false;
        }
        self.set_state(id, DatabaseState::Active);

        if database.clean() {
            info!(cluster = %self.id, database = %id, "Exported updated descriptor for activated database");
        }
        if persist {
            self.store_state();
        }

        observability::record_activation(&self.id, id);
        self.update_gauges();
        info!(cluster = %self.id, database = %id, "Activated database");
        true
    }

    /// Remove `database` from the active set.
    fn deactivate_database(&self, database: &Database) -> bool {
        let _membership = self.membership.lock();
        let id = database.id();
        if !self.balancer.contains(id) {
            return false;
        }

        self.set_state(id, DatabaseState::Deactivating);
        let removed = self.balancer.remove(id);
        self.set_state(id, DatabaseState::Inactive);

        if removed {
            self.store_state();
            observability::record_deactivation(&self.id, id);
            self.update_gauges();
            info!(cluster = %self.id, database = %id, "Deactivated database");
        }
        removed
    }

    /// Persist the active set. Failures are logged, never returned.
    fn store_state(&self) {
        let record = state::encode(self.balancer.all().iter().map(|db| db.id()));
        if let Err(e) = self.state_store.store(&self.id, &record) {
            warn!(cluster = %self.id, error = %e, "Failed to persist cluster state");
        }
    }

    fn update_gauges(&self) {
        let total = self.databases.read().len();
        let active = self.balancer.all().len();
        observability::update_membership(&self.id, active, total.saturating_sub(active));
    }

    fn log_activation_failure(&self, id: &DatabaseId, error: &TandemError) {
        match error {
            TandemError::Synchronization { source, .. } => {
                for (depth, cause) in source.iter().enumerate() {
                    error!(
                        cluster = %self.id,
                        database = %id,
                        depth,
                        sql_state = cause.sql_state.as_deref().unwrap_or(""),
                        error = %cause,
                        "Failed to activate database"
                    );
                }
            }
            other => {
                error!(cluster = %self.id, database = %id, error = %other, "Failed to activate database")
            }
        }
    }
}

impl fmt::Debug for DatabaseCluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCluster")
            .field("id", &self.id)
            .field("active", &self.active_databases())
            .field("inactive", &self.inactive_databases())
            .finish()
    }
}

#[async_trait]
impl MembershipHandler for DatabaseCluster {
    async fn apply_activation(&self, database: &DatabaseId) -> Result<bool> {
        self.ensure_running()?;
        let database = self.database(database)?;
        let _guard = self.cluster_lock.write().await;
        Ok(self.admit(&database, true))
    }

    async fn apply_deactivation(&self, database: &DatabaseId) -> Result<bool> {
        self.deactivate(database)
    }
}
