//! Synchronization strategies.
//!
//! A strategy brings an inactive backend's contents into agreement with an
//! active one before the inactive backend is admitted. The cluster always
//! invokes it while holding its write lock; when the strategy asks for it,
//! the cluster also holds every table of every active backend locked for the
//! duration.

use crate::config::PASSIVE_STRATEGY;
use crate::database::Connection;
use crate::dialect::Dialect;
use crate::error::{BackendError, Result, TandemError};
use crate::types::{DatabaseId, SchemaMap};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Everything a strategy needs for one synchronization.
pub struct SynchronizationContext<'a> {
    /// Backend being brought up to date.
    pub target_id: &'a DatabaseId,
    pub target: &'a mut dyn Connection,
    /// Active backend used as the reference copy.
    pub source_id: &'a DatabaseId,
    pub source: &'a mut dyn Connection,
    /// Tables discovered on the target, per schema.
    pub schema_map: &'a SchemaMap,
    pub dialect: &'a dyn Dialect,
}

/// Brings one backend in sync with another.
#[async_trait]
pub trait SynchronizationStrategy: Send + Sync {
    /// Identifier used to select this strategy.
    fn id(&self) -> &str;

    /// Reproduce the source's data on the target.
    async fn synchronize(
        &self,
        context: SynchronizationContext<'_>,
    ) -> std::result::Result<(), BackendError>;

    /// Whether every active backend's tables must stay locked while this runs.
    fn requires_table_locking(&self) -> bool;
}

/// Assumes the target is already in sync and does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassiveSynchronizationStrategy;

#[async_trait]
impl SynchronizationStrategy for PassiveSynchronizationStrategy {
    fn id(&self) -> &str {
        PASSIVE_STRATEGY
    }

    async fn synchronize(
        &self,
        context: SynchronizationContext<'_>,
    ) -> std::result::Result<(), BackendError> {
        debug!(
            database = %context.target_id,
            source = %context.source_id,
            "Passive synchronization, nothing to copy"
        );
        Ok(())
    }

    fn requires_table_locking(&self) -> bool {
        false
    }
}

/// Registered strategies by id.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<String, Arc<dyn SynchronizationStrategy>>,
}

impl StrategyRegistry {
    /// An empty registry.
    pub fn empty() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Register a strategy, replacing any with the same id.
    pub fn register(&mut self, strategy: Arc<dyn SynchronizationStrategy>) {
        self.strategies.insert(strategy.id().to_string(), strategy);
    }

    pub fn with(mut self, strategy: Arc<dyn SynchronizationStrategy>) -> Self {
        self.register(strategy);
        self
    }

    /// Look up a strategy.
    pub fn get(&self, id: &str) -> Result<Arc<dyn SynchronizationStrategy>> {
        self.strategies
            .get(id)
            .cloned()
            .ok_or_else(|| TandemError::UnknownStrategy(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.strategies.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.strategies.keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Default for StrategyRegistry {
    /// A registry containing the passive strategy.
    fn default() -> Self {
        Self::empty().with(Arc::new(PassiveSynchronizationStrategy))
    }
}
