//! Scheduled failure detection and auto-activation.

use super::DatabaseCluster;
use crate::error::TandemError;
use crate::types::DatabaseId;
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Background sweeps a cluster can run on a cron schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SweepKind {
    /// Probe every active database and deactivate the dead ones.
    FailureDetection,
    /// Try to activate every inactive database.
    AutoActivation,
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FailureDetection => f.write_str("failure-detection"),
            Self::AutoActivation => f.write_str("auto-activation"),
        }
    }
}

impl DatabaseCluster {
    /// Probe every active database once, deactivating those that fail.
    ///
    /// Returns the databases deactivated by this sweep.
    pub async fn detect_failures(&self) -> Vec<DatabaseId> {
        let mut failed = Vec::new();
        for database in self.balancer.all().iter() {
            if self.shutdown.is_shutting_down() {
                debug!(cluster = %self.id, "Failure detection interrupted");
                break;
            }
            if database.is_alive(self.dialect.as_ref()).await {
                continue;
            }
            if self.deactivate_database(database) {
                error!(cluster = %self.id, database = %database.id(), "Database failed liveness probe, deactivated");
                failed.push(database.id().clone());
            }
        }
        failed
    }

    /// Try once to activate every inactive database with the default
    /// strategy. Errors are logged, never returned.
    ///
    /// Returns the databases activated by this sweep.
    pub async fn activate_inactive(&self) -> Vec<DatabaseId> {
        let mut activated = Vec::new();
        for database in self.inactive() {
            if self.shutdown.is_shutting_down() {
                debug!(cluster = %self.id, "Auto-activation interrupted");
                break;
            }
            match self.activate(database.id()).await {
                Ok(true) => activated.push(database.id().clone()),
                Ok(false) => {}
                Err(TandemError::Shutdown) | Err(TandemError::Interrupted) => {
                    debug!(cluster = %self.id, "Auto-activation interrupted");
                    break;
                }
                Err(e) => {
                    error!(cluster = %self.id, database = %database.id(), error = %e, "Auto-activation failed")
                }
            }
        }
        activated
    }

    async fn run_sweep(&self, kind: SweepKind) {
        let changed = match kind {
            SweepKind::FailureDetection => self.detect_failures().await,
            SweepKind::AutoActivation => self.activate_inactive().await,
        };
        if changed.is_empty() {
            debug!(cluster = %self.id, sweep = %kind, "Sweep finished");
        } else {
            info!(cluster = %self.id, sweep = %kind, databases = ?changed, "Sweep changed membership");
        }
    }

    /// (Re)start the sweep of `kind` from the current schedule, or stop it if
    /// none is configured.
    pub(super) fn schedule(self: &Arc<Self>, kind: SweepKind) {
        let cron = self.schedule_for(kind);
        let mut sweeps = self.sweeps.lock();
        if let Some(previous) = sweeps.remove(&kind) {
            previous.abort();
        }
        let Some(cron) = cron else {
            return;
        };
        if self.shutdown.is_shutting_down() {
            return;
        }

        info!(cluster = %self.id, sweep = %kind, schedule = %cron, "Scheduling sweep");
        let cluster = Arc::downgrade(self);
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            loop {
                let Some(delay) = cron.until_next(&Utc::now()) else {
                    warn!(sweep = %kind, schedule = %cron, "Schedule has no future runs");
                    break;
                };
                tokio::select! {
                    _ = shutdown.wait_for_shutdown() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
                let Some(cluster) = cluster.upgrade() else {
                    break;
                };
                cluster.run_sweep(kind).await;
            }
        });
        sweeps.insert(kind, handle);
    }
}
