//! Synchronization of a database that is about to be activated.

use super::DatabaseCluster;
use crate::database::{Connection, Database};
use crate::error::{BackendError, Result, TandemError};
use crate::sync::{SynchronizationContext, SynchronizationStrategy};
use crate::types::{IsolationLevel, SchemaMap};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A connection to an active database held open for one synchronization.
struct HeldConnection {
    database: Arc<Database>,
    connection: Box<dyn Connection>,
    /// Auto-commit mode to restore on release.
    auto_commit: bool,
    /// Whether the connection was switched into locking mode.
    locked: bool,
}

impl HeldConnection {
    async fn open(database: &Arc<Database>) -> std::result::Result<Self, BackendError> {
        let connection = database.connect().await?;
        Ok(Self {
            database: database.clone(),
            auto_commit: connection.auto_commit(),
            connection,
            locked: false,
        })
    }

    /// Open a transaction and lock every table in it.
    async fn lock(&mut self, statements: &[String]) -> std::result::Result<(), BackendError> {
        // Set first so a partial lock is still rolled back
        self.locked = true;
        self.connection.set_auto_commit(false).await?;
        self.connection
            .set_isolation(IsolationLevel::ReadCommitted)
            .await?;
        for sql in statements {
            self.connection.execute(sql).await?;
        }
        Ok(())
    }

    async fn release(mut self, cluster: &str) {
        let id = self.database.id();
        if self.locked {
            if let Err(e) = self.connection.rollback().await {
                warn!(cluster, database = %id, error = %e, "Failed to roll back table locks");
            }
            if let Err(e) = self.connection.set_auto_commit(self.auto_commit).await {
                warn!(cluster, database = %id, error = %e, "Failed to restore auto-commit");
            }
        }
        if let Err(e) = self.connection.close().await {
            warn!(cluster, database = %id, error = %e, "Failed to close connection");
        }
    }
}

impl DatabaseCluster {
    /// Bring `target` in sync with an active database.
    ///
    /// Runs with the cluster write lock held. When the strategy needs it,
    /// every table of every active database stays locked until the strategy
    /// returns; those locks are rolled back whatever the outcome.
    pub(super) async fn synchronize(
        &self,
        target: &Arc<Database>,
        strategy: &dyn SynchronizationStrategy,
    ) -> Result<()> {
        let source = self
            .balancer
            .next()
            .ok_or_else(|| self.no_active_database())?;

        let locking = strategy.requires_table_locking();
        let mut participants: Vec<Arc<Database>> = if locking {
            self.balancer.all().to_vec()
        } else {
            Vec::new()
        };
        if !participants.iter().any(|db| db.id() == source.id()) {
            participants.push(source.clone());
        }

        info!(
            cluster = %self.id,
            database = %target.id(),
            source = %source.id(),
            strategy = strategy.id(),
            locking,
            "Synchronizing database"
        );

        let failed = |source: BackendError| TandemError::Synchronization {
            database: target.id().clone(),
            source,
        };

        let mut target_connection = target.connect().await.map_err(failed)?;
        let mut held = Vec::with_capacity(participants.len());

        let outcome = self
            .run_strategy(
                target,
                target_connection.as_mut(),
                &source,
                &participants,
                strategy,
                &mut held,
            )
            .await;

        for connection in held {
            connection.release(&self.id).await;
        }
        if let Err(e) = target_connection.close().await {
            warn!(cluster = %self.id, database = %target.id(), error = %e, "Failed to close connection");
        }

        outcome.map_err(failed)?;
        info!(cluster = %self.id, database = %target.id(), source = %source.id(), "Synchronized database");
        Ok(())
    }

    async fn run_strategy(
        &self,
        target: &Arc<Database>,
        target_connection: &mut dyn Connection,
        source: &Arc<Database>,
        participants: &[Arc<Database>],
        strategy: &dyn SynchronizationStrategy,
        held: &mut Vec<HeldConnection>,
    ) -> std::result::Result<(), BackendError> {
        let schema_map = SchemaMap::from_tables(target_connection.tables().await?);

        // Same statements for every participant, computed once
        let lock_statements: Vec<String> = if strategy.requires_table_locking() {
            schema_map
                .tables()
                .map(|(schema, table)| self.dialect.lock_table_sql(schema, table))
                .collect()
        } else {
            Vec::new()
        };

        for database in participants {
            let mut connection = HeldConnection::open(database).await?;
            let locked = if strategy.requires_table_locking() {
                connection.lock(&lock_statements).await
            } else {
                Ok(())
            };
            held.push(connection);
            if let Err(e) = locked {
                warn!(cluster = %self.id, database = %database.id(), error = %e, "Failed to lock tables");
                return Err(e);
            }
            debug!(
                cluster = %self.id,
                database = %database.id(),
                tables = lock_statements.len(),
                "Holding connection for synchronization"
            );
        }

        let source_connection = held
            .iter_mut()
            .find(|held| held.database.id() == source.id())
            .ok_or_else(|| BackendError::new(format!("no connection to source {}", source.id())))?;

        strategy
            .synchronize(SynchronizationContext {
                target_id: target.id(),
                target: target_connection,
                source_id: source.id(),
                source: source_connection.connection.as_mut(),
                schema_map: &schema_map,
                dialect: self.dialect.as_ref(),
            })
            .await
    }
}
