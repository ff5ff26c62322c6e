//! Backend descriptors and the connectivity contract.
//!
//! A [`Database`] pairs a static [`DatabaseDescriptor`] with the
//! [`ConnectionFactory`] produced for it by a [`Driver`]. Everything the
//! cluster does to a backend goes through a fresh [`Connection`].

use crate::config::DatabaseDescriptor;
use crate::dialect::Dialect;
use crate::error::{BackendError, Result};
use crate::types::{DatabaseId, IsolationLevel, TableRef};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// An open session against one backend.
#[async_trait]
pub trait Connection: Send {
    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, sql: &str) -> std::result::Result<u64, BackendError>;

    /// List every table visible through this connection's catalog.
    async fn tables(&mut self) -> std::result::Result<Vec<TableRef>, BackendError>;

    /// Current auto-commit mode.
    fn auto_commit(&self) -> bool;

    async fn set_auto_commit(&mut self, auto_commit: bool) -> std::result::Result<(), BackendError>;

    async fn set_isolation(&mut self, level: IsolationLevel) -> std::result::Result<(), BackendError>;

    async fn rollback(&mut self) -> std::result::Result<(), BackendError>;

    async fn close(&mut self) -> std::result::Result<(), BackendError>;
}

/// Produces connections to one backend.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> std::result::Result<Box<dyn Connection>, BackendError>;
}

/// Turns descriptor metadata into a connection factory.
pub trait Driver: Send + Sync {
    /// Create the connection factory for a backend.
    ///
    /// Descriptor metadata the driver cannot use is a configuration error.
    fn create_connection_factory(
        &self,
        descriptor: &DatabaseDescriptor,
    ) -> Result<Arc<dyn ConnectionFactory>>;
}

/// A registered backend.
pub struct Database {
    descriptor: DatabaseDescriptor,
    factory: Arc<dyn ConnectionFactory>,
    dirty: AtomicBool,
    in_flight: AtomicUsize,
}

impl Database {
    pub fn new(descriptor: DatabaseDescriptor, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            descriptor,
            factory,
            dirty: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Build a database from its descriptor using the given driver.
    pub fn from_descriptor(descriptor: DatabaseDescriptor, driver: &dyn Driver) -> Result<Self> {
        let factory = driver.create_connection_factory(&descriptor)?;
        Ok(Self::new(descriptor, factory))
    }

    pub fn id(&self) -> &DatabaseId {
        &self.descriptor.id
    }

    pub fn weight(&self) -> u32 {
        self.descriptor.weight
    }

    pub fn descriptor(&self) -> &DatabaseDescriptor {
        &self.descriptor
    }

    /// Open a new connection.
    pub async fn connect(&self) -> std::result::Result<Box<dyn Connection>, BackendError> {
        self.factory.connect().await
    }

    /// Run the dialect's liveness statement on a fresh connection.
    ///
    /// Never fails: any error while connecting, executing or closing yields
    /// `false`. The connection is closed on every path.
    pub async fn is_alive(&self, dialect: &dyn Dialect) -> bool {
        let mut connection = match self.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                debug!(database = %self.id(), error = %e, "Liveness probe could not connect");
                return false;
            }
        };

        let executed = connection.execute(dialect.simple_sql()).await;
        let closed = connection.close().await;

        match (executed, closed) {
            (Ok(_), Ok(())) => true,
            (Err(e), _) | (Ok(_), Err(e)) => {
                debug!(database = %self.id(), error = %e, "Liveness probe failed");
                false
            }
        }
    }

    /// Whether the in-memory descriptor has diverged from the persisted one.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clear the dirty flag, returning whether it was set.
    pub fn clean(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Number of invocations currently running against this backend.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn begin_invocation(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_invocation(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("id", self.id())
            .field("url", &self.descriptor.url)
            .field("weight", &self.weight())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl PartialEq for Database {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Database {}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A factory whose connections accept every statement.
    pub struct StubFactory {
        pub alive: AtomicBool,
    }

    struct StubConnection {
        auto_commit: bool,
    }

    #[async_trait]
    impl Connection for StubConnection {
        async fn execute(&mut self, _sql: &str) -> std::result::Result<u64, BackendError> {
            Ok(0)
        }

        async fn tables(&mut self) -> std::result::Result<Vec<TableRef>, BackendError> {
            Ok(Vec::new())
        }

        fn auto_commit(&self) -> bool {
            self.auto_commit
        }

        async fn set_auto_commit(&mut self, auto_commit: bool) -> std::result::Result<(), BackendError> {
            self.auto_commit = auto_commit;
            Ok(())
        }

        async fn set_isolation(&mut self, _level: IsolationLevel) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn rollback(&mut self) -> std::result::Result<(), BackendError> {
            Ok(())
        }

        async fn close(&mut self) -> std::result::Result<(), BackendError> {
            Ok(())
        }
    }

    #[async_trait]
    impl ConnectionFactory for StubFactory {
        async fn connect(&self) -> std::result::Result<Box<dyn Connection>, BackendError> {
            if self.alive.load(Ordering::SeqCst) {
                Ok(Box::new(StubConnection { auto_commit: true }))
            } else {
                Err(BackendError::new("connection refused").with_sql_state("08001"))
            }
        }
    }

    /// Driver handing out stub factories whose liveness tests can flip.
    #[derive(Default)]
    pub struct StubDriver {
        factories: parking_lot::Mutex<std::collections::HashMap<DatabaseId, Arc<StubFactory>>>,
    }

    impl StubDriver {
        pub fn set_alive(&self, id: &str, alive: bool) {
            if let Some(factory) = self.factories.lock().get(&DatabaseId::new(id)) {
                factory.alive.store(alive, Ordering::SeqCst);
            }
        }
    }

    impl Driver for StubDriver {
        fn create_connection_factory(
            &self,
            descriptor: &DatabaseDescriptor,
        ) -> Result<Arc<dyn ConnectionFactory>> {
            let factory = Arc::new(StubFactory {
                alive: AtomicBool::new(true),
            });
            self.factories
                .lock()
                .insert(descriptor.id.clone(), factory.clone());
            Ok(factory)
        }
    }

    pub fn make_database(id: &str, weight: u32) -> Arc<Database> {
        Arc::new(Database::new(
            DatabaseDescriptor::new(id, format!("stub://{}", id)).with_weight(weight),
            Arc::new(StubFactory {
                alive: AtomicBool::new(true),
            }),
        ))
    }

    pub fn make_dead_database(id: &str) -> Arc<Database> {
        Arc::new(Database::new(
            DatabaseDescriptor::new(id, format!("stub://{}", id)),
            Arc::new(StubFactory {
                alive: AtomicBool::new(false),
            }),
        ))
    }
}
