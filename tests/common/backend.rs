// Scripted in-memory backends for integration tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tandem::config::DatabaseDescriptor;
use tandem::database::{Connection, ConnectionFactory, Driver};
use tandem::types::{DatabaseId, IsolationLevel, TableRef};
use tandem::{BackendError, TandemError};

/// Something a connection did, in the order it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    Connect,
    Execute(String),
    SetAutoCommit(bool),
    SetIsolation(IsolationLevel),
    Rollback,
    Close,
}

/// One simulated database server.
pub struct MockBackend {
    id: DatabaseId,
    alive: AtomicBool,
    tables: Mutex<Vec<TableRef>>,
    /// Statements containing the key fail with the error.
    failures: Mutex<Vec<(String, BackendError)>>,
    events: Mutex<Vec<BackendEvent>>,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl MockBackend {
    pub fn new(id: impl Into<DatabaseId>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            alive: AtomicBool::new(true),
            tables: Mutex::new(vec![
                TableRef::new(Some("public"), "orders"),
                TableRef::new(Some("public"), "customers"),
            ]),
            failures: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            opened: AtomicUsize::new(0),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> &DatabaseId {
        &self.id
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn set_tables(&self, tables: Vec<TableRef>) {
        *self.tables.lock() = tables;
    }

    /// Make every statement containing `pattern` fail with `error`.
    pub fn fail_statements(&self, pattern: &str, error: BackendError) {
        self.failures.lock().push((pattern.to_string(), error));
    }

    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    pub fn events(&self) -> Vec<BackendEvent> {
        self.events.lock().clone()
    }

    pub fn clear_events(&self) {
        self.events.lock().clear();
    }

    /// Statements executed, excluding liveness probes.
    pub fn executed(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                BackendEvent::Execute(sql) if sql != "SELECT 1" => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &BackendEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Connections opened and not yet closed.
    pub fn open_connections(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }

    fn record(&self, event: BackendEvent) {
        self.events.lock().push(event);
    }

    fn check(&self, sql: &str) -> Result<(), BackendError> {
        if !self.is_alive() {
            return Err(BackendError::new("connection reset").with_sql_state("08006"));
        }
        let failures = self.failures.lock();
        match failures.iter().find(|(pattern, _)| sql.contains(pattern.as_str())) {
            Some((_, error)) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

struct MockConnection {
    backend: Arc<MockBackend>,
    auto_commit: bool,
    closed: bool,
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&mut self, sql: &str) -> Result<u64, BackendError> {
        self.backend.record(BackendEvent::Execute(sql.to_string()));
        self.backend.check(sql)?;
        Ok(1)
    }

    async fn tables(&mut self) -> Result<Vec<TableRef>, BackendError> {
        self.backend.check("")?;
        Ok(self.backend.tables.lock().clone())
    }

    fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    async fn set_auto_commit(&mut self, auto_commit: bool) -> Result<(), BackendError> {
        self.backend.record(BackendEvent::SetAutoCommit(auto_commit));
        self.auto_commit = auto_commit;
        Ok(())
    }

    async fn set_isolation(&mut self, level: IsolationLevel) -> Result<(), BackendError> {
        self.backend.record(BackendEvent::SetIsolation(level));
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), BackendError> {
        self.backend.record(BackendEvent::Rollback);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if !self.closed {
            self.closed = true;
            self.backend.record(BackendEvent::Close);
            self.backend.closed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

struct MockFactory {
    backend: Arc<MockBackend>,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self) -> Result<Box<dyn Connection>, BackendError> {
        if !self.backend.is_alive() {
            return Err(BackendError::new("connection refused").with_sql_state("08001"));
        }
        self.backend.record(BackendEvent::Connect);
        self.backend.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockConnection {
            backend: self.backend.clone(),
            auto_commit: true,
            closed: false,
        }))
    }
}

/// Driver resolving descriptors to [`MockBackend`]s by id.
///
/// Descriptors must use the `mock://` scheme.
#[derive(Default)]
pub struct MockDriver {
    backends: Mutex<HashMap<DatabaseId, Arc<MockBackend>>>,
}

impl MockDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The backend for `id`, created on first use.
    pub fn backend(&self, id: &str) -> Arc<MockBackend> {
        self.backends
            .lock()
            .entry(DatabaseId::new(id))
            .or_insert_with(|| MockBackend::new(id))
            .clone()
    }
}

impl Driver for MockDriver {
    fn create_connection_factory(
        &self,
        descriptor: &DatabaseDescriptor,
    ) -> tandem::Result<Arc<dyn ConnectionFactory>> {
        if !descriptor.url.starts_with("mock://") {
            return Err(TandemError::InvalidConfig {
                field: format!("databases.{}.url", descriptor.id),
                reason: format!("unsupported url {}", descriptor.url),
            });
        }
        Ok(Arc::new(MockFactory {
            backend: self.backend(descriptor.id.as_str()),
        }))
    }
}
