//! Dispatch of invocations to active databases.
//!
//! An [`Invoker`] is one unit of work against one backend. An
//! [`InvocationStrategy`] decides where it runs:
//!
//! - [`ReadInvocationStrategy`] runs it on a single database picked by the
//!   cluster's balancer.
//! - [`WriteInvocationStrategy`] runs it on every active database in
//!   parallel and waits for all of them.
//!
//! Every failure goes through [`DatabaseCluster::handle_failure`]: a backend
//! that is still alive returns its error to the caller, a dead one is
//! deactivated and its error swallowed. Each dispatch holds the cluster's
//! read lock, so it never overlaps an activation.

use crate::cluster::DatabaseCluster;
use crate::database::Database;
use crate::error::{BackendError, Result, TandemError};
use crate::observability::{self, DispatchKind};
use crate::shutdown::ShutdownAware;
use crate::types::DatabaseId;
use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// A unit of work against one database.
#[async_trait]
pub trait Invoker: Send + Sync + 'static {
    type Output: Send + 'static;

    async fn invoke(&self, database: Arc<Database>) -> std::result::Result<Self::Output, BackendError>;
}

#[async_trait]
impl<F, Fut, T> Invoker for F
where
    F: Fn(Arc<Database>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<T, BackendError>> + Send + 'static,
    T: Send + 'static,
{
    type Output = T;

    async fn invoke(&self, database: Arc<Database>) -> std::result::Result<T, BackendError> {
        (self)(database).await
    }
}

/// Decides which databases an invocation runs against.
#[async_trait]
pub trait InvocationStrategy<I: Invoker>: Send + Sync {
    type Output: Send;

    async fn invoke(&self, cluster: &DatabaseCluster, invoker: Arc<I>) -> Result<Self::Output>;
}

/// Runs an invocation on the balancer's pick.
///
/// If the picked database turns out to be dead it is deactivated and the
/// next pick is tried, until one succeeds, one fails while alive, or none
/// is left.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadInvocationStrategy;

#[async_trait]
impl<I: Invoker> InvocationStrategy<I> for ReadInvocationStrategy {
    type Output = I::Output;

    async fn invoke(&self, cluster: &DatabaseCluster, invoker: Arc<I>) -> Result<I::Output> {
        cluster.ensure_running()?;
        observability::record_dispatch(DispatchKind::Read);
        let _guard = cluster.read_lock().await;
        let balancer = cluster.balancer();

        loop {
            let database = balancer
                .next()
                .ok_or_else(|| cluster.no_active_database())?;

            balancer.before_invocation(&database);
            let result = invoker
                .invoke(database.clone())
                .with_shutdown(cluster.shutdown())
                .await;
            balancer.after_invocation(&database);

            match result {
                None => return Err(TandemError::Shutdown),
                Some(Ok(output)) => return Ok(output),
                Some(Err(error)) => {
                    cluster.handle_failure(&database, error).await?;
                    debug!(cluster = %cluster.id(), database = %database.id(), "Retrying read on next database");
                }
            }
        }
    }
}

/// A database whose write failed while it stayed alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFailure {
    pub database: DatabaseId,
    pub error: BackendError,
}

/// Result of a write that succeeded on at least one database.
#[derive(Debug, Clone)]
pub struct WriteOutcome<T> {
    /// Results per database, in activation order.
    pub results: Vec<(DatabaseId, T)>,
    /// Databases that rejected the write but are still active.
    pub failures: Vec<WriteFailure>,
}

impl<T> WriteOutcome<T> {
    /// Whether no database that is still active rejected the write.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Result of the earliest activated database.
    pub fn first(&self) -> Option<&T> {
        self.results.first().map(|(_, result)| result)
    }

    pub fn get(&self, database: &DatabaseId) -> Option<&T> {
        self.results
            .iter()
            .find(|(id, _)| id == database)
            .map(|(_, result)| result)
    }

    pub fn into_results(self) -> Vec<(DatabaseId, T)> {
        self.results
    }
}

/// Runs an invocation on every active database in parallel.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteInvocationStrategy;

#[async_trait]
impl<I: Invoker> InvocationStrategy<I> for WriteInvocationStrategy {
    type Output = WriteOutcome<I::Output>;

    async fn invoke(&self, cluster: &DatabaseCluster, invoker: Arc<I>) -> Result<Self::Output> {
        cluster.ensure_running()?;
        observability::record_dispatch(DispatchKind::Write);
        let _guard = cluster.read_lock().await;

        let databases = cluster.balancer().all();
        if databases.is_empty() {
            return Err(cluster.no_active_database());
        }

        let handles: Vec<_> = databases
            .iter()
            .map(|database| {
                let database = database.clone();
                let invoker = invoker.clone();
                let balancer = cluster.balancer().clone();
                cluster.pool().spawn(cluster.shutdown(), async move {
                    balancer.before_invocation(&database);
                    let result = invoker.invoke(database.clone()).await;
                    balancer.after_invocation(&database);
                    result
                })
            })
            .collect();
        let joined = join_all(handles).await;

        let mut results = Vec::with_capacity(databases.len());
        let mut failures = Vec::new();
        for (database, joined) in databases.iter().zip(joined) {
            let result = joined.map_err(|e| {
                TandemError::Internal(format!("invocation on {} did not complete: {}", database.id(), e))
            })??;

            match result {
                Ok(output) => results.push((database.id().clone(), output)),
                Err(error) => match cluster.handle_failure(database, error).await {
                    Ok(()) => {}
                    Err(TandemError::Backend {
                        database: failed,
                        source,
                    }) => failures.push(WriteFailure {
                        database: failed,
                        error: source,
                    }),
                    Err(other) => return Err(other),
                },
            }
        }

        if !results.is_empty() {
            if !failures.is_empty() {
                warn!(
                    cluster = %cluster.id(),
                    succeeded = results.len(),
                    failed = ?failures.iter().map(|f| f.database.as_str()).collect::<Vec<_>>(),
                    "Write failed on some active databases"
                );
            }
            return Ok(WriteOutcome { results, failures });
        }

        match failures.pop() {
            Some(last) => Err(TandemError::Backend {
                database: last.database,
                source: last.error,
            }),
            None => Err(cluster.no_active_database()),
        }
    }
}

impl DatabaseCluster {
    /// Run `invoker` on one active database.
    pub async fn read<I: Invoker>(&self, invoker: I) -> Result<I::Output> {
        ReadInvocationStrategy.invoke(self, Arc::new(invoker)).await
    }

    /// Run `invoker` on every active database.
    pub async fn write<I: Invoker>(&self, invoker: I) -> Result<WriteOutcome<I::Output>> {
        WriteInvocationStrategy.invoke(self, Arc::new(invoker)).await
    }
}
