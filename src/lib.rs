//! Tandem - high-availability middleware that keeps independent database
//! backends in lockstep.
//!
//! Tandem presents a set of otherwise unreplicated backends as one logical
//! database. Writes fan out to every active backend, reads go to one backend
//! chosen by a balancer, failed backends are detected and isolated, and
//! repaired ones are resynchronized before they are admitted again.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Dispatch: ReadInvocationStrategy | WriteInvocationStrategy │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Cluster: membership | synchronization | sweeps | state     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Coordination: lock decrees | group channel | balancers     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Backends: Driver -> ConnectionFactory -> Connection        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tandem::config::ClusterConfig;
//! use tandem::database::{Database, Driver};
//! use tandem::state::FileStateStore;
//! use tandem::sync::StrategyRegistry;
//! use tandem::{BackendError, DatabaseCluster};
//!
//! async fn run(driver: Arc<dyn Driver>) -> tandem::Result<()> {
//!     let config = ClusterConfig::from_file("cluster.json".as_ref())?;
//!     let store = Arc::new(FileStateStore::new("membership.json"));
//!     let cluster = Arc::new(DatabaseCluster::new(
//!         &config,
//!         driver,
//!         store,
//!         StrategyRegistry::default(),
//!     )?);
//!     cluster.start().await?;
//!
//!     let outcome = cluster
//!         .write(|database: Arc<Database>| async move {
//!             let mut connection = database.connect().await?;
//!             let rows = connection.execute("UPDATE accounts SET frozen = true").await?;
//!             connection.close().await?;
//!             Ok::<_, BackendError>(rows)
//!         })
//!         .await?;
//!     println!("updated {:?}", outcome.first());
//!
//!     cluster.stop();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod types;

pub mod balancer;
pub mod cli;
pub mod cluster;
pub mod database;
pub mod dialect;
pub mod dispatch;
pub mod lock;
pub mod observability;
pub mod scheduling;
pub mod shutdown;
pub mod state;
pub mod sync;

// Re-exports
pub use cluster::{DatabaseCluster, DatabaseState, DistributedCluster};
pub use dispatch::{Invoker, WriteOutcome};
pub use error::{BackendError, Result, TandemError};
pub use types::*;
