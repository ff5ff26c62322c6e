//! Error types for the tandem cluster middleware.
//!
//! This module provides a unified error type [`TandemError`] for cluster
//! operations, a backend-specific [`BackendError`] produced by connections,
//! and a convenient [`Result`] type alias.
//!
//! # Error Categories
//!
//! - **Backend**: a statement failed on a backend that is still alive. This is
//!   the only category that crosses back to the caller unchanged.
//! - **Membership**: no active backend remains, or synchronization of a
//!   backend that was being activated failed.
//! - **Coordination**: a lock decree was aborted or timed out.
//! - **Configuration**: unknown or duplicate identifiers, removing an active
//!   backend, invalid schedules. These fail fast and are never retried.
//!
//! # Example
//!
//! ```rust
//! use tandem::error::{BackendError, TandemError};
//! use tandem::types::DatabaseId;
//!
//! let err = TandemError::Backend {
//!     database: DatabaseId::new("db1"),
//!     source: BackendError::new("relation \"t\" does not exist").with_sql_state("42P01"),
//! };
//! assert!(err.is_backend_error());
//! assert!(!err.is_configuration_error());
//! ```

use crate::scheduling::CronParseError;
use crate::types::DatabaseId;
use std::io;
use thiserror::Error;

/// Failure reported by a single backend connection.
///
/// Backends may report several problems for one call; they are chained
/// through `next` in the order the backend produced them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    /// Vendor or SQLSTATE code, if the backend supplied one.
    pub sql_state: Option<String>,
    /// Human-readable message.
    pub message: String,
    /// Next error in the chain.
    pub next: Option<Box<BackendError>>,
}

impl BackendError {
    /// Create a new backend error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            sql_state: None,
            message: message.into(),
            next: None,
        }
    }

    /// Attach a SQLSTATE code.
    pub fn with_sql_state(mut self, sql_state: impl Into<String>) -> Self {
        self.sql_state = Some(sql_state.into());
        self
    }

    /// Append an error to the end of the chain.
    pub fn chain(mut self, next: BackendError) -> Self {
        let mut slot = &mut self.next;
        while let Some(existing) = slot {
            slot = &mut existing.next;
        }
        *slot = Some(Box::new(next));
        self
    }

    /// Iterate over this error followed by every chained error.
    pub fn iter(&self) -> impl Iterator<Item = &BackendError> {
        std::iter::successors(Some(self), |e| e.next.as_deref())
    }
}

/// Main error type for tandem operations.
#[derive(Error, Debug)]
pub enum TandemError {
    // Backend errors
    #[error("Backend {database} failed: {source}")]
    Backend {
        database: DatabaseId,
        #[source]
        source: BackendError,
    },

    #[error("No active database in cluster {cluster}")]
    NoActiveDatabase { cluster: String },

    #[error("Failed to synchronize database {database}: {source}")]
    Synchronization {
        database: DatabaseId,
        #[source]
        source: BackendError,
    },

    // Coordination errors
    #[error("Lock decree for {lock_id} aborted: {reason}")]
    DecreeAborted { lock_id: String, reason: String },

    #[error("Lock acquisition timed out: {0}")]
    LockTimeout(String),

    #[error("Group communication error: {0}")]
    Group(String),

    // Configuration and identity errors
    #[error("Database {0} does not exist in this cluster")]
    UnknownDatabase(DatabaseId),

    #[error("Database {0} already exists in this cluster")]
    DuplicateDatabase(DatabaseId),

    #[error("Database {0} is still active and cannot be removed")]
    DatabaseStillActive(DatabaseId),

    #[error("Synchronization strategy not found: {0}")]
    UnknownStrategy(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(#[from] CronParseError),

    // Persistence errors
    #[error("Cluster state store error: {0}")]
    StateStore(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // Lifecycle errors
    #[error("Operation interrupted")]
    Interrupted,

    #[error("Cluster is shutting down")]
    Shutdown,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TandemError {
    /// Wrap a backend error for the given database.
    pub fn backend(database: &DatabaseId, source: BackendError) -> Self {
        TandemError::Backend {
            database: database.clone(),
            source,
        }
    }

    /// Check if this is a transient backend error surfaced to the caller.
    pub fn is_backend_error(&self) -> bool {
        matches!(self, TandemError::Backend { .. })
    }

    /// Check if this error stems from bad configuration or identifiers.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            TandemError::UnknownDatabase(_)
                | TandemError::DuplicateDatabase(_)
                | TandemError::DatabaseStillActive(_)
                | TandemError::UnknownStrategy(_)
                | TandemError::Config(_)
                | TandemError::InvalidConfig { .. }
                | TandemError::InvalidSchedule(_)
        )
    }

    /// Check if this error came from the lock decree protocol.
    pub fn is_coordination_error(&self) -> bool {
        matches!(
            self,
            TandemError::DecreeAborted { .. } | TandemError::LockTimeout(_) | TandemError::Group(_)
        )
    }
}

impl From<serde_json::Error> for TandemError {
    fn from(e: serde_json::Error) -> Self {
        TandemError::Serialization(e.to_string())
    }
}

/// Result type alias for tandem operations.
pub type Result<T> = std::result::Result<T, TandemError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_chain() {
        let err = BackendError::new("first")
            .chain(BackendError::new("second"))
            .chain(BackendError::new("third").with_sql_state("08006"));

        let messages: Vec<_> = err.iter().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second", "third"]);
        assert_eq!(err.iter().last().unwrap().sql_state.as_deref(), Some("08006"));
    }

    #[test]
    fn test_error_categories() {
        let id = DatabaseId::new("db1");

        assert!(TandemError::UnknownDatabase(id.clone()).is_configuration_error());
        assert!(TandemError::DatabaseStillActive(id.clone()).is_configuration_error());
        assert!(!TandemError::NoActiveDatabase { cluster: "c".into() }.is_configuration_error());
        assert!(TandemError::backend(&id, BackendError::new("boom")).is_backend_error());
        assert!(TandemError::LockTimeout("cluster".into()).is_coordination_error());
    }

    #[test]
    fn test_error_display() {
        let err = TandemError::backend(&DatabaseId::new("db1"), BackendError::new("boom"));
        assert_eq!(err.to_string(), "Backend db1 failed: boom");
    }
}
