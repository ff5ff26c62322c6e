//! Observability module for tandem.
//!
//! Provides logging initialisation and the cluster's metrics counters.
//! Counters are recorded through the `metrics` facade; without an installed
//! recorder they are no-ops.

use crate::config::ObservabilityConfig;
use crate::error::{Result, TandemError};
use crate::types::DatabaseId;
use metrics::{counter, gauge};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize observability (logging).
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| TandemError::Internal(format!("Failed to init logging: {}", e)))?;
    } else {
        subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| TandemError::Internal(format!("Failed to init logging: {}", e)))?;
    }

    info!("Observability initialized");
    Ok(())
}

/// Kind of dispatched invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchKind {
    Read,
    Write,
}

impl DispatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchKind::Read => "read",
            DispatchKind::Write => "write",
        }
    }
}

/// Record a successful activation.
pub fn record_activation(cluster: &str, database: &DatabaseId) {
    counter!(
        "tandem_activations_total",
        "cluster" => cluster.to_string(),
        "database" => database.to_string()
    )
    .increment(1);
}

/// Record a deactivation that changed membership.
pub fn record_deactivation(cluster: &str, database: &DatabaseId) {
    counter!(
        "tandem_deactivations_total",
        "cluster" => cluster.to_string(),
        "database" => database.to_string()
    )
    .increment(1);
}

/// Record a dispatched invocation.
pub fn record_dispatch(kind: DispatchKind) {
    counter!("tandem_dispatch_total", "kind" => kind.as_str()).increment(1);
}

/// Which side of the decree exchange recorded an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecreeRole {
    Initiator,
    Recipient,
}

impl DecreeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecreeRole::Initiator => "initiator",
            DecreeRole::Recipient => "recipient",
        }
    }
}

/// Record the terminal outcome of a decree ("committed" or "aborted").
///
/// Each node counts the decrees it executed as a recipient, and the
/// issuing node also counts once as the initiator.
pub fn record_decree(role: DecreeRole, outcome: &'static str) {
    counter!(
        "tandem_decrees_total",
        "role" => role.as_str(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Update membership gauges.
pub fn update_membership(cluster: &str, active: usize, inactive: usize) {
    gauge!("tandem_active_databases", "cluster" => cluster.to_string()).set(active as f64);
    gauge!("tandem_inactive_databases", "cluster" => cluster.to_string()).set(inactive as f64);
}
