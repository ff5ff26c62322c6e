//! Lock decrees and their recipient-side execution.
//!
//! A decree is a cluster-wide administrative intent. Every node runs a
//! [`DecreeExecutor`] which applies the two phases of each decree to its own
//! local state:
//!
//! | Decree        | prepare                     | commit               | abort              |
//! |---------------|-----------------------------|----------------------|--------------------|
//! | `AcquireLock` | try-lock without waiting    | keep the lock        | unlock if prepared |
//! | `ReleaseLock` | always succeeds             | unlock               | nothing            |
//! | `Activate`    | always succeeds             | admit the database   | nothing            |
//! | `Deactivate`  | always succeeds             | remove the database  | nothing            |
//!
//! Each decree a node prepares moves through [`DecreeState`]. A prepared
//! decree that hears neither commit nor abort within the commit timeout
//! aborts itself, releasing whatever prepare took.

use super::local::{LocalLockGuard, LocalLockManager};
use crate::error::Result;
use crate::observability::{self, DecreeRole};
use crate::types::{DatabaseId, NodeAddress};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Terminal decree records kept for inspection before pruning starts.
const MAX_TRACKED_DECREES: usize = 1024;

/// A cluster-wide administrative intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Decree {
    AcquireLock {
        lock_id: String,
        origin: NodeAddress,
    },
    ReleaseLock {
        lock_id: String,
        origin: NodeAddress,
    },
    Activate {
        cluster_id: String,
        database: DatabaseId,
        origin: NodeAddress,
    },
    Deactivate {
        cluster_id: String,
        database: DatabaseId,
        origin: NodeAddress,
    },
}

impl Decree {
    /// Node that issued the decree.
    pub fn origin(&self) -> &NodeAddress {
        match self {
            Decree::AcquireLock { origin, .. }
            | Decree::ReleaseLock { origin, .. }
            | Decree::Activate { origin, .. }
            | Decree::Deactivate { origin, .. } => origin,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decree::AcquireLock { .. } => "acquire_lock",
            Decree::ReleaseLock { .. } => "release_lock",
            Decree::Activate { .. } => "activate",
            Decree::Deactivate { .. } => "deactivate",
        }
    }

    /// Whether a single missing or negative vote must abort the decree.
    ///
    /// Only lock acquisition can be refused by a recipient; every other
    /// decree prepares unconditionally and is committed on every reachable
    /// member.
    pub fn requires_unanimity(&self) -> bool {
        matches!(self, Decree::AcquireLock { .. })
    }

    /// Short description used in logs and errors.
    pub fn subject(&self) -> String {
        match self {
            Decree::AcquireLock { lock_id, .. } | Decree::ReleaseLock { lock_id, .. } => {
                lock_id.clone()
            }
            Decree::Activate {
                cluster_id,
                database,
                ..
            }
            | Decree::Deactivate {
                cluster_id,
                database,
                ..
            } => format!("{}/{}", cluster_id, database),
        }
    }
}

impl fmt::Display for Decree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}) from {}", self.kind(), self.subject(), self.origin())
    }
}

/// One phase of a decree exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum DecreeMessage {
    Prepare { id: Uuid, decree: Decree },
    Commit { id: Uuid, decree: Decree },
    Abort { id: Uuid, decree: Decree },
}

impl DecreeMessage {
    pub fn id(&self) -> Uuid {
        match self {
            DecreeMessage::Prepare { id, .. }
            | DecreeMessage::Commit { id, .. }
            | DecreeMessage::Abort { id, .. } => *id,
        }
    }

    pub fn decree(&self) -> &Decree {
        match self {
            DecreeMessage::Prepare { decree, .. }
            | DecreeMessage::Commit { decree, .. }
            | DecreeMessage::Abort { decree, .. } => decree,
        }
    }

    pub fn phase(&self) -> &'static str {
        match self {
            DecreeMessage::Prepare { .. } => "prepare",
            DecreeMessage::Commit { .. } => "commit",
            DecreeMessage::Abort { .. } => "abort",
        }
    }
}

/// Lifecycle of one decree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecreeState {
    /// Broadcast, votes not yet collected.
    Issued,
    /// Prepare succeeded; waiting for the outcome.
    Prepared,
    Committed,
    Aborted,
}

impl DecreeState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DecreeState::Committed | DecreeState::Aborted)
    }

    /// Whether moving to `next` is a legal transition.
    pub fn can_transition_to(&self, next: DecreeState) -> bool {
        matches!(
            (self, next),
            (DecreeState::Issued, DecreeState::Prepared)
                | (DecreeState::Issued, DecreeState::Aborted)
                | (DecreeState::Prepared, DecreeState::Committed)
                | (DecreeState::Prepared, DecreeState::Aborted)
        )
    }
}

impl fmt::Display for DecreeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DecreeState::Issued => "issued",
            DecreeState::Prepared => "prepared",
            DecreeState::Committed => "committed",
            DecreeState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Applies committed membership decrees to a local cluster.
#[async_trait]
pub trait MembershipHandler: Send + Sync {
    /// Admit `database` without synchronizing it.
    async fn apply_activation(&self, database: &DatabaseId) -> Result<bool>;

    /// Remove `database` from the active set.
    async fn apply_deactivation(&self, database: &DatabaseId) -> Result<bool>;
}

struct DecreeRecord {
    decree: Decree,
    state: DecreeState,
}

/// Recipient-side statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub prepared: u64,
    pub refused: u64,
    pub committed: u64,
    pub aborted: u64,
    /// Prepared decrees aborted because no outcome arrived in time.
    pub expired: u64,
}

/// Per-node executor of decree phases.
pub struct DecreeExecutor {
    address: NodeAddress,
    locks: Arc<LocalLockManager>,
    commit_timeout: Duration,
    /// Lock guards taken by prepare, keyed by lock id and issuing node.
    guards: Mutex<HashMap<(String, NodeAddress), LocalLockGuard>>,
    decrees: Mutex<HashMap<Uuid, DecreeRecord>>,
    clusters: RwLock<HashMap<String, Arc<dyn MembershipHandler>>>,
    stats: Mutex<ExecutorStats>,
    this: Weak<DecreeExecutor>,
}

impl DecreeExecutor {
    pub fn new(
        address: NodeAddress,
        locks: Arc<LocalLockManager>,
        commit_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            address,
            locks,
            commit_timeout,
            guards: Mutex::new(HashMap::new()),
            decrees: Mutex::new(HashMap::new()),
            clusters: RwLock::new(HashMap::new()),
            stats: Mutex::new(ExecutorStats::default()),
            this: this.clone(),
        })
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn locks(&self) -> &Arc<LocalLockManager> {
        &self.locks
    }

    /// Route membership decrees for `cluster_id` to `handler`.
    pub fn register_cluster(&self, cluster_id: impl Into<String>, handler: Arc<dyn MembershipHandler>) {
        self.clusters.write().insert(cluster_id.into(), handler);
    }

    pub fn unregister_cluster(&self, cluster_id: &str) {
        self.clusters.write().remove(cluster_id);
    }

    /// State of a decree this node has seen.
    pub fn state(&self, id: &Uuid) -> Option<DecreeState> {
        self.decrees.lock().get(id).map(|record| record.state)
    }

    /// Whether this node holds `lock_id` on behalf of `origin`.
    pub fn holds(&self, lock_id: &str, origin: &NodeAddress) -> bool {
        self.guards
            .lock()
            .contains_key(&(lock_id.to_string(), origin.clone()))
    }

    pub fn stats(&self) -> ExecutorStats {
        self.stats.lock().clone()
    }

    /// Handle one incoming message, returning this node's answer.
    ///
    /// For prepare the answer is the vote; commit and abort are always
    /// acknowledged.
    pub async fn handle(&self, message: DecreeMessage) -> bool {
        debug!(
            node = %self.address,
            phase = message.phase(),
            decree = %message.decree(),
            "Received decree message"
        );
        match message {
            DecreeMessage::Prepare { id, decree } => self.prepare(id, decree),
            DecreeMessage::Commit { id, decree } => self.commit(id, decree).await,
            DecreeMessage::Abort { id, .. } => {
                self.abort(id);
                true
            }
        }
    }

    /// Run the prepare phase.
    pub fn prepare(&self, id: Uuid, decree: Decree) -> bool {
        {
            let decrees = self.decrees.lock();
            if let Some(record) = decrees.get(&id) {
                // Duplicate delivery: repeat the earlier vote
                return record.state == DecreeState::Prepared
                    || record.state == DecreeState::Committed;
            }
        }

        let vote = match &decree {
            Decree::AcquireLock { lock_id, origin } => match self.locks.try_lock(lock_id) {
                Some(guard) => {
                    self.guards
                        .lock()
                        .insert((lock_id.clone(), origin.clone()), guard);
                    true
                }
                None => false,
            },
            Decree::ReleaseLock { .. } | Decree::Activate { .. } | Decree::Deactivate { .. } => true,
        };

        let state = if vote {
            DecreeState::Prepared
        } else {
            DecreeState::Aborted
        };
        self.record(id, decree.clone(), state);

        {
            let mut stats = self.stats.lock();
            if vote {
                stats.prepared += 1;
            } else {
                stats.refused += 1;
            }
        }

        if vote {
            self.watch_commit_timeout(id);
        } else {
            debug!(node = %self.address, decree = %decree, "Refused decree");
        }
        vote
    }

    /// Run the commit phase. Unknown or already terminal decrees are ignored.
    ///
    /// Returns whether the decree is committed on this node, so a commit
    /// arriving after the decree expired here is answered `false`.
    pub async fn commit(&self, id: Uuid, decree: Decree) -> bool {
        if !self.transition(&id, DecreeState::Committed) {
            let state = self.state(&id);
            debug!(node = %self.address, decree = %decree, state = ?state, "Ignoring commit for decree not prepared here");
            return state == Some(DecreeState::Committed);
        }
        self.stats.lock().committed += 1;

        match &decree {
            Decree::AcquireLock { lock_id, origin } => {
                debug!(node = %self.address, lock = %lock_id, origin = %origin, "Lock held by decree");
            }
            Decree::ReleaseLock { lock_id, origin } => {
                let released = self
                    .guards
                    .lock()
                    .remove(&(lock_id.clone(), origin.clone()));
                if released.is_none() {
                    debug!(node = %self.address, lock = %lock_id, origin = %origin, "Release for lock not held");
                }
            }
            Decree::Activate {
                cluster_id,
                database,
                origin,
            } => {
                if origin != &self.address {
                    if let Some(handler) = self.handler(cluster_id) {
                        match handler.apply_activation(database).await {
                            Ok(_) => info!(node = %self.address, cluster = %cluster_id, database = %database, "Applied remote activation"),
                            Err(e) => warn!(node = %self.address, cluster = %cluster_id, database = %database, error = %e, "Failed to apply remote activation"),
                        }
                    }
                }
            }
            Decree::Deactivate {
                cluster_id,
                database,
                origin,
            } => {
                if origin != &self.address {
                    if let Some(handler) = self.handler(cluster_id) {
                        match handler.apply_deactivation(database).await {
                            Ok(_) => info!(node = %self.address, cluster = %cluster_id, database = %database, "Applied remote deactivation"),
                            Err(e) => warn!(node = %self.address, cluster = %cluster_id, database = %database, error = %e, "Failed to apply remote deactivation"),
                        }
                    }
                }
            }
        }
        true
    }

    /// Run the abort phase. Unknown or already terminal decrees are ignored.
    pub fn abort(&self, id: Uuid) {
        let decree = {
            let decrees = self.decrees.lock();
            match decrees.get(&id) {
                Some(record) if record.state == DecreeState::Prepared => record.decree.clone(),
                _ => return,
            }
        };
        if !self.transition(&id, DecreeState::Aborted) {
            return;
        }
        self.stats.lock().aborted += 1;

        if let Decree::AcquireLock { lock_id, origin } = &decree {
            self.guards.lock().remove(&(lock_id.clone(), origin.clone()));
        }
        debug!(node = %self.address, decree = %decree, "Aborted decree");
    }

    fn handler(&self, cluster_id: &str) -> Option<Arc<dyn MembershipHandler>> {
        let handler = self.clusters.read().get(cluster_id).cloned();
        if handler.is_none() {
            debug!(node = %self.address, cluster = %cluster_id, "No local cluster for membership decree");
        }
        handler
    }

    fn record(&self, id: Uuid, decree: Decree, state: DecreeState) {
        let mut decrees = self.decrees.lock();
        if decrees.len() >= MAX_TRACKED_DECREES {
            decrees.retain(|_, record| !record.state.is_terminal());
        }
        decrees.insert(id, DecreeRecord { decree, state });
    }

    fn transition(&self, id: &Uuid, next: DecreeState) -> bool {
        let mut decrees = self.decrees.lock();
        match decrees.get_mut(id) {
            Some(record) if record.state.can_transition_to(next) => {
                record.state = next;
                let outcome = if next == DecreeState::Committed {
                    "committed"
                } else {
                    "aborted"
                };
                observability::record_decree(DecreeRole::Recipient, outcome);
                true
            }
            _ => false,
        }
    }

    /// Abort a prepared decree if its outcome never arrives.
    fn watch_commit_timeout(&self, id: Uuid) {
        let this = self.this.clone();
        let timeout = self.commit_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(executor) = this.upgrade() {
                if executor.state(&id) == Some(DecreeState::Prepared) {
                    warn!(
                        node = %executor.address,
                        decree_id = %id,
                        timeout_ms = timeout.as_millis() as u64,
                        "No outcome for prepared decree, aborting"
                    );
                    executor.abort(id);
                    executor.stats.lock().expired += 1;
                }
            }
        });
    }
}
