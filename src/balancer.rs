//! Read-routing balancers over the active database set.
//!
//! Every balancer keeps the active set as an immutable, activation-ordered
//! snapshot. Membership changes build a new snapshot and swap it in under a
//! short lock, so callers iterating a snapshot never block, and are never
//! blocked by, a concurrent activation or deactivation.

use crate::config::BalancerKind;
use crate::database::Database;
use crate::types::DatabaseId;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;

/// Activation-ordered snapshot of active databases.
pub type Snapshot = Arc<[Arc<Database>]>;

/// Tracks the active set and picks a backend for each read.
pub trait Balancer: Send + Sync {
    /// Add a database. Returns `false` if it was already present.
    fn add(&self, database: Arc<Database>) -> bool;

    /// Remove a database. Returns `false` if it was not present.
    fn remove(&self, id: &DatabaseId) -> bool;

    fn contains(&self, id: &DatabaseId) -> bool;

    /// The current snapshot, in activation order.
    fn all(&self) -> Snapshot;

    /// Pick the backend for the next read.
    fn next(&self) -> Option<Arc<Database>>;

    /// Called before an invocation runs against `database`.
    fn before_invocation(&self, database: &Database) {
        database.begin_invocation();
    }

    /// Called after an invocation against `database` finished, successfully or not.
    fn after_invocation(&self, database: &Database) {
        database.end_invocation();
    }

    fn is_empty(&self) -> bool {
        self.all().is_empty()
    }
}

/// Create the balancer for a configured policy.
pub fn create(kind: BalancerKind) -> Arc<dyn Balancer> {
    match kind {
        BalancerKind::Simple => Arc::new(SimpleBalancer::default()),
        BalancerKind::RoundRobin => Arc::new(RoundRobinBalancer::default()),
        BalancerKind::Random => Arc::new(RandomBalancer::default()),
        BalancerKind::Load => Arc::new(LoadBalancer::default()),
    }
}

/// Copy-on-write holder for the active snapshot.
pub struct ActiveSet {
    snapshot: RwLock<Snapshot>,
}

impl Default for ActiveSet {
    fn default() -> Self {
        Self {
            snapshot: RwLock::new(Arc::from(Vec::new())),
        }
    }
}

impl ActiveSet {
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.read().clone()
    }

    pub fn add(&self, database: Arc<Database>) -> bool {
        let mut guard = self.snapshot.write();
        if guard.iter().any(|db| db.id() == database.id()) {
            return false;
        }
        let mut next: Vec<_> = guard.iter().cloned().collect();
        next.push(database);
        *guard = next.into();
        true
    }

    pub fn remove(&self, id: &DatabaseId) -> bool {
        let mut guard = self.snapshot.write();
        if !guard.iter().any(|db| db.id() == id) {
            return false;
        }
        let next: Vec<_> = guard.iter().filter(|db| db.id() != id).cloned().collect();
        *guard = next.into();
        true
    }

    pub fn contains(&self, id: &DatabaseId) -> bool {
        self.snapshot.read().iter().any(|db| db.id() == id)
    }
}

/// Selection weights: declared weights, or equal weights when every
/// backend is weighted zero.
fn effective_weights(databases: &[Arc<Database>]) -> (Vec<u64>, u64) {
    let weights: Vec<u64> = databases.iter().map(|db| u64::from(db.weight())).collect();
    let total: u64 = weights.iter().sum();
    if total == 0 {
        (vec![1; databases.len()], databases.len() as u64)
    } else {
        (weights, total)
    }
}

/// Map a point in `[0, total)` onto the weighted list.
fn pick_weighted(databases: &[Arc<Database>], weights: &[u64], mut point: u64) -> Option<Arc<Database>> {
    for (db, weight) in databases.iter().zip(weights) {
        if point < *weight {
            return Some(db.clone());
        }
        point -= weight;
    }
    databases.last().cloned()
}

macro_rules! delegate_membership {
    () => {
        fn add(&self, database: Arc<Database>) -> bool {
            self.set.add(database)
        }

        fn remove(&self, id: &DatabaseId) -> bool {
            self.set.remove(id)
        }

        fn contains(&self, id: &DatabaseId) -> bool {
            self.set.contains(id)
        }

        fn all(&self) -> Snapshot {
            self.set.snapshot()
        }
    };
}

/// Always routes to the highest-weighted backend; ties go to the earliest activated.
#[derive(Default)]
pub struct SimpleBalancer {
    set: ActiveSet,
}

impl Balancer for SimpleBalancer {
    delegate_membership!();

    fn next(&self) -> Option<Arc<Database>> {
        let snapshot = self.set.snapshot();
        let mut best: Option<&Arc<Database>> = None;
        for db in snapshot.iter() {
            if best.map_or(true, |b| db.weight() > b.weight()) {
                best = Some(db);
            }
        }
        best.cloned()
    }
}

/// Smooth weighted round-robin: each backend is visited in proportion to
/// its weight, with picks of heavier backends interleaved rather than
/// consecutive.
#[derive(Default)]
pub struct RoundRobinBalancer {
    set: ActiveSet,
    /// Running weight per backend.
    current: Mutex<HashMap<DatabaseId, i64>>,
}

impl Balancer for RoundRobinBalancer {
    delegate_membership!();

    fn next(&self) -> Option<Arc<Database>> {
        let snapshot = self.set.snapshot();
        if snapshot.is_empty() {
            return None;
        }
        let (weights, total) = effective_weights(&snapshot);

        let mut current = self.current.lock();
        current.retain(|id, _| snapshot.iter().any(|db| db.id() == id));

        let mut best: Option<(usize, i64)> = None;
        for (index, (db, weight)) in snapshot.iter().zip(&weights).enumerate() {
            let running = current.entry(db.id().clone()).or_insert(0);
            *running += *weight as i64;
            if best.map_or(true, |(_, value)| *running > value) {
                best = Some((index, *running));
            }
        }

        let (index, _) = best?;
        let picked = &snapshot[index];
        if let Some(running) = current.get_mut(picked.id()) {
            *running -= total as i64;
        }
        Some(picked.clone())
    }
}

/// Weighted random choice.
#[derive(Default)]
pub struct RandomBalancer {
    set: ActiveSet,
}

impl Balancer for RandomBalancer {
    delegate_membership!();

    fn next(&self) -> Option<Arc<Database>> {
        let snapshot = self.set.snapshot();
        if snapshot.is_empty() {
            return None;
        }
        let (weights, total) = effective_weights(&snapshot);
        let point = rand::thread_rng().gen_range(0..total);
        pick_weighted(&snapshot, &weights, point)
    }
}

/// Routes to the backend with the least in-flight work relative to its weight.
#[derive(Default)]
pub struct LoadBalancer {
    set: ActiveSet,
}

impl LoadBalancer {
    fn load(database: &Database) -> f64 {
        match database.weight() {
            0 => f64::INFINITY,
            weight => (database.in_flight() + 1) as f64 / f64::from(weight),
        }
    }
}

impl Balancer for LoadBalancer {
    delegate_membership!();

    fn next(&self) -> Option<Arc<Database>> {
        let snapshot = self.set.snapshot();
        let mut best: Option<(&Arc<Database>, f64)> = None;
        for db in snapshot.iter() {
            let load = Self::load(db);
            if best.map_or(true, |(_, best_load)| load < best_load) {
                best = Some((db, load));
            }
        }
        best.map(|(db, _)| db.clone())
    }
}
