// Membership assertions shared by integration tests

use std::collections::HashSet;
use tandem::types::DatabaseId;
use tandem::DatabaseCluster;

/// Assert the active and inactive sets partition the registered databases.
pub fn assert_partitioned(cluster: &DatabaseCluster) {
    let active: HashSet<DatabaseId> = cluster.active_databases().into_iter().collect();
    let inactive: HashSet<DatabaseId> = cluster.inactive_databases().into_iter().collect();
    let registered: HashSet<DatabaseId> = cluster
        .databases()
        .iter()
        .map(|db| db.id().clone())
        .collect();

    assert!(
        active.is_disjoint(&inactive),
        "active {:?} and inactive {:?} overlap",
        active,
        inactive
    );
    let union: HashSet<DatabaseId> = active.union(&inactive).cloned().collect();
    assert_eq!(union, registered, "membership does not cover registered databases");
}

/// Assert the active set, in activation order.
pub fn assert_active(cluster: &DatabaseCluster, expected: &[&str]) {
    let active: Vec<String> = cluster
        .active_databases()
        .iter()
        .map(|id| id.to_string())
        .collect();
    assert_eq!(active, expected);
    assert_partitioned(cluster);
}
