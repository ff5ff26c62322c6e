//! Dispatch integration tests
//!
//! Tests read and write fan-out against mock backends, failure
//! classification and interaction with activation and shutdown.

#[allow(dead_code)]
mod common;

use common::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tandem::config::BalancerKind;
use tandem::database::Database;
use tandem::dispatch::Invoker;
use tandem::state::MemoryStateStore;
use tandem::types::DatabaseId;
use tandem::{BackendError, TandemError};

fn id(s: &str) -> DatabaseId {
    DatabaseId::new(s)
}

/// Execute `sql` on the database and return its id.
fn statement(sql: &'static str) -> impl Invoker<Output = DatabaseId> {
    move |database: Arc<Database>| async move {
        let mut connection = database.connect().await?;
        let result = connection.execute(sql).await;
        let _ = connection.close().await;
        result.map(|_| database.id().clone())
    }
}

/// Sleep for `delay` on every database, tracking peak concurrency.
fn tracked(delay: Duration, running: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> impl Invoker<Output = ()> {
    move |_database: Arc<Database>| {
        let running = running.clone();
        let peak = peak.clone();
        async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, BackendError>(())
        }
    }
}

async fn started(databases: &[&str]) -> TestCluster {
    let env = TestCluster::new(databases);
    env.activate_all(databases).await;
    env
}

// =============================================================================
// Writes
// =============================================================================

#[tokio::test]
async fn test_write_reaches_every_active_database() {
    let env = started(&["a", "b", "c"]).await;

    let outcome = env.cluster.write(statement("UPDATE t SET x = 1")).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.first(), Some(&id("a")));
    let reached: Vec<_> = outcome.into_results().into_iter().map(|(db, _)| db).collect();
    assert_eq!(reached, ids(&["a", "b", "c"]));
    for db in ["a", "b", "c"] {
        assert!(env
            .backend(db)
            .executed()
            .contains(&"UPDATE t SET x = 1".to_string()));
    }
}

#[tokio::test]
async fn test_write_deactivates_dead_database_and_returns_survivor() {
    let env = started(&["a", "b"]).await;
    env.backend("a").set_alive(false);

    let outcome = env.cluster.write(statement("UPDATE t SET x = 1")).await.unwrap();

    assert!(outcome.is_complete());
    assert_eq!(outcome.first(), Some(&id("b")));
    assert!(outcome.get(&id("a")).is_none());
    assert_active(&env.cluster, &["b"]);
    assert_eq!(env.persisted().as_deref(), Some("b"));
}

#[tokio::test]
async fn test_write_deactivates_each_dead_database() {
    let env = started(&["a", "b", "c", "d", "e"]).await;
    for db in ["b", "d", "e"] {
        env.backend(db).set_alive(false);
    }

    let outcome = env.cluster.write(statement("DELETE FROM t")).await.unwrap();

    assert_eq!(outcome.results.len(), 2);
    assert_active(&env.cluster, &["a", "c"]);
    assert_eq!(env.cluster.inactive_databases(), ids(&["b", "d", "e"]));
}

#[tokio::test]
async fn test_write_reports_failures_of_live_databases() {
    let env = started(&["a", "b"]).await;
    env.backend("b").fail_statements(
        "INSERT",
        BackendError::new("duplicate key").with_sql_state("23505"),
    );

    let outcome = env.cluster.write(statement("INSERT INTO t VALUES (1)")).await.unwrap();

    assert!(!outcome.is_complete());
    assert_eq!(outcome.first(), Some(&id("a")));
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].database, id("b"));
    assert_eq!(outcome.failures[0].error.sql_state.as_deref(), Some("23505"));
    assert_active(&env.cluster, &["a", "b"]);
}

#[tokio::test]
async fn test_write_failing_everywhere_returns_last_error() {
    let env = started(&["a", "b"]).await;
    for db in ["a", "b"] {
        env.backend(db).fail_statements(
            "INSERT",
            BackendError::new(format!("constraint violated on {}", db)).with_sql_state("23514"),
        );
    }

    let err = env
        .cluster
        .write(statement("INSERT INTO t VALUES (1)"))
        .await
        .unwrap_err();

    match err {
        TandemError::Backend { database, source } => {
            assert_eq!(database, id("b"));
            assert_eq!(source.message, "constraint violated on b");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_active(&env.cluster, &["a", "b"]);
}

#[tokio::test]
async fn test_write_with_every_database_dead() {
    let env = started(&["a", "b"]).await;
    env.backend("a").set_alive(false);
    env.backend("b").set_alive(false);

    let err = env.cluster.write(statement("DELETE FROM t")).await.unwrap_err();

    assert!(matches!(err, TandemError::NoActiveDatabase { .. }));
    assert_active(&env.cluster, &[]);
    assert_eq!(env.persisted().as_deref(), Some(""));
}

#[tokio::test]
async fn test_write_on_empty_cluster() {
    let env = TestCluster::new(&["a"]);
    let err = env.cluster.write(statement("DELETE FROM t")).await.unwrap_err();
    assert!(matches!(err, TandemError::NoActiveDatabase { .. }));
}

#[tokio::test]
async fn test_write_concurrency_is_bounded_by_pool() {
    let env = started(&["a", "b", "c", "d"]).await;
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    env.cluster.set_max_threads(1).unwrap();
    env.cluster
        .write(tracked(Duration::from_millis(20), running.clone(), peak.clone()))
        .await
        .unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);

    peak.store(0, Ordering::SeqCst);
    env.cluster.set_max_threads(4).unwrap();
    env.cluster
        .write(tracked(Duration::from_millis(20), running.clone(), peak.clone()))
        .await
        .unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_write_waits_for_activation_in_progress() {
    let env = started(&["a", "b"]).await;
    env.cluster.add(tandem::config::DatabaseDescriptor::new("c", "mock://c")).unwrap();
    env.strategy.slow_down(Duration::from_millis(300));

    let activating = {
        let cluster = env.cluster.clone();
        tokio::spawn(async move { cluster.activate(&DatabaseId::new("c")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        env.cluster.state(&id("c")),
        Some(tandem::DatabaseState::Activating)
    );

    let outcome = env.cluster.write(statement("UPDATE t SET x = 2")).await.unwrap();

    assert!(activating.await.unwrap().unwrap());
    // The write ran only after the new member joined
    assert_eq!(outcome.results.len(), 3);
    assert!(outcome.get(&id("c")).is_some());
}

#[tokio::test]
async fn test_stop_cancels_in_flight_write() {
    let env = started(&["a", "b"]).await;

    let writing = {
        let cluster = env.cluster.clone();
        tokio::spawn(async move {
            let running = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));
            cluster
                .write(tracked(Duration::from_secs(30), running, peak))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    env.cluster.stop();

    let result = tokio::time::timeout(Duration::from_secs(5), writing)
        .await
        .expect("write cancelled promptly")
        .unwrap();
    assert!(matches!(result, Err(TandemError::Shutdown)));

    // Nothing is accepted after stop
    let err = env.cluster.write(statement("DELETE FROM t")).await.unwrap_err();
    assert!(matches!(err, TandemError::Shutdown));
    assert_active(&env.cluster, &["a", "b"]);
}

// =============================================================================
// Reads
// =============================================================================

#[tokio::test]
async fn test_read_retries_on_next_database_when_pick_is_dead() {
    let mut config = cluster_config("test", &["a", "b"]);
    config.balancer = BalancerKind::Simple;
    let env = TestCluster::with_config(config, Arc::new(MemoryStateStore::new()));
    env.activate_all(&["a", "b"]).await;
    env.backend("a").set_alive(false);

    let served_by = env.cluster.read(statement("SELECT * FROM t")).await.unwrap();

    assert_eq!(served_by, id("b"));
    assert_active(&env.cluster, &["b"]);
}

#[tokio::test]
async fn test_read_failure_on_live_database_is_returned() {
    let env = started(&["a"]).await;
    env.backend("a").fail_statements(
        "SELECT * FROM missing",
        BackendError::new("relation does not exist").with_sql_state("42P01"),
    );

    let err = env
        .cluster
        .read(statement("SELECT * FROM missing"))
        .await
        .unwrap_err();

    assert!(err.is_backend_error());
    assert_active(&env.cluster, &["a"]);
}

#[tokio::test]
async fn test_simple_balancer_prefers_heaviest_database() {
    let mut config = cluster_config("test", &["a", "b", "c"]);
    config.balancer = BalancerKind::Simple;
    config.databases[1].weight = 5;
    let env = TestCluster::with_config(config, Arc::new(MemoryStateStore::new()));
    env.activate_all(&["a", "b", "c"]).await;

    for _ in 0..5 {
        let served_by = env.cluster.read(statement("SELECT 2")).await.unwrap();
        assert_eq!(served_by, id("b"));
    }
}

#[tokio::test]
async fn test_round_robin_spreads_reads_by_weight() {
    let mut config = cluster_config("test", &["a", "b"]);
    config.balancer = BalancerKind::RoundRobin;
    config.databases[0].weight = 1;
    config.databases[1].weight = 3;
    let env = TestCluster::with_config(config, Arc::new(MemoryStateStore::new()));
    env.activate_all(&["a", "b"]).await;

    let mut served: HashMap<DatabaseId, usize> = HashMap::new();
    for _ in 0..40 {
        let served_by = env.cluster.read(statement("SELECT 2")).await.unwrap();
        *served.entry(served_by).or_default() += 1;
    }

    assert_eq!(served.get(&id("a")), Some(&10));
    assert_eq!(served.get(&id("b")), Some(&30));
}

#[tokio::test]
async fn test_read_after_stop_is_rejected() {
    let env = started(&["a"]).await;
    env.cluster.stop();

    let err = env.cluster.read(statement("SELECT 2")).await.unwrap_err();
    assert!(matches!(err, TandemError::Shutdown));
}
