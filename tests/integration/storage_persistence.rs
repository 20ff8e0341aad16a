//! Integration tests for the SQLite backend under a running daemon
//!
//! These tests verify that:
//! - Violation records written by check workers survive a reopen
//! - Host queries resolve against stored host snapshots
//! - Cluster retention settings apply to new records

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleet_checks::HostSnapshot;
use fleet_checks::checks::ExpressionEvaluator;
use fleet_checks::checks::model::HostSelection;
use fleet_checks::cluster::LocalBus;
use fleet_checks::daemon::CheckDaemon;
use fleet_checks::storage::StorageBackend;
use fleet_checks::storage::backend::{ClusterStore, VIOLATIONS_TABLE, ViolationStore};
use fleet_checks::storage::sqlite::SqliteBackend;
use tempfile::tempdir;

use crate::helpers::*;

#[tokio::test]
async fn test_violations_survive_reopen() {
    let temp_dir = tempdir().unwrap();
    let db_path = temp_dir.path().join("checks.db");

    let backend = Arc::new(SqliteBackend::new(&db_path).await.unwrap());
    backend
        .upsert_host(CLUSTER, &HostSnapshot::new("web-1").with_metric("load.LoadAvg1m", 7.5))
        .await
        .unwrap();
    backend.insert_check(&load_check(1, "1h", &["web-1"])).await.unwrap();

    let mailer = Arc::new(RecordingMailer::default());
    let daemon = CheckDaemon::new(
        test_config("10.0.0.1:55655"),
        backend.clone(),
        Arc::new(LocalBus::new()),
        dispatcher(mailer),
        Arc::new(FakeProber::default()),
    )
    .spawn();

    assert_eq!(daemon.refetch_now().await.unwrap(), vec![1]);

    // wait for the first cycle to land
    let since = Utc::now() - chrono::Duration::hours(1);
    let mut recorded = Vec::new();
    for _ in 0..50 {
        recorded = backend.violations_since(CLUSTER, 1, since).await.unwrap();
        if !recorded.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(recorded.len(), 1);

    daemon.shutdown().await;
    backend.close().await.unwrap();
    drop(backend);

    let reopened = SqliteBackend::new(&db_path).await.unwrap();
    let records = reopened.violations_since(CLUSTER, 1, since).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].result);
    assert_eq!(records[0].expressions[0].result.bad_hostnames, vec!["web-1"]);
    assert!(reopened.last_good(CLUSTER, 1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_host_query_check_against_sqlite() {
    let temp_dir = tempdir().unwrap();
    let backend = Arc::new(SqliteBackend::new(temp_dir.path().join("checks.db")).await.unwrap());

    for (hostname, role, load) in [("web-1", "web", 9.0), ("web-2", "web", 1.0), ("db-1", "db", 12.0)] {
        backend
            .upsert_host(
                CLUSTER,
                &HostSnapshot::new(hostname)
                    .with_metric("load.LoadAvg1m", load)
                    .with_tag("role", role),
            )
            .await
            .unwrap();
    }

    let mut check = load_check(2, "1m", &[]);
    check.hosts = HostSelection::Query("tags.role = web".to_string());

    let evaluator = ExpressionEvaluator::new(
        backend.clone(),
        Arc::new(FakeProber::default()),
        Duration::from_secs(300),
    );
    let (expressions, verdict) = evaluator.eval_expressions(&check).await.unwrap();

    assert!(verdict);
    assert_eq!(expressions[0].result.bad_hostnames, vec!["web-1"]);
    assert_eq!(expressions[0].result.good_hostnames, vec!["web-2"]);
}

#[tokio::test]
async fn test_cluster_retention_applies_to_new_records() {
    let temp_dir = tempdir().unwrap();
    let backend = SqliteBackend::new(temp_dir.path().join("checks.db")).await.unwrap();
    backend.set_retention(CLUSTER, VIOLATIONS_TABLE, 3).await.unwrap();

    let record = backend
        .create(CLUSTER, 1, false, &[], chrono::Duration::days(3))
        .await
        .unwrap();

    assert_eq!((record.expires_at - record.created).num_days(), 3);
    assert_eq!(
        backend.retention_days(CLUSTER, VIOLATIONS_TABLE).await.unwrap(),
        Some(3)
    );
}
