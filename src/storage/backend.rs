//! Storage trait definitions
//!
//! The check engine only reads and writes a narrow slice of the platform's
//! data. Each slice is its own trait; `StorageBackend` ties them together
//! so a single backend is chosen once and injected as
//! `Arc<dyn StorageBackend>`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::HostSnapshot;
use crate::checks::model::{CheckId, ClusterId, Expression, StoredCheck, ViolationRecord};

/// Table name under which violation retention is configured per cluster.
pub const VIOLATIONS_TABLE: &str = "ts_checks";

/// Historical aggregate of one metric on one host
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricAggregate {
    pub avg: f64,
    pub max: f64,
    pub min: f64,
    pub sum: f64,
}

/// Oldest `updated` timestamp still considered fresh.
pub(crate) fn freshness_cutoff(freshness: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(freshness)
        .ok()
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Health status of the storage backend
#[derive(Debug, Clone)]
pub struct HealthStatus {
    /// Is the backend operational?
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Check definitions, read-only to the engine.
#[async_trait]
pub trait CheckStore: Send + Sync {
    /// Every stored check across all clusters, JSON columns still encoded.
    async fn all_checks(&self) -> StorageResult<Vec<StoredCheck>>;
}

/// Latest per-host snapshots reported by agents.
#[async_trait]
pub trait HostDataStore: Send + Sync {
    /// Hosts of `cluster_id` updated within `freshness` that satisfy the
    /// host query `predicate`. An empty predicate matches every fresh host.
    async fn query_hosts(
        &self,
        cluster_id: ClusterId,
        predicate: &str,
        freshness: Duration,
    ) -> StorageResult<Vec<HostSnapshot>>;

    /// Hosts of `cluster_id` with the given names. Unknown names are
    /// silently absent from the result.
    async fn hosts_by_names(
        &self,
        cluster_id: ClusterId,
        names: &[String],
    ) -> StorageResult<Vec<HostSnapshot>>;
}

#[async_trait]
pub trait MetricAggregateStore: Send + Sync {
    /// Identifier of a metric key in the cluster's metric catalogue.
    async fn metric_id(&self, cluster_id: ClusterId, key: &str) -> StorageResult<Option<i64>>;

    /// Aggregate of the metric's time series for `hostname` over the last
    /// `minutes_back` minutes. `None` when there are no samples.
    async fn aggregate(
        &self,
        cluster_id: ClusterId,
        metric_id: i64,
        hostname: &str,
        minutes_back: i64,
    ) -> StorageResult<Option<MetricAggregate>>;
}

#[async_trait]
pub trait LogCountStore: Send + Sync {
    /// Number of log lines from `hostname` since `since` that contain every
    /// search term.
    async fn count_matching(
        &self,
        cluster_id: ClusterId,
        hostname: &str,
        search: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<u64>;
}

/// Append-only history of evaluation cycles.
#[async_trait]
pub trait ViolationStore: Send + Sync {
    /// Persist one evaluation cycle; the record expires after `retention`.
    async fn create(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
        result: bool,
        expressions: &[Expression],
        retention: chrono::Duration,
    ) -> StorageResult<ViolationRecord>;

    /// Most recent non-violating record, if any.
    async fn last_good(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
    ) -> StorageResult<Option<ViolationRecord>>;

    /// Violating records created strictly after `lower_bound`, newest first.
    /// Expired records are excluded.
    async fn violations_since(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
        lower_bound: DateTime<Utc>,
    ) -> StorageResult<Vec<ViolationRecord>>;
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Configured retention in days for `table`, if the cluster sets one.
    async fn retention_days(&self, cluster_id: ClusterId, table: &str)
    -> StorageResult<Option<u32>>;
}

/// Complete storage backend used by the daemon
///
/// Implementations must be `Send + Sync` as they are shared across every
/// check worker.
#[async_trait]
pub trait StorageBackend:
    CheckStore + HostDataStore + MetricAggregateStore + LogCountStore + ViolationStore + ClusterStore
{
    /// Check backend health
    ///
    /// Performs a lightweight operation to verify the backend is operational.
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    /// Close the backend and release resources
    async fn close(&self) -> StorageResult<()>;
}
