//! In-memory storage backend (no persistence)
//!
//! Useful for:
//! - Testing without database dependencies
//! - Running a single daemon against data seeded at start-up
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Unbounded**: Nothing is pruned; expired violations are only hidden

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{
    CheckStore, ClusterStore, HealthStatus, HostDataStore, LogCountStore, MetricAggregate,
    MetricAggregateStore, StorageBackend, ViolationStore, freshness_cutoff,
};
use super::error::StorageResult;
use super::host_query::{HostQuery, full_text_matches};
use crate::HostSnapshot;
use crate::checks::model::{CheckDefinition, CheckId, ClusterId, Expression, StoredCheck, ViolationRecord};

#[derive(Default)]
struct Inner {
    checks: BTreeMap<CheckId, StoredCheck>,
    hosts: BTreeMap<(ClusterId, String), HostSnapshot>,
    metric_ids: HashMap<(ClusterId, String), i64>,
    /// (cluster, metric id, hostname) -> samples
    metric_series: HashMap<(ClusterId, i64, String), Vec<(DateTime<Utc>, f64)>>,
    logs: Vec<(ClusterId, String, DateTime<Utc>, String)>,
    violations: Vec<ViolationRecord>,
    retention: HashMap<(ClusterId, String), u32>,
}

/// In-memory storage backend
///
/// State lives behind a tokio `RwLock` so the backend can be shared as
/// `Arc<dyn StorageBackend>` between every check worker.
#[derive(Default)]
pub struct MemoryBackend {
    inner: RwLock<Inner>,
}

impl MemoryBackend {
    /// Create a new in-memory backend
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_check(&self, check: &CheckDefinition) -> StorageResult<()> {
        let stored = StoredCheck::from_definition(check)?;
        self.inner.write().await.checks.insert(check.id, stored);
        Ok(())
    }

    pub async fn remove_check(&self, check_id: CheckId) {
        self.inner.write().await.checks.remove(&check_id);
    }

    pub async fn upsert_host(&self, cluster_id: ClusterId, host: HostSnapshot) {
        self.inner
            .write()
            .await
            .hosts
            .insert((cluster_id, host.hostname.clone()), host);
    }

    /// Record a historical sample, registering the metric key if needed.
    pub async fn add_metric_sample(
        &self,
        cluster_id: ClusterId,
        key: &str,
        hostname: &str,
        at: DateTime<Utc>,
        value: f64,
    ) {
        let mut inner = self.inner.write().await;
        let next_id = inner.metric_ids.len() as i64 + 1;
        let metric_id = *inner
            .metric_ids
            .entry((cluster_id, key.to_string()))
            .or_insert(next_id);
        inner
            .metric_series
            .entry((cluster_id, metric_id, hostname.to_string()))
            .or_default()
            .push((at, value));
    }

    pub async fn add_log_line(
        &self,
        cluster_id: ClusterId,
        hostname: &str,
        at: DateTime<Utc>,
        line: &str,
    ) {
        self.inner
            .write()
            .await
            .logs
            .push((cluster_id, hostname.to_string(), at, line.to_string()));
    }

    pub async fn set_retention(&self, cluster_id: ClusterId, table: &str, days: u32) {
        self.inner
            .write()
            .await
            .retention
            .insert((cluster_id, table.to_string()), days);
    }

    /// Append an already-built record, bypassing retention computation.
    pub async fn insert_violation(&self, record: ViolationRecord) {
        self.inner.write().await.violations.push(record);
    }

    /// Every stored record for a check in insertion order, expired ones included.
    pub async fn violation_history(&self, check_id: CheckId) -> Vec<ViolationRecord> {
        self.inner
            .read()
            .await
            .violations
            .iter()
            .filter(|record| record.check_id == check_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CheckStore for MemoryBackend {
    async fn all_checks(&self) -> StorageResult<Vec<StoredCheck>> {
        Ok(self.inner.read().await.checks.values().cloned().collect())
    }
}

#[async_trait]
impl HostDataStore for MemoryBackend {
    async fn query_hosts(
        &self,
        cluster_id: ClusterId,
        predicate: &str,
        freshness: Duration,
    ) -> StorageResult<Vec<HostSnapshot>> {
        let query = HostQuery::parse(predicate)?;
        let cutoff = freshness_cutoff(freshness);

        let inner = self.inner.read().await;
        let hosts: Vec<_> = inner
            .hosts
            .iter()
            .filter(|((cluster, _), host)| {
                *cluster == cluster_id && host.updated >= cutoff && query.matches(host)
            })
            .map(|(_, host)| host.clone())
            .collect();

        debug!("host query matched {} hosts", hosts.len());
        Ok(hosts)
    }

    async fn hosts_by_names(
        &self,
        cluster_id: ClusterId,
        names: &[String],
    ) -> StorageResult<Vec<HostSnapshot>> {
        let inner = self.inner.read().await;
        Ok(names
            .iter()
            .filter_map(|name| inner.hosts.get(&(cluster_id, name.clone())).cloned())
            .collect())
    }
}

#[async_trait]
impl MetricAggregateStore for MemoryBackend {
    async fn metric_id(&self, cluster_id: ClusterId, key: &str) -> StorageResult<Option<i64>> {
        Ok(self
            .inner
            .read()
            .await
            .metric_ids
            .get(&(cluster_id, key.to_string()))
            .copied())
    }

    async fn aggregate(
        &self,
        cluster_id: ClusterId,
        metric_id: i64,
        hostname: &str,
        minutes_back: i64,
    ) -> StorageResult<Option<MetricAggregate>> {
        let since = Utc::now() - chrono::Duration::minutes(minutes_back);
        let inner = self.inner.read().await;

        let values: Vec<f64> = inner
            .metric_series
            .get(&(cluster_id, metric_id, hostname.to_string()))
            .map(|series| {
                series
                    .iter()
                    .filter(|(at, _)| *at >= since)
                    .map(|(_, value)| *value)
                    .collect()
            })
            .unwrap_or_default();

        if values.is_empty() {
            return Ok(None);
        }

        let sum: f64 = values.iter().sum();
        Ok(Some(MetricAggregate {
            avg: sum / values.len() as f64,
            max: values.iter().copied().fold(f64::MIN, f64::max),
            min: values.iter().copied().fold(f64::MAX, f64::min),
            sum,
        }))
    }
}

#[async_trait]
impl LogCountStore for MemoryBackend {
    async fn count_matching(
        &self,
        cluster_id: ClusterId,
        hostname: &str,
        search: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let inner = self.inner.read().await;
        let count = inner
            .logs
            .iter()
            .filter(|(cluster, host, at, line)| {
                *cluster == cluster_id
                    && host == hostname
                    && *at >= since
                    && full_text_matches(line, search)
            })
            .count();
        Ok(count as u64)
    }
}

#[async_trait]
impl ViolationStore for MemoryBackend {
    async fn create(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
        result: bool,
        expressions: &[Expression],
        retention: chrono::Duration,
    ) -> StorageResult<ViolationRecord> {
        let created = Utc::now();
        let record = ViolationRecord {
            cluster_id,
            check_id,
            created,
            result,
            expressions: expressions.to_vec(),
            expires_at: created + retention,
        };
        self.inner.write().await.violations.push(record.clone());
        Ok(record)
    }

    async fn last_good(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
    ) -> StorageResult<Option<ViolationRecord>> {
        let inner = self.inner.read().await;
        Ok(inner
            .violations
            .iter()
            .filter(|r| r.cluster_id == cluster_id && r.check_id == check_id && !r.result)
            .max_by_key(|r| r.created)
            .cloned())
    }

    async fn violations_since(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
        lower_bound: DateTime<Utc>,
    ) -> StorageResult<Vec<ViolationRecord>> {
        let now = Utc::now();
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner
            .violations
            .iter()
            .filter(|r| {
                r.cluster_id == cluster_id
                    && r.check_id == check_id
                    && r.result
                    && r.created > lower_bound
                    && r.is_retained(now)
            })
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created.cmp(&a.created));
        Ok(records)
    }
}

#[async_trait]
impl ClusterStore for MemoryBackend {
    async fn retention_days(&self, cluster_id: ClusterId, table: &str) -> StorageResult<Option<u32>> {
        Ok(self
            .inner
            .read()
            .await
            .retention
            .get(&(cluster_id, table.to_string()))
            .copied())
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let inner = self.inner.read().await;
        let mut metadata = HashMap::new();
        metadata.insert("checks".to_string(), inner.checks.len().to_string());
        metadata.insert("hosts".to_string(), inner.hosts.len().to_string());
        metadata.insert("violations".to_string(), inner.violations.len().to_string());

        Ok(HealthStatus {
            healthy: true,
            message: "in-memory backend operational".to_string(),
            metadata,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        Ok(())
    }
}
