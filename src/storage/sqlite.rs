//! SQLite storage backend implementation
//!
//! ## Features
//!
//! - **Embedded**: No separate database server required
//! - **WAL mode**: Check workers keep reading while violations are appended
//! - **Connection pooling**: Shared by every check worker of the daemon
//! - **Migrations**: Automatic schema versioning with sqlx
//!
//! Timestamps are stored as Unix milliseconds. JSON columns (`expressions`,
//! `triggers`, `hosts_list`, host `data`/`tags`) keep the shape existing
//! check definitions were written with.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::backend::{
    CheckStore, ClusterStore, HealthStatus, HostDataStore, LogCountStore, MetricAggregate,
    MetricAggregateStore, StorageBackend, ViolationStore, freshness_cutoff,
};
use super::error::{StorageError, StorageResult};
use super::host_query::HostQuery;
use crate::HostSnapshot;
use crate::checks::model::{CheckDefinition, CheckId, ClusterId, Expression, StoredCheck, ViolationRecord};

/// SQLite storage backend
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
    db_path: String,
}

impl SqliteBackend {
    /// Create a new SQLite backend
    ///
    /// This will:
    /// 1. Create the database file if it doesn't exist
    /// 2. Run migrations to create tables
    /// 3. Configure SQLite for WAL mode
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        info!("database migrations complete");

        Ok(Self {
            pool,
            db_path: db_path_str,
        })
    }

    fn timestamp_to_millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn millis_to_timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn row_to_host(row: &SqliteRow) -> StorageResult<HostSnapshot> {
        let data: String = row.try_get("data")?;
        let tags: String = row.try_get("tags")?;

        Ok(HostSnapshot {
            hostname: row.try_get("hostname")?,
            updated: Self::millis_to_timestamp(row.try_get("updated")?),
            data: serde_json::from_str::<BTreeMap<String, serde_json::Value>>(&data)?,
            tags: serde_json::from_str::<HashMap<String, String>>(&tags)?,
        })
    }

    fn row_to_violation(row: &SqliteRow) -> StorageResult<ViolationRecord> {
        let expressions: String = row.try_get("expressions")?;
        let result: i64 = row.try_get("result")?;

        Ok(ViolationRecord {
            cluster_id: row.try_get("cluster_id")?,
            check_id: row.try_get("check_id")?,
            created: Self::millis_to_timestamp(row.try_get("created")?),
            result: result != 0,
            expressions: serde_json::from_str(&expressions)?,
            expires_at: Self::millis_to_timestamp(row.try_get("deleted")?),
        })
    }

    // ========================================================================
    // Writers for data owned by other parts of the platform
    // ========================================================================

    pub async fn insert_check(&self, check: &CheckDefinition) -> StorageResult<()> {
        let stored = StoredCheck::from_definition(check)?;

        sqlx::query(
            r#"
            INSERT INTO checks (
                id, cluster_id, name, interval, is_silenced,
                hosts_query, hosts_list, expressions, triggers
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                cluster_id = excluded.cluster_id,
                name = excluded.name,
                interval = excluded.interval,
                is_silenced = excluded.is_silenced,
                hosts_query = excluded.hosts_query,
                hosts_list = excluded.hosts_list,
                expressions = excluded.expressions,
                triggers = excluded.triggers
            "#,
        )
        .bind(stored.id)
        .bind(stored.cluster_id)
        .bind(&stored.name)
        .bind(&stored.interval)
        .bind(stored.is_silenced)
        .bind(&stored.hosts_query)
        .bind(&stored.hosts_list)
        .bind(&stored.expressions)
        .bind(&stored.triggers)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_host(&self, cluster_id: ClusterId, host: &HostSnapshot) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO hosts (cluster_id, hostname, updated, data, tags)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT (cluster_id, hostname) DO UPDATE SET
                updated = excluded.updated,
                data = excluded.data,
                tags = excluded.tags
            "#,
        )
        .bind(cluster_id)
        .bind(&host.hostname)
        .bind(Self::timestamp_to_millis(&host.updated))
        .bind(serde_json::to_string(&host.data)?)
        .bind(serde_json::to_string(&host.tags)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn add_metric_sample(
        &self,
        cluster_id: ClusterId,
        key: &str,
        hostname: &str,
        at: DateTime<Utc>,
        value: f64,
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO metrics (cluster_id, name) VALUES (?, ?) ON CONFLICT DO NOTHING")
            .bind(cluster_id)
            .bind(key)
            .execute(&mut *tx)
            .await?;

        let metric_id: i64 = sqlx::query_scalar("SELECT id FROM metrics WHERE cluster_id = ? AND name = ?")
            .bind(cluster_id)
            .bind(key)
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO ts_metrics (cluster_id, metric_id, hostname, created, value) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(cluster_id)
        .bind(metric_id)
        .bind(hostname)
        .bind(Self::timestamp_to_millis(&at))
        .bind(value)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn add_log_line(
        &self,
        cluster_id: ClusterId,
        hostname: &str,
        at: DateTime<Utc>,
        line: &str,
    ) -> StorageResult<()> {
        sqlx::query("INSERT INTO ts_logs (cluster_id, hostname, created, logline) VALUES (?, ?, ?, ?)")
            .bind(cluster_id)
            .bind(hostname)
            .bind(Self::timestamp_to_millis(&at))
            .bind(line)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_retention(&self, cluster_id: ClusterId, table: &str, days: u32) -> StorageResult<()> {
        let mut retention = self.retention_map(cluster_id).await?;
        retention.insert(table.to_string(), days);

        sqlx::query(
            r#"
            INSERT INTO clusters (id, data_retention) VALUES (?, ?)
            ON CONFLICT (id) DO UPDATE SET data_retention = excluded.data_retention
            "#,
        )
        .bind(cluster_id)
        .bind(serde_json::to_string(&retention)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn retention_map(&self, cluster_id: ClusterId) -> StorageResult<HashMap<String, u32>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT data_retention FROM clusters WHERE id = ?")
            .bind(cluster_id)
            .fetch_optional(&self.pool)
            .await?;

        match raw {
            Some(raw) if !raw.trim().is_empty() => Ok(serde_json::from_str(&raw)?),
            _ => Ok(HashMap::new()),
        }
    }
}

#[async_trait]
impl CheckStore for SqliteBackend {
    #[instrument(skip(self))]
    async fn all_checks(&self) -> StorageResult<Vec<StoredCheck>> {
        let rows = sqlx::query(
            r#"
            SELECT id, cluster_id, name, interval, is_silenced,
                   hosts_query, hosts_list, expressions, triggers
            FROM checks
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let checks = rows
            .iter()
            .map(|row| -> StorageResult<StoredCheck> {
                Ok(StoredCheck {
                    id: row.try_get("id")?,
                    cluster_id: row.try_get("cluster_id")?,
                    name: row.try_get("name")?,
                    interval: row.try_get("interval")?,
                    is_silenced: row.try_get("is_silenced")?,
                    hosts_query: row.try_get("hosts_query")?,
                    hosts_list: row.try_get("hosts_list")?,
                    expressions: row.try_get("expressions")?,
                    triggers: row.try_get("triggers")?,
                })
            })
            .collect::<StorageResult<Vec<_>>>()?;

        debug!("loaded {} check definitions", checks.len());
        Ok(checks)
    }
}

#[async_trait]
impl HostDataStore for SqliteBackend {
    #[instrument(skip(self, predicate))]
    async fn query_hosts(
        &self,
        cluster_id: ClusterId,
        predicate: &str,
        freshness: Duration,
    ) -> StorageResult<Vec<HostSnapshot>> {
        let query = HostQuery::parse(predicate)?;
        let cutoff = Self::timestamp_to_millis(&freshness_cutoff(freshness));

        let rows = sqlx::query(
            "SELECT hostname, updated, data, tags FROM hosts WHERE cluster_id = ? AND updated >= ? ORDER BY hostname",
        )
        .bind(cluster_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        let mut hosts = Vec::with_capacity(rows.len());
        for row in &rows {
            let host = Self::row_to_host(row)?;
            if query.matches(&host) {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }

    async fn hosts_by_names(
        &self,
        cluster_id: ClusterId,
        names: &[String],
    ) -> StorageResult<Vec<HostSnapshot>> {
        let mut hosts = Vec::with_capacity(names.len());
        for name in names {
            let row = sqlx::query(
                "SELECT hostname, updated, data, tags FROM hosts WHERE cluster_id = ? AND hostname = ?",
            )
            .bind(cluster_id)
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(row) = row {
                hosts.push(Self::row_to_host(&row)?);
            }
        }
        Ok(hosts)
    }
}

#[async_trait]
impl MetricAggregateStore for SqliteBackend {
    async fn metric_id(&self, cluster_id: ClusterId, key: &str) -> StorageResult<Option<i64>> {
        let id = sqlx::query_scalar("SELECT id FROM metrics WHERE cluster_id = ? AND name = ?")
            .bind(cluster_id)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    async fn aggregate(
        &self,
        cluster_id: ClusterId,
        metric_id: i64,
        hostname: &str,
        minutes_back: i64,
    ) -> StorageResult<Option<MetricAggregate>> {
        let since = Utc::now() - chrono::Duration::minutes(minutes_back);

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS samples, AVG(value) AS avg, MAX(value) AS max,
                   MIN(value) AS min, SUM(value) AS sum
            FROM ts_metrics
            WHERE cluster_id = ? AND metric_id = ? AND hostname = ? AND created >= ?
            "#,
        )
        .bind(cluster_id)
        .bind(metric_id)
        .bind(hostname)
        .bind(Self::timestamp_to_millis(&since))
        .fetch_one(&self.pool)
        .await?;

        let samples: i64 = row.try_get("samples")?;
        if samples == 0 {
            return Ok(None);
        }

        Ok(Some(MetricAggregate {
            avg: row.try_get("avg")?,
            max: row.try_get("max")?,
            min: row.try_get("min")?,
            sum: row.try_get("sum")?,
        }))
    }
}

#[async_trait]
impl LogCountStore for SqliteBackend {
    async fn count_matching(
        &self,
        cluster_id: ClusterId,
        hostname: &str,
        search: &str,
        since: DateTime<Utc>,
    ) -> StorageResult<u64> {
        let terms: Vec<String> = search.split_whitespace().map(str::to_lowercase).collect();

        let mut sql = String::from(
            "SELECT COUNT(*) FROM ts_logs WHERE cluster_id = ? AND hostname = ? AND created >= ?",
        );
        for _ in &terms {
            sql.push_str(" AND instr(lower(logline), ?) > 0");
        }

        let mut query = sqlx::query_scalar::<_, i64>(&sql)
            .bind(cluster_id)
            .bind(hostname)
            .bind(Self::timestamp_to_millis(&since));
        for term in &terms {
            query = query.bind(term);
        }

        let count = query.fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl ViolationStore for SqliteBackend {
    #[instrument(skip(self, expressions), fields(count = expressions.len()))]
    async fn create(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
        result: bool,
        expressions: &[Expression],
        retention: chrono::Duration,
    ) -> StorageResult<ViolationRecord> {
        let created = Utc::now();
        let expires_at = created + retention;

        sqlx::query(
            r#"
            INSERT INTO ts_checks (cluster_id, check_id, created, result, expressions, deleted)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(cluster_id)
        .bind(check_id)
        .bind(Self::timestamp_to_millis(&created))
        .bind(result)
        .bind(serde_json::to_string(expressions)?)
        .bind(Self::timestamp_to_millis(&expires_at))
        .execute(&self.pool)
        .await?;

        Ok(ViolationRecord {
            cluster_id,
            check_id,
            created,
            result,
            expressions: expressions.to_vec(),
            expires_at,
        })
    }

    async fn last_good(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
    ) -> StorageResult<Option<ViolationRecord>> {
        let row = sqlx::query(
            r#"
            SELECT cluster_id, check_id, created, result, expressions, deleted
            FROM ts_checks
            WHERE cluster_id = ? AND check_id = ? AND result = 0
            ORDER BY created DESC
            LIMIT 1
            "#,
        )
        .bind(cluster_id)
        .bind(check_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(Self::row_to_violation).transpose()
    }

    async fn violations_since(
        &self,
        cluster_id: ClusterId,
        check_id: CheckId,
        lower_bound: DateTime<Utc>,
    ) -> StorageResult<Vec<ViolationRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT cluster_id, check_id, created, result, expressions, deleted
            FROM ts_checks
            WHERE cluster_id = ? AND check_id = ? AND result = 1
              AND created > ? AND deleted > ?
            ORDER BY created DESC
            "#,
        )
        .bind(cluster_id)
        .bind(check_id)
        .bind(Self::timestamp_to_millis(&lower_bound))
        .bind(Self::timestamp_to_millis(&Utc::now()))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_violation).collect()
    }
}

#[async_trait]
impl ClusterStore for SqliteBackend {
    async fn retention_days(&self, cluster_id: ClusterId, table: &str) -> StorageResult<Option<u32>> {
        Ok(self.retention_map(cluster_id).await?.get(table).copied())
    }
}

#[async_trait]
impl StorageBackend for SqliteBackend {
    async fn health_check(&self) -> StorageResult<HealthStatus> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        let checks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM checks")
            .fetch_one(&self.pool)
            .await?;

        let mut metadata = HashMap::new();
        metadata.insert("path".to_string(), self.db_path.clone());
        metadata.insert("checks".to_string(), checks.to_string());

        Ok(HealthStatus {
            healthy: true,
            message: "SQLite backend operational".to_string(),
            metadata,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        info!("closing SQLite backend");
        self.pool.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checks::model::{ExpressionKind, ExpressionResult, HostSelection, PingProbe};

    async fn backend() -> (tempfile::TempDir, SqliteBackend) {
        let temp_dir = tempfile::tempdir().unwrap();
        let backend = SqliteBackend::new(temp_dir.path().join("test.db")).await.unwrap();
        (temp_dir, backend)
    }

    #[tokio::test]
    async fn test_sqlite_backend_creation() {
        let (_dir, backend) = backend().await;

        let health = backend.health_check().await.unwrap();
        assert!(health.healthy);
        assert!(health.message.contains("operational"));
    }

    #[tokio::test]
    async fn test_check_definitions_round_trip() {
        let (_dir, backend) = backend().await;
        let check = CheckDefinition {
            id: 4,
            cluster_id: 1,
            name: "ping web".to_string(),
            interval: "1m".to_string(),
            hosts: HostSelection::Query("hostname ~^ web".to_string()),
            expressions: vec![Expression::new(ExpressionKind::Ping(PingProbe { min_host: 1 }))],
            triggers: Vec::new(),
            is_silenced: false,
        };

        backend.insert_check(&check).await.unwrap();
        backend.insert_check(&check).await.unwrap();

        let stored = backend.all_checks().await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].clone().into_definition().unwrap(), check);
    }

    #[tokio::test]
    async fn test_query_hosts_applies_predicate() {
        let (_dir, backend) = backend().await;
        backend
            .upsert_host(1, &HostSnapshot::new("web-1").with_metric("/stuff.Score", 100))
            .await
            .unwrap();
        backend
            .upsert_host(1, &HostSnapshot::new("db-1").with_metric("/stuff.Score", 5))
            .await
            .unwrap();

        let hosts = backend
            .query_hosts(1, "/stuff.Score > 50", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].hostname, "web-1");
        assert_eq!(hosts[0].metric("/stuff.Score"), Some(100.0));

        let named = backend
            .hosts_by_names(1, &["db-1".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(named.len(), 1);
    }

    #[tokio::test]
    async fn test_aggregate_and_log_count() {
        let (_dir, backend) = backend().await;
        let now = Utc::now();
        for value in [10.0, 20.0, 30.0] {
            backend
                .add_metric_sample(1, "/load.1m", "web-1", now - chrono::Duration::minutes(1), value)
                .await
                .unwrap();
        }
        backend.add_log_line(1, "web-1", now, "ERROR disk full").await.unwrap();
        backend.add_log_line(1, "web-1", now, "error: Disk is FULL again").await.unwrap();
        backend.add_log_line(1, "web-1", now, "all good").await.unwrap();

        let metric_id = backend.metric_id(1, "/load.1m").await.unwrap().unwrap();
        let aggregate = backend.aggregate(1, metric_id, "web-1", 15).await.unwrap().unwrap();
        assert_eq!(aggregate.avg, 20.0);
        assert_eq!(aggregate.sum, 60.0);
        assert!(backend.metric_id(1, "/missing").await.unwrap().is_none());

        let since = now - chrono::Duration::minutes(5);
        assert_eq!(backend.count_matching(1, "web-1", "disk full", since).await.unwrap(), 2);
        assert_eq!(backend.count_matching(1, "web-2", "disk full", since).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_violation_history_queries() {
        let (_dir, backend) = backend().await;
        let expressions = vec![
            Expression::new(ExpressionKind::Ping(PingProbe { min_host: 1 })).with_result(ExpressionResult {
                value: true,
                bad_hostnames: vec!["web-1".to_string()],
                ..ExpressionResult::default()
            }),
        ];
        let retention = chrono::Duration::days(1);

        assert!(backend.last_good(1, 3).await.unwrap().is_none());

        backend.create(1, 3, false, &[], retention).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let first = backend.create(1, 3, true, &expressions, retention).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = backend.create(1, 3, true, &expressions, retention).await.unwrap();
        backend.create(1, 3, true, &expressions, chrono::Duration::zero()).await.unwrap();

        let last_good = backend.last_good(1, 3).await.unwrap().unwrap();
        assert!(!last_good.result);

        let violations = backend.violations_since(1, 3, last_good.created).await.unwrap();
        assert_eq!(violations.len(), 2);
        assert_eq!(violations[0].created.timestamp_millis(), second.created.timestamp_millis());
        assert_eq!(violations[1].created.timestamp_millis(), first.created.timestamp_millis());
        assert_eq!(violations[0].expressions, expressions);
    }

    #[tokio::test]
    async fn test_retention_settings() {
        let (_dir, backend) = backend().await;
        assert_eq!(backend.retention_days(1, "ts_checks").await.unwrap(), None);

        backend.set_retention(1, "ts_checks", 7).await.unwrap();
        backend.set_retention(1, "ts_logs", 2).await.unwrap();

        assert_eq!(backend.retention_days(1, "ts_checks").await.unwrap(), Some(7));
        assert_eq!(backend.retention_days(1, "ts_logs").await.unwrap(), Some(2));
    }
}
