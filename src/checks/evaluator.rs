//! Expression evaluation
//!
//! Evaluation never fails because of missing data: no hosts, a metric absent
//! from a host, or a missing historical aggregate all count as failing. Only
//! storage errors while resolving hosts abort the evaluation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use futures::future::join_all;
use tracing::{debug, instrument, warn};

use super::model::{
    AggregateKind, CheckDefinition, ClusterId, Expression, ExpressionKind, ExpressionResult,
    HostSelection, LogThreshold, MetricThreshold, RelativeThreshold,
};
use super::probes::{ProbeOutcome, Prober};
use super::reducer::reduce;
use crate::HostSnapshot;
use crate::storage::StorageBackend;

pub struct ExpressionEvaluator {
    storage: Arc<dyn StorageBackend>,
    prober: Arc<dyn Prober>,
    hosts_freshness: Duration,
}

impl ExpressionEvaluator {
    pub fn new(storage: Arc<dyn StorageBackend>, prober: Arc<dyn Prober>, hosts_freshness: Duration) -> Self {
        Self {
            storage,
            prober,
            hosts_freshness,
        }
    }

    /// Evaluate every expression of `check` in order and reduce the verdicts.
    ///
    /// Returns the expressions with their `result` filled in, plus the final
    /// verdict (`true` = failing).
    #[instrument(skip(self, check), fields(cluster_id = check.cluster_id, check_id = check.id))]
    pub async fn eval_expressions(&self, check: &CheckDefinition) -> anyhow::Result<(Vec<Expression>, bool)> {
        let hosts = self.resolve_hosts(check).await?;
        debug!("evaluating {} expressions against {} hosts", check.expressions.len(), hosts.len());

        let mut evaluated = Vec::with_capacity(check.expressions.len());
        for expression in &check.expressions {
            let result = self.eval_expression(check, &hosts, &expression.kind).await;
            evaluated.push(expression.clone().with_result(result));
        }

        let verdict = reduce(&evaluated);
        Ok((evaluated, verdict))
    }

    async fn resolve_hosts(&self, check: &CheckDefinition) -> anyhow::Result<Vec<HostSnapshot>> {
        match &check.hosts {
            HostSelection::Query(predicate) => self
                .storage
                .query_hosts(check.cluster_id, predicate, self.hosts_freshness)
                .await
                .context("failed to run hosts query"),
            HostSelection::List(names) => self
                .storage
                .hosts_by_names(check.cluster_id, names)
                .await
                .context("failed to load hosts list"),
        }
    }

    async fn eval_expression(
        &self,
        check: &CheckDefinition,
        hosts: &[HostSnapshot],
        kind: &ExpressionKind,
    ) -> ExpressionResult {
        match kind {
            ExpressionKind::RawHostData(expression) => eval_raw_host_data(hosts, expression),
            ExpressionKind::RelativeHostData(expression) => {
                self.eval_relative_host_data(check.cluster_id, hosts, expression).await
            }
            ExpressionKind::LogData(expression) => {
                let targets = probe_targets(check, hosts);
                self.eval_log_data(check.cluster_id, &targets, expression).await
            }
            ExpressionKind::Ping(probe) => {
                let targets = probe_targets(check, hosts);
                let outcomes = join_all(targets.iter().map(|host| self.prober.ping(host))).await;
                probe_result(probe.min_host, targets, outcomes)
            }
            ExpressionKind::Ssh(probe) => {
                let targets = probe_targets(check, hosts);
                let outcomes = join_all(targets.iter().map(|host| self.prober.ssh(host, probe))).await;
                probe_result(probe.min_host, targets, outcomes)
            }
            ExpressionKind::Http(probe) => {
                let targets = probe_targets(check, hosts);
                let outcomes = join_all(targets.iter().map(|host| self.prober.http(host, probe))).await;
                probe_result(probe.min_host, targets, outcomes)
            }
            ExpressionKind::BooleanOperator(_) => ExpressionResult::default(),
        }
    }

    async fn eval_relative_host_data(
        &self,
        cluster_id: ClusterId,
        hosts: &[HostSnapshot],
        expression: &RelativeThreshold,
    ) -> ExpressionResult {
        if hosts.is_empty() {
            return ExpressionResult::no_hosts();
        }

        let metric_id = match self.storage.metric_id(cluster_id, &expression.metric).await {
            Ok(Some(id)) => Some(id),
            Ok(None) => {
                debug!("metric {} is not in the catalogue", expression.metric);
                None
            }
            Err(e) => {
                warn!("failed to look up metric {}: {e}", expression.metric);
                None
            }
        };

        let mut verdicts = Vec::with_capacity(hosts.len());
        for host in hosts {
            let bad = match metric_id {
                Some(metric_id) => self.host_exceeds_history(cluster_id, metric_id, host, expression).await,
                None => true,
            };
            verdicts.push((host.hostname.clone(), bad));
        }

        ExpressionResult::from_hosts(expression.min_host, verdicts)
    }

    async fn host_exceeds_history(
        &self,
        cluster_id: ClusterId,
        metric_id: i64,
        host: &HostSnapshot,
        expression: &RelativeThreshold,
    ) -> bool {
        let Some(current) = host.metric(&expression.metric) else {
            return true;
        };

        let aggregate = match self
            .storage
            .aggregate(cluster_id, metric_id, &host.hostname, expression.prev_range)
            .await
        {
            Ok(Some(aggregate)) => aggregate,
            Ok(None) => return true,
            Err(e) => {
                warn!("failed to aggregate {} for {}: {e}", expression.metric, host.hostname);
                return true;
            }
        };

        let historical = match expression.prev_aggr {
            AggregateKind::Avg => aggregate.avg,
            AggregateKind::Max => aggregate.max,
            AggregateKind::Min => aggregate.min,
            AggregateKind::Sum => aggregate.sum,
        };
        if historical <= 0.0 {
            return true;
        }

        let percentage = (current / historical) * 100.0;
        expression.operator.holds(percentage, expression.value)
    }

    async fn eval_log_data(
        &self,
        cluster_id: ClusterId,
        targets: &[String],
        expression: &LogThreshold,
    ) -> ExpressionResult {
        if targets.is_empty() {
            return ExpressionResult::no_hosts();
        }

        let since = Utc::now() - chrono::Duration::minutes(expression.prev_range);
        let mut verdicts = Vec::with_capacity(targets.len());

        for hostname in targets {
            let bad = match self
                .storage
                .count_matching(cluster_id, hostname, &expression.search, since)
                .await
            {
                Ok(count) => expression.operator.holds(count as f64, expression.value),
                Err(e) => {
                    warn!("failed to count logs for {hostname}: {e}");
                    true
                }
            };
            verdicts.push((hostname.clone(), bad));
        }

        ExpressionResult::from_hosts(expression.min_host, verdicts)
    }
}

/// Evaluate a current-value threshold against host snapshots.
///
/// Pure: the result depends only on `hosts` and `expression`.
pub fn eval_raw_host_data(hosts: &[HostSnapshot], expression: &MetricThreshold) -> ExpressionResult {
    if hosts.is_empty() {
        return ExpressionResult::no_hosts();
    }

    let verdicts = hosts.iter().map(|host| {
        let bad = host
            .metric(&expression.metric)
            .is_none_or(|value| expression.operator.holds(value, expression.value));
        (host.hostname.clone(), bad)
    });

    ExpressionResult::from_hosts(expression.min_host, verdicts)
}

/// Hostnames targeted by log searches and live probes: the explicit host
/// list when one is configured, otherwise the resolved hosts.
fn probe_targets(check: &CheckDefinition, hosts: &[HostSnapshot]) -> Vec<String> {
    match check.hosts_list() {
        [] => hosts.iter().map(|host| host.hostname.clone()).collect(),
        names => names.to_vec(),
    }
}

fn probe_result(min_host: usize, targets: Vec<String>, outcomes: Vec<ProbeOutcome>) -> ExpressionResult {
    if targets.is_empty() {
        return ExpressionResult::no_hosts();
    }

    let verdicts = targets.into_iter().zip(outcomes).map(|(hostname, outcome)| {
        if let ProbeOutcome::Unreachable(reason) = &outcome {
            debug!("{hostname} is unreachable: {reason}");
        }
        (hostname, outcome.is_bad())
    });

    ExpressionResult::from_hosts(min_host, verdicts)
}
