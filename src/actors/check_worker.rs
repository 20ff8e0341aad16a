//! CheckWorkerActor - Runs one check on its interval
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick → Evaluate expressions → Persist violation record → Run triggers
//!     ↑
//!     └─── Commands (EvaluateNow, UpdateDefinition, GetStatus, Shutdown)
//! ```
//!
//! A cycle runs inline in the actor loop, so evaluations of one check never
//! overlap. Ticks missed while a cycle runs long are skipped, not queued.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior, interval_at};
use tracing::{debug, error, instrument, trace, warn};

use super::messages::{CheckCommand, CheckState, CycleReport, WorkerStatus};
use crate::checks::ExpressionEvaluator;
use crate::checks::model::{CheckDefinition, CheckId};
use crate::storage::StorageBackend;
use crate::storage::backend::VIOLATIONS_TABLE;
use crate::triggers::TriggerEngine;

/// The evaluate→persist→trigger cycle shared by every worker.
pub struct CheckPipeline {
    evaluator: ExpressionEvaluator,
    storage: Arc<dyn StorageBackend>,
    triggers: TriggerEngine,
    default_retention_days: u32,
}

impl CheckPipeline {
    pub fn new(
        evaluator: ExpressionEvaluator,
        storage: Arc<dyn StorageBackend>,
        triggers: TriggerEngine,
        default_retention_days: u32,
    ) -> Self {
        Self {
            evaluator,
            storage,
            triggers,
            default_retention_days,
        }
    }

    pub fn triggers(&self) -> &TriggerEngine {
        &self.triggers
    }

    /// Run one full cycle for `check`.
    ///
    /// Checks without expressions are evaluated but nothing is recorded.
    /// An error aborts only this cycle.
    #[instrument(skip(self, check), fields(cluster_id = check.cluster_id, check_id = check.id))]
    pub async fn run_cycle(&self, check: &CheckDefinition) -> Result<CycleReport> {
        let (expressions, verdict) = self
            .evaluator
            .eval_expressions(check)
            .await
            .context("failed to evaluate expressions")?;

        if expressions.is_empty() {
            trace!("check has no expressions, nothing to record");
            return Ok(CycleReport {
                verdict,
                recorded: false,
                dispatched: 0,
            });
        }

        let retention = self.retention(check).await;
        self.storage
            .create(check.cluster_id, check.id, verdict, &expressions, retention)
            .await
            .context("failed to persist violation record")?;

        let dispatched = self
            .triggers
            .run_triggers(check)
            .await
            .context("failed to run triggers")?;

        debug!(verdict, dispatched, "cycle complete");
        Ok(CycleReport {
            verdict,
            recorded: true,
            dispatched,
        })
    }

    async fn retention(&self, check: &CheckDefinition) -> chrono::Duration {
        let days = match self.storage.retention_days(check.cluster_id, VIOLATIONS_TABLE).await {
            Ok(Some(days)) => days,
            Ok(None) => self.default_retention_days,
            Err(e) => {
                warn!("failed to read cluster retention, using default: {e}");
                self.default_retention_days
            }
        };
        chrono::Duration::days(i64::from(days))
    }
}

/// Actor that evaluates a single check
pub struct CheckWorkerActor {
    check: CheckDefinition,
    period: Duration,
    pipeline: Arc<CheckPipeline>,
    command_rx: mpsc::Receiver<CheckCommand>,
    state_tx: watch::Sender<CheckState>,
    cycles: u64,
    last_verdict: Option<bool>,
}

impl CheckWorkerActor {
    pub fn new(
        check: CheckDefinition,
        period: Duration,
        pipeline: Arc<CheckPipeline>,
        command_rx: mpsc::Receiver<CheckCommand>,
        state_tx: watch::Sender<CheckState>,
    ) -> Self {
        Self {
            check,
            period,
            pipeline,
            command_rx,
            state_tx,
            cycles: 0,
            last_verdict: None,
        }
    }

    /// Run the actor's main loop until Shutdown or until every handle is gone.
    #[instrument(skip(self), fields(check_id = self.check.id))]
    pub async fn run(mut self) {
        debug!("starting check worker, interval {:?}", self.period);

        // the first cycle runs right away
        let mut ticker = new_ticker(Instant::now(), self.period);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.cycle().await {
                        error!("check cycle failed: {e:#}");
                    }
                }

                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(CheckCommand::EvaluateNow { respond_to }) => {
                            debug!("received EvaluateNow command");
                            let result = self.cycle().await;
                            let _ = respond_to.send(result);
                        }

                        Some(CheckCommand::UpdateDefinition(check)) => {
                            if let Some(period) = self.update(*check) {
                                ticker = new_ticker(Instant::now() + period, period);
                            }
                        }

                        Some(CheckCommand::GetStatus { respond_to }) => {
                            let _ = respond_to.send(self.status());
                        }

                        Some(CheckCommand::Shutdown) => {
                            debug!("received shutdown command");
                            break;
                        }

                        None => {
                            trace!("command channel closed, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.state_tx.send_replace(CheckState::Stopped);
        debug!("check worker stopped");
    }

    async fn cycle(&mut self) -> Result<CycleReport> {
        self.state_tx.send_replace(CheckState::Running);
        let result = self.pipeline.run_cycle(&self.check).await;
        self.state_tx.send_replace(CheckState::Idle);

        self.cycles += 1;
        if let Ok(report) = &result {
            self.last_verdict = Some(report.verdict);
        }
        result
    }

    /// Swap in a new definition. Returns the new period when the ticker has
    /// to be restarted.
    fn update(&mut self, check: CheckDefinition) -> Option<Duration> {
        let period = match check.interval() {
            Ok(period) => period,
            Err(e) => {
                warn!("ignoring update with invalid interval {:?}: {e}", check.interval);
                return None;
            }
        };

        self.check = check;
        if period == self.period {
            return None;
        }

        debug!("interval changed from {:?} to {period:?}", self.period);
        self.period = period;
        Some(period)
    }

    fn status(&self) -> WorkerStatus {
        WorkerStatus {
            check_id: self.check.id,
            state: *self.state_tx.borrow(),
            cycles: self.cycles,
            last_verdict: self.last_verdict,
        }
    }
}

fn new_ticker(start: Instant, period: Duration) -> Interval {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker
}

/// Handle for controlling a CheckWorkerActor
///
/// Owned by the scheduler; dropping it closes the command channel, which
/// stops the worker after its current cycle.
pub struct CheckWorkerHandle {
    sender: mpsc::Sender<CheckCommand>,
    state_rx: watch::Receiver<CheckState>,
    task: JoinHandle<()>,
    check_id: CheckId,
}

impl CheckWorkerHandle {
    /// Spawn a worker for `check`, which must carry a valid interval.
    pub fn spawn(check: CheckDefinition, pipeline: Arc<CheckPipeline>) -> Result<Self> {
        let period = check.interval()?;
        let check_id = check.id;

        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let (state_tx, state_rx) = watch::channel(CheckState::Idle);

        let actor = CheckWorkerActor::new(check, period, pipeline, cmd_rx, state_tx);
        let task = tokio::spawn(actor.run());

        Ok(Self {
            sender: cmd_tx,
            state_rx,
            task,
            check_id,
        })
    }

    pub fn check_id(&self) -> CheckId {
        self.check_id
    }

    /// Current state, without waiting for the actor.
    pub fn state(&self) -> CheckState {
        *self.state_rx.borrow()
    }

    /// Run a cycle right away and wait for its report.
    pub async fn evaluate_now(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CheckCommand::EvaluateNow { respond_to: tx })
            .await
            .context("failed to send EvaluateNow command")?;

        rx.await.context("failed to receive cycle report")?
    }

    pub async fn update(&self, check: CheckDefinition) -> Result<()> {
        self.sender
            .send(CheckCommand::UpdateDefinition(Box::new(check)))
            .await
            .context("failed to send UpdateDefinition command")
    }

    pub async fn status(&self) -> Result<WorkerStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CheckCommand::GetStatus { respond_to: tx })
            .await
            .context("failed to send GetStatus command")?;

        rx.await.context("failed to receive status")
    }

    /// Let any in-flight cycle finish, then wait for the worker to exit.
    pub async fn shutdown(self) {
        if self.sender.send(CheckCommand::Shutdown).await.is_err() {
            trace!(check_id = self.check_id, "worker already stopped");
        }
        if let Err(e) = self.task.await {
            warn!(check_id = self.check_id, "check worker ended abnormally: {e}");
        }
    }

    /// Cancel the worker immediately, dropping any in-flight cycle.
    pub fn abort(self) {
        self.task.abort();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::HostSnapshot;
    use crate::checks::model::{
        Comparison, Expression, ExpressionKind, HostSelection, MetricThreshold, SshProbe,
        HttpProbe, Trigger, TriggerAction,
    };
    use crate::checks::probes::{ProbeOutcome, Prober};
    use crate::storage::memory::MemoryBackend;
    use crate::triggers::NotificationDispatcher;
    use crate::triggers::notifiers::{PagerDutyClient, PagerDutyEvent};
    use async_trait::async_trait;
    use std::collections::HashMap;

    pub(crate) struct NoProbes;

    #[async_trait]
    impl Prober for NoProbes {
        async fn ping(&self, _hostname: &str) -> ProbeOutcome {
            ProbeOutcome::Reachable
        }

        async fn ssh(&self, _hostname: &str, _probe: &SshProbe) -> ProbeOutcome {
            ProbeOutcome::Reachable
        }

        async fn http(&self, _hostname: &str, _probe: &HttpProbe) -> ProbeOutcome {
            ProbeOutcome::Reachable
        }
    }

    struct NoPagerDuty;

    #[async_trait]
    impl PagerDutyClient for NoPagerDuty {
        async fn submit_trigger(&self, _event: &PagerDutyEvent) -> anyhow::Result<String> {
            anyhow::bail!("not configured")
        }
    }

    /// PagerDuty that opens incident `INC-7` for every event
    struct PagingPagerDuty;

    #[async_trait]
    impl PagerDutyClient for PagingPagerDuty {
        async fn submit_trigger(&self, _event: &PagerDutyEvent) -> anyhow::Result<String> {
            Ok("INC-7".to_string())
        }
    }

    fn pipeline_with(storage: Arc<MemoryBackend>, pagerduty: Arc<dyn PagerDutyClient>) -> Arc<CheckPipeline> {
        let evaluator = ExpressionEvaluator::new(storage.clone(), Arc::new(NoProbes), Duration::from_secs(300));
        let dispatcher = NotificationDispatcher::new(None, pagerduty, HashMap::new());
        let triggers = TriggerEngine::new(storage.clone(), Arc::new(dispatcher));
        Arc::new(CheckPipeline::new(evaluator, storage, triggers, 1))
    }

    pub(crate) fn pipeline(storage: Arc<MemoryBackend>) -> Arc<CheckPipeline> {
        pipeline_with(storage, Arc::new(NoPagerDuty))
    }

    pub(crate) fn paging_pipeline(storage: Arc<MemoryBackend>) -> Arc<CheckPipeline> {
        pipeline_with(storage, Arc::new(PagingPagerDuty))
    }

    pub(crate) fn pagerduty_trigger(id: i64) -> Trigger {
        Trigger {
            id,
            low_violations_count: 1,
            high_violations_count: None,
            created_interval_minute: 60,
            action: TriggerAction::PagerDuty {
                service_key: "svc".to_string(),
                description: "load".to_string(),
                incident_key: String::new(),
            },
        }
    }

    pub(crate) fn load_check(id: i64, interval: &str) -> CheckDefinition {
        CheckDefinition {
            id,
            cluster_id: 1,
            name: format!("load-{id}"),
            interval: interval.to_string(),
            hosts: HostSelection::List(vec!["web-1".to_string()]),
            expressions: vec![Expression::new(ExpressionKind::RawHostData(MetricThreshold {
                metric: "load.LoadAvg1m".to_string(),
                operator: Comparison::Greater,
                value: 4.0,
                min_host: 1,
            }))],
            triggers: Vec::new(),
            is_silenced: false,
        }
    }

    async fn storage_with_load(load: f64) -> Arc<MemoryBackend> {
        let storage = Arc::new(MemoryBackend::new());
        storage
            .upsert_host(1, HostSnapshot::new("web-1").with_metric("load.LoadAvg1m", load))
            .await;
        storage
    }

    #[tokio::test]
    async fn test_cycle_records_verdict() {
        let storage = storage_with_load(9.5).await;
        let report = pipeline(storage.clone()).run_cycle(&load_check(1, "1m")).await.unwrap();

        assert!(report.verdict);
        assert!(report.recorded);

        let history = storage.violation_history(1).await;
        assert_eq!(history.len(), 1);
        assert!(history[0].result);
        assert_eq!(history[0].expressions[0].result.bad_hostnames, vec!["web-1"]);
    }

    #[tokio::test]
    async fn test_cycle_uses_cluster_retention() {
        let storage = storage_with_load(1.0).await;
        storage.set_retention(1, VIOLATIONS_TABLE, 7).await;

        pipeline(storage.clone()).run_cycle(&load_check(1, "1m")).await.unwrap();

        let record = &storage.violation_history(1).await[0];
        let retained = record.expires_at - record.created;
        assert_eq!(retained.num_days(), 7);
    }

    #[tokio::test]
    async fn test_check_without_expressions_is_not_recorded() {
        let storage = storage_with_load(1.0).await;
        let mut check = load_check(1, "1m");
        check.expressions.clear();

        let report = pipeline(storage.clone()).run_cycle(&check).await.unwrap();

        assert!(!report.recorded);
        assert!(storage.violation_history(1).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_worker_runs_on_interval() {
        let storage = storage_with_load(1.0).await;
        let handle = CheckWorkerHandle::spawn(load_check(1, "1m"), pipeline(storage.clone())).unwrap();

        // cycles at 0s, 60s and 120s
        tokio::time::sleep(Duration::from_secs(150)).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.cycles, 3);
        assert_eq!(status.last_verdict, Some(false));
        assert_eq!(storage.violation_history(1).await.len(), 3);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_evaluate_now_and_update() {
        let storage = storage_with_load(9.0).await;
        let handle = CheckWorkerHandle::spawn(load_check(1, "1h"), pipeline(storage.clone())).unwrap();

        let report = handle.evaluate_now().await.unwrap();
        assert!(report.verdict);

        let mut relaxed = load_check(1, "1h");
        if let ExpressionKind::RawHostData(threshold) = &mut relaxed.expressions[0].kind {
            threshold.value = 20.0;
        }
        handle.update(relaxed).await.unwrap();

        let report = handle.evaluate_now().await.unwrap();
        assert!(!report.verdict);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_spawn_rejects_invalid_interval() {
        let storage = storage_with_load(1.0).await;
        assert!(CheckWorkerHandle::spawn(load_check(1, "soon"), pipeline(storage)).is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_worker() {
        let storage = storage_with_load(1.0).await;
        let handle = CheckWorkerHandle::spawn(load_check(1, "1h"), pipeline(storage)).unwrap();
        let state_rx = handle.state_rx.clone();

        handle.shutdown().await;
        assert_eq!(*state_rx.borrow(), CheckState::Stopped);
    }
}
