//! CheckScheduler - One worker per assigned check
//!
//! Each refetch hands the scheduler this daemon's full share of checks.
//! The scheduler diffs it against the running workers: checks that moved
//! away are cancelled, new ones get a worker, edited ones are updated in
//! place. A check that is still owned never gets a second worker.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info, instrument, warn};

use super::check_worker::{CheckPipeline, CheckWorkerHandle};
use super::messages::CheckState;
use crate::checks::model::{CheckDefinition, CheckId};

/// What one `apply` call changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScheduleReport {
    pub started: Vec<CheckId>,
    pub updated: Vec<CheckId>,
    pub stopped: Vec<CheckId>,
    /// Checks left unscheduled because their interval does not parse
    pub rejected: Vec<CheckId>,
}

struct ScheduledCheck {
    definition: CheckDefinition,
    handle: CheckWorkerHandle,
}

pub struct CheckScheduler {
    pipeline: Arc<CheckPipeline>,
    workers: HashMap<CheckId, ScheduledCheck>,
    /// Invalid intervals already reported, so each is logged once
    rejected: HashMap<CheckId, String>,
}

impl CheckScheduler {
    pub fn new(pipeline: Arc<CheckPipeline>) -> Self {
        Self {
            pipeline,
            workers: HashMap::new(),
            rejected: HashMap::new(),
        }
    }

    /// Reconcile running workers with `assigned`.
    #[instrument(skip(self, assigned), fields(assigned = assigned.len()))]
    pub async fn apply(&mut self, assigned: Vec<CheckDefinition>) -> ScheduleReport {
        let mut report = ScheduleReport::default();
        let owned: HashSet<CheckId> = assigned.iter().map(|check| check.id).collect();

        let gone: Vec<CheckId> = self
            .workers
            .keys()
            .filter(|id| !owned.contains(id))
            .copied()
            .collect();
        for check_id in gone {
            if let Some(scheduled) = self.workers.remove(&check_id) {
                scheduled.handle.abort();
                report.stopped.push(check_id);
            }
            self.pipeline.triggers().forget_check(check_id);
        }
        self.rejected.retain(|id, _| owned.contains(id));

        for check in assigned {
            let check_id = check.id;

            if let Err(e) = check.interval() {
                if self.rejected.get(&check_id) != Some(&check.interval) {
                    warn!(check_id, "not scheduling check: {e:#}");
                    self.rejected.insert(check_id, check.interval.clone());
                }
                if let Some(scheduled) = self.workers.remove(&check_id) {
                    scheduled.handle.abort();
                    report.stopped.push(check_id);
                }
                self.pipeline.triggers().forget_check(check_id);
                report.rejected.push(check_id);
                continue;
            }
            self.rejected.remove(&check_id);

            match self.workers.get_mut(&check_id) {
                Some(scheduled) if scheduled.handle.state() != CheckState::Stopped => {
                    if scheduled.definition == check {
                        continue;
                    }
                    self.pipeline.triggers().forget_removed_triggers(&check);
                    match scheduled.handle.update(check.clone()).await {
                        Ok(()) => {
                            scheduled.definition = check;
                            report.updated.push(check_id);
                        }
                        Err(e) => {
                            warn!(check_id, "worker rejected update, restarting: {e:#}");
                            if let Some(old) = self.workers.remove(&check_id) {
                                old.handle.abort();
                            }
                            if self.start(check) {
                                report.started.push(check_id);
                            }
                        }
                    }
                }
                _ => {
                    if let Some(old) = self.workers.remove(&check_id) {
                        debug!(check_id, "replacing stopped worker");
                        old.handle.abort();
                    }
                    if self.start(check) {
                        report.started.push(check_id);
                    }
                }
            }
        }

        if !(report.started.is_empty() && report.updated.is_empty() && report.stopped.is_empty()) {
            info!(
                "schedule: {} started, {} updated, {} stopped, {} running",
                report.started.len(),
                report.updated.len(),
                report.stopped.len(),
                self.workers.len()
            );
        }
        report
    }

    fn start(&mut self, check: CheckDefinition) -> bool {
        let check_id = check.id;
        match CheckWorkerHandle::spawn(check.clone(), self.pipeline.clone()) {
            Ok(handle) => {
                self.workers.insert(
                    check_id,
                    ScheduledCheck {
                        definition: check,
                        handle,
                    },
                );
                true
            }
            Err(e) => {
                warn!(check_id, "failed to start check worker: {e:#}");
                false
            }
        }
    }

    pub fn worker(&self, check_id: CheckId) -> Option<&CheckWorkerHandle> {
        self.workers.get(&check_id).map(|scheduled| &scheduled.handle)
    }

    pub fn worker_state(&self, check_id: CheckId) -> Option<CheckState> {
        self.worker(check_id).map(CheckWorkerHandle::state)
    }

    /// Ids of checks with a worker, ascending.
    pub fn running_ids(&self) -> Vec<CheckId> {
        let mut ids: Vec<CheckId> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop every worker, letting in-flight cycles finish.
    pub async fn shutdown_all(&mut self) {
        let workers: Vec<_> = self.workers.drain().map(|(_, scheduled)| scheduled.handle).collect();
        debug!("stopping {} check workers", workers.len());
        join_all(workers.into_iter().map(CheckWorkerHandle::shutdown)).await;
    }
}
