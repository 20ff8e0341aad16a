//! Message types for actor communication
//!
//! Commands are sent to a specific actor over mpsc; replies come back on a
//! oneshot channel carried inside the command.

use tokio::sync::oneshot;

use crate::checks::model::{CheckDefinition, CheckId};

/// Outcome of one evaluate→persist→trigger cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Final reduced verdict (`true` = failing)
    pub verdict: bool,

    /// Whether a violation record was written
    pub recorded: bool,

    /// Notifications delivered by the trigger engine
    pub dispatched: usize,
}

/// Lifecycle of one check worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckState {
    /// Waiting for the next tick
    Idle,

    /// A cycle is in flight
    Running,

    /// The worker has exited
    Stopped,
}

/// Commands that can be sent to a CheckWorkerActor
#[derive(Debug)]
pub enum CheckCommand {
    /// Run one cycle immediately, outside the interval timer
    EvaluateNow {
        respond_to: oneshot::Sender<anyhow::Result<CycleReport>>,
    },

    /// Replace the definition the worker evaluates
    ///
    /// The interval timer restarts when the interval changed.
    UpdateDefinition(Box<CheckDefinition>),

    GetStatus {
        respond_to: oneshot::Sender<WorkerStatus>,
    },

    /// Finish any in-flight cycle and exit
    Shutdown,
}

/// Snapshot of a worker's state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub check_id: CheckId,
    pub state: CheckState,
    pub cycles: u64,
    pub last_verdict: Option<bool>,
}

/// Commands that can be sent to the refetch actor
#[derive(Debug)]
pub enum RefetchCommand {
    /// Reload and repartition checks; the reply carries the ids now owned
    Refetch {
        respond_to: Option<oneshot::Sender<anyhow::Result<Vec<CheckId>>>>,
    },

    /// Ids of the checks this daemon currently runs
    GetAssigned {
        respond_to: oneshot::Sender<Vec<CheckId>>,
    },

    Shutdown,
}
