//! Actor-based check scheduling
//!
//! Each assigned check runs in its own worker actor, an independent async
//! task driven by an interval timer and controlled through an mpsc command
//! channel.
//!
//! ## Architecture Overview
//!
//! ```text
//!              ┌────────────────┐
//!              │ CheckScheduler │  (owned by the daemon's refetch actor)
//!              └───────┬────────┘
//!                      │ spawns / updates / cancels
//!        ┌─────────────┼─────────────┐
//!        │             │             │
//!  ┌─────▼─────┐ ┌─────▼─────┐ ┌─────▼─────┐
//!  │ Worker #7 │ │ Worker #4 │ │ Worker #1 │
//!  └─────┬─────┘ └─────┬─────┘ └─────┬─────┘
//!        └─────────────┼─────────────┘
//!                      │ run_cycle
//!              ┌───────▼────────┐
//!              │ CheckPipeline  │  evaluate → persist → triggers
//!              └────────────────┘
//! ```
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: each worker has an mpsc command channel for control messages
//! 2. **State**: a watch channel exposes whether a cycle is in flight
//! 3. **Request/Response**: oneshot channels for evaluate-now and status queries

pub mod check_worker;
pub mod messages;
pub mod scheduler;

pub use check_worker::{CheckPipeline, CheckWorkerHandle};
pub use messages::{CheckState, CycleReport, WorkerStatus};
pub use scheduler::{CheckScheduler, ScheduleReport};
