//! # Durable Replay
//!
//! A deterministic, replay-based workflow execution core. Workflow code is
//! ordinary sequential async Rust that survives process crashes: every
//! decision it makes is recorded in an append-only history, and its state
//! is rebuilt by re-running the code against that history.
//!
//! ## Features
//!
//! - **Event-sourced runs**: history is the source of truth; the engine
//!   replays it to resume a run after any restart
//! - **Durable timers and signals**: sleeps and signal waits survive crashes,
//!   and a [`Selector`](workflow::Selector) races them deterministically
//! - **Side effects**: non-deterministic values are recorded once and
//!   replayed verbatim
//! - **Activities**: dispatched through a task queue with StartToClose /
//!   ScheduleToClose timeouts and retry policies invisible to the workflow
//! - **Child workflows, cancellation and continue-as-new**
//! - **Time skipping**: [`testing::TestEnvironment`] runs a week-long
//!   workflow in milliseconds
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowExecutor                        │
//! │  (replays history, commits commands, performs effects)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   WorkflowEventStore                         │
//! │  (history log, task queue, timers, signal inbox)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkerPool                              │
//! │  (claims tasks, executes activities, fires timers)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use durable_replay::prelude::*;
//!
//! struct BackgroundCheck;
//!
//! impl Workflow for BackgroundCheck {
//!     const TYPE: &'static str = "background_check";
//!     type Input = String;
//!     type Output = String;
//!
//!     async fn run(ctx: WorkflowContext, ssn: String) -> Result<String, WorkflowError> {
//!         ctx.sleep(Duration::from_secs(60)).await?;
//!         ctx.execute_activity(
//!             "ssn_trace",
//!             &ssn,
//!             ActivityOptions::start_to_close(Duration::from_secs(10)),
//!         )
//!         .await
//!     }
//! }
//! ```

pub mod activity;
pub mod engine;
pub mod persistence;
pub mod reliability;
pub mod testing;
pub mod worker;
pub mod workflow;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
    pub use crate::engine::{
        ExecutorConfig, ExecutorError, Replayer, StartWorkflowOptions, WorkflowExecutor,
        WorkflowRegistry,
    };
    pub use crate::persistence::{
        ClaimedTask, InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError,
        WorkflowEventStore, WorkflowStatus,
    };
    pub use crate::reliability::{RetryPolicy, TimeoutType};
    pub use crate::testing::{HistoryBuilder, TestEnvironment};
    pub use crate::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
    pub use crate::workflow::{
        ActivityOptions, ChildWorkflowOptions, EventRecord, HistoryEvent, Workflow,
        WorkflowContext, WorkflowError, WorkflowErrorKind,
    };
    pub use std::time::Duration;
}

// Re-export key types at crate root
pub use activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
pub use engine::{
    ExecutorConfig, ExecutorError, Replayer, StartWorkflowOptions, WorkflowExecutor,
    WorkflowRegistry,
};
pub use persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, StoreError, WorkflowEventStore,
    WorkflowStatus,
};
pub use reliability::RetryPolicy;
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolError};
pub use workflow::{
    ActivityOptions, ChildWorkflowOptions, HistoryEvent, Workflow, WorkflowContext,
    WorkflowError, WorkflowSignal,
};
