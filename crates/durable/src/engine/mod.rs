//! Workflow execution engine
//!
//! The engine module provides the `WorkflowExecutor`, which drives workflow
//! code through deterministic replay of its event history and commits the
//! decisions the code takes. Activity results, timers and child workflows
//! feed back into histories through the executor.

mod children;
mod clock;
mod coordinator;
mod executor;
mod registry;
pub(crate) mod replay;
mod replayer;
mod schedule;
mod timers;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coordinator::ActivityOutcome;
pub use executor::{
    ExecutorConfig, ExecutorError, ProcessResult, StartWorkflowOptions, WorkflowExecutor,
};
pub use registry::{RegistryError, WorkflowDescriptor, WorkflowFn, WorkflowRegistry};
pub use replayer::{ReplayResult, Replayer};
pub use schedule::CronSchedule;
