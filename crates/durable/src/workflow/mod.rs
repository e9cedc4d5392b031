//! Workflow abstractions and types
//!
//! This module contains the authoring surface:
//! - [`Workflow`] trait and the [`WorkflowError`] taxonomy
//! - [`WorkflowContext`] and the durable handles it returns
//! - [`HistoryEvent`] records persisted in an instance's history
//! - [`PendingCommand`] decisions awaiting commit
//! - [`WorkflowSignal`] for external communication

mod command;
mod context;
mod definition;
mod event;
mod future;
mod signal;

pub use command::{ActivityOptions, ChildWorkflowOptions, PendingCommand, WorkflowOutcome};
pub use context::{WorkflowContext, WorkflowLogger, WorkflowRunInfo};
pub use definition::{Workflow, WorkflowError, WorkflowErrorKind};
pub use event::{EventRecord, HistoryEvent, ParentLink};
pub use future::{
    ActivityHandle, ChildWorkflowHandle, Select, Selectable, Selector, SignalChannel, SignalRecv,
    TimerHandle,
};
pub use signal::WorkflowSignal;
