//! Persistence layer for durable execution
//!
//! This module provides:
//! - [`WorkflowEventStore`] trait for histories, task queue, timers and signals
//! - [`InMemoryWorkflowEventStore`] for tests and single-process runs
//! - [`PostgresWorkflowEventStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryWorkflowEventStore;
pub use postgres::PostgresWorkflowEventStore;
pub use store::{
    ClaimedTask, ExpiredTask, HeartbeatResponse, NewWorkflowInstance, StoreError, TaskDefinition,
    TaskStatus, TimerDefinition, WorkflowEventStore, WorkflowInfo, WorkflowStatus,
};
