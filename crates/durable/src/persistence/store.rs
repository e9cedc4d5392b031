//! WorkflowEventStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::{ActivityDeadlines, TimeoutType};
use crate::workflow::{ActivityOptions, EventRecord, HistoryEvent, ParentLink, WorkflowSignal};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    /// Optimistic append failed: another writer extended the history first
    #[error("concurrency conflict: expected sequence {expected}, got {actual}")]
    ConcurrencyConflict { expected: i64, actual: i64 },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Workflow run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    TimedOut,
    Canceled,
    ContinuedAsNew,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
            Self::ContinuedAsNew => "continued_as_new",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "timed_out" => Ok(Self::TimedOut),
            "canceled" => Ok(Self::Canceled),
            "continued_as_new" => Ok(Self::ContinuedAsNew),
            other => Err(StoreError::Serialization(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

/// Activity task status in the queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    TimedOut,
    Canceled,
}

impl TaskStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Claimed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
            Self::Canceled => "canceled",
        }
    }
}

/// Data needed to create a workflow run
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkflowInstance {
    pub id: Uuid,
    pub namespace: String,
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub parent: Option<ParentLink>,
    pub continued_from: Option<Uuid>,
    /// Run closes as TimedOut once reached
    pub execution_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Stored metadata of a workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInfo {
    /// Run id; the primary key of the instance
    pub id: Uuid,
    pub namespace: String,
    /// Business id shared by all runs of a continue-as-new chain
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    pub status: WorkflowStatus,
    pub input: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
    pub parent: Option<ParentLink>,
    pub continued_from: Option<Uuid>,
    pub execution_deadline: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl From<NewWorkflowInstance> for WorkflowInfo {
    fn from(new: NewWorkflowInstance) -> Self {
        Self {
            id: new.id,
            namespace: new.namespace,
            workflow_id: new.workflow_id,
            workflow_type: new.workflow_type,
            task_queue: new.task_queue,
            status: WorkflowStatus::Running,
            input: new.input,
            result: None,
            error: None,
            parent: new.parent,
            continued_from: new.continued_from,
            execution_deadline: new.execution_deadline,
            created_at: new.created_at,
            closed_at: None,
        }
    }
}

/// Activity task to be enqueued
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDefinition {
    pub instance_id: Uuid,
    /// Correlation id of the `ActivityScheduled` event
    pub seq: u32,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    pub scheduled_at: DateTime<Utc>,
}

/// A task claimed by a worker
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub seq: u32,
    pub activity_type: String,
    pub task_queue: String,
    pub input: serde_json::Value,
    pub options: ActivityOptions,
    /// Attempt being run (1-based)
    pub attempt: u32,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

impl ClaimedTask {
    pub fn deadlines(&self) -> ActivityDeadlines {
        ActivityDeadlines {
            scheduled_at: self.scheduled_at,
            started_at: Some(self.started_at),
            start_to_close: self.options.start_to_close_timeout,
            schedule_to_close: self.options.schedule_to_close_timeout,
        }
    }
}

/// Task whose deadline passed without a result
#[derive(Debug, Clone, PartialEq)]
pub struct ExpiredTask {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub seq: u32,
    pub attempt: u32,
    pub timeout_type: TimeoutType,
}

/// Response to a heartbeat
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResponse {
    /// Set once the owning workflow requested cancellation
    pub should_cancel: bool,
}

/// Durable timer awaiting its deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerDefinition {
    pub instance_id: Uuid,
    pub seq: u32,
    pub fire_at: DateTime<Utc>,
    /// History sequence of `TimerStarted`; breaks ties between equal deadlines
    pub started_sequence: i64,
}

/// Storage for workflow histories, activity tasks, timers and signal inboxes
///
/// Every operation keyed by `(instance_id, seq)` is idempotent so that
/// effects can be safely re-issued after a crash between committing a
/// command and performing it.
#[async_trait]
pub trait WorkflowEventStore: Send + Sync + 'static {
    // =========================================================================
    // Workflow Instances
    // =========================================================================

    async fn create_workflow(&self, workflow: NewWorkflowInstance) -> Result<(), StoreError>;

    async fn get_workflow_info(&self, instance_id: Uuid) -> Result<WorkflowInfo, StoreError>;

    async fn get_workflow_status(&self, instance_id: Uuid) -> Result<WorkflowStatus, StoreError> {
        Ok(self.get_workflow_info(instance_id).await?.status)
    }

    /// Close a run with its result or error
    async fn update_workflow_status(
        &self,
        instance_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInfo>, StoreError>;

    /// Running instances whose execution deadline is at or before `now`
    async fn expired_workflows(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError>;

    // =========================================================================
    // History Log
    // =========================================================================

    /// Append events atomically at `expected_sequence`.
    ///
    /// Returns the next sequence number. Fails with `ConcurrencyConflict`
    /// if the history's length differs from `expected_sequence`.
    async fn append_events(
        &self,
        instance_id: Uuid,
        expected_sequence: i64,
        recorded_at: DateTime<Utc>,
        events: Vec<HistoryEvent>,
    ) -> Result<i64, StoreError>;

    /// Lazily stream events with `sequence >= from_sequence`
    fn read_from(
        &self,
        instance_id: Uuid,
        from_sequence: i64,
    ) -> BoxStream<'_, Result<EventRecord, StoreError>>;

    async fn load_events(&self, instance_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        self.read_from(instance_id, 0).try_collect().await
    }

    /// Sequence number the next appended event will receive
    async fn next_sequence(&self, instance_id: Uuid) -> Result<i64, StoreError>;

    // =========================================================================
    // Activity Task Queue
    // =========================================================================

    /// Enqueue a task; returns the existing task id if `(instance_id, seq)`
    /// was already enqueued
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError>;

    /// Claim up to `max_tasks` visible pending tasks of the given types,
    /// oldest first
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError>;

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse, StoreError>;

    /// Return a claimed task to the queue for another attempt
    async fn retry_task(
        &self,
        task_id: Uuid,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Move a task to a final status. Returns false when the task was no
    /// longer active (canceled, timed out, or already finished).
    async fn finish_task(&self, task_id: Uuid, status: TaskStatus) -> Result<bool, StoreError>;

    /// Tasks whose StartToClose or ScheduleToClose deadline passed
    async fn expired_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>, StoreError>;

    /// Cancel pending tasks of an instance and flag claimed ones so their
    /// heartbeats report `should_cancel`
    async fn cancel_workflow_tasks(&self, instance_id: Uuid) -> Result<usize, StoreError>;

    /// Whether `(instance_id, seq)` has a task in any status
    async fn has_task(&self, instance_id: Uuid, seq: u32) -> Result<bool, StoreError>;

    // =========================================================================
    // Timers
    // =========================================================================

    /// Register a timer; re-registering `(instance_id, seq)` is a no-op
    async fn schedule_timer(&self, timer: TimerDefinition) -> Result<(), StoreError>;

    /// Remove a timer; returns false if it no longer existed
    async fn remove_timer(&self, instance_id: Uuid, seq: u32) -> Result<bool, StoreError>;

    /// Timers with `fire_at <= now`, ordered by deadline then start sequence
    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerDefinition>, StoreError>;

    async fn cancel_workflow_timers(&self, instance_id: Uuid) -> Result<usize, StoreError>;

    /// Earliest moment anything becomes due: a timer deadline, a delayed
    /// retry becoming visible, or a workflow execution deadline
    async fn next_wakeup(&self, after: DateTime<Utc>)
        -> Result<Option<DateTime<Utc>>, StoreError>;

    // =========================================================================
    // Signal Inbox
    // =========================================================================

    async fn send_signal(&self, instance_id: Uuid, signal: WorkflowSignal)
        -> Result<(), StoreError>;

    /// Unprocessed signals in send order
    async fn get_pending_signals(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowSignal>, StoreError>;

    /// Mark the first `count` pending signals as processed
    async fn mark_signals_processed(&self, instance_id: Uuid, count: usize)
        -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_string_roundtrip() {
        for status in [
            WorkflowStatus::Running,
            WorkflowStatus::Completed,
            WorkflowStatus::Failed,
            WorkflowStatus::TimedOut,
            WorkflowStatus::Canceled,
            WorkflowStatus::ContinuedAsNew,
        ] {
            let parsed: WorkflowStatus = status.as_str().parse().expect("should parse");
            assert_eq!(parsed, status);
        }
        assert!("pending".parse::<WorkflowStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!WorkflowStatus::Running.is_terminal());
        assert!(WorkflowStatus::ContinuedAsNew.is_terminal());
        assert!(TaskStatus::Claimed.is_active());
        assert!(!TaskStatus::Canceled.is_active());
    }
}
