//! Decisions emitted by workflow code and the options that shape them

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{HistoryEvent, WorkflowError};
use crate::reliability::RetryPolicy;

/// A decision taken during the current execution pass, not yet durable
///
/// Each one becomes exactly one command event in history when the driver
/// commits the activation, and only then is its effect (task dispatch,
/// timer registration, child start) allowed to happen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum PendingCommand {
    ScheduleActivity {
        seq: u32,
        activity_type: String,
        task_queue: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    StartTimer {
        seq: u32,
        fire_at: DateTime<Utc>,
        #[serde(with = "duration_millis")]
        duration: Duration,
    },

    /// Cancel a timer that has not fired; references the timer's seq
    CancelTimer { seq: u32 },

    RecordSideEffect {
        seq: u32,
        value: serde_json::Value,
    },

    StartChildWorkflow {
        seq: u32,
        workflow_type: String,
        workflow_id: String,
        input: serde_json::Value,
        options: ChildWorkflowOptions,
    },
}

impl PendingCommand {
    pub fn seq(&self) -> u32 {
        match self {
            PendingCommand::ScheduleActivity { seq, .. }
            | PendingCommand::StartTimer { seq, .. }
            | PendingCommand::CancelTimer { seq }
            | PendingCommand::RecordSideEffect { seq, .. }
            | PendingCommand::StartChildWorkflow { seq, .. } => *seq,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PendingCommand::ScheduleActivity { .. } => "schedule_activity",
            PendingCommand::StartTimer { .. } => "start_timer",
            PendingCommand::CancelTimer { .. } => "cancel_timer",
            PendingCommand::RecordSideEffect { .. } => "record_side_effect",
            PendingCommand::StartChildWorkflow { .. } => "start_child_workflow",
        }
    }

    /// Whether `event` is the history record of this command.
    ///
    /// Payloads are not compared: only the command kind, its correlation id
    /// and the activity/child type, so that inputs computed from replayed
    /// values never cause false positives.
    pub fn matches(&self, event: &HistoryEvent) -> bool {
        match (self, event) {
            (
                PendingCommand::ScheduleActivity {
                    seq, activity_type, ..
                },
                HistoryEvent::ActivityScheduled {
                    seq: recorded,
                    activity_type: recorded_type,
                    ..
                },
            ) => seq == recorded && activity_type == recorded_type,
            (
                PendingCommand::StartTimer { seq, .. },
                HistoryEvent::TimerStarted { seq: recorded, .. },
            ) => seq == recorded,
            (PendingCommand::CancelTimer { seq }, HistoryEvent::TimerCanceled { seq: recorded }) => {
                seq == recorded
            }
            (
                PendingCommand::RecordSideEffect { seq, .. },
                HistoryEvent::SideEffectRecorded { seq: recorded, .. },
            ) => seq == recorded,
            (
                PendingCommand::StartChildWorkflow {
                    seq, workflow_type, ..
                },
                HistoryEvent::ChildWorkflowStarted {
                    seq: recorded,
                    workflow_type: recorded_type,
                    ..
                },
            ) => seq == recorded && workflow_type == recorded_type,
            _ => false,
        }
    }
}

/// How a run ends, as decided by its code
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkflowOutcome {
    Completed { result: serde_json::Value },
    Failed { error: WorkflowError },
    Canceled { reason: String },
    ContinuedAsNew { input: serde_json::Value },
}

impl WorkflowOutcome {
    pub fn into_event(self, new_instance_id: Option<uuid::Uuid>) -> HistoryEvent {
        match self {
            WorkflowOutcome::Completed { result } => HistoryEvent::WorkflowCompleted { result },
            WorkflowOutcome::Failed { error } => HistoryEvent::WorkflowFailed { error },
            WorkflowOutcome::Canceled { reason } => HistoryEvent::WorkflowCanceled { reason },
            WorkflowOutcome::ContinuedAsNew { input } => HistoryEvent::WorkflowContinuedAsNew {
                input,
                new_instance_id: new_instance_id.unwrap_or_else(uuid::Uuid::now_v7),
            },
        }
    }
}

/// Options for scheduling an activity
///
/// At least one of `start_to_close_timeout` or `schedule_to_close_timeout`
/// must be set; scheduling without either is a configuration error and
/// nothing is recorded.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Limit for a single attempt, measured from when a worker claims it
    #[serde(default, with = "option_duration_millis")]
    pub start_to_close_timeout: Option<Duration>,

    /// Limit for the whole activity including retries and queueing
    #[serde(default, with = "option_duration_millis")]
    pub schedule_to_close_timeout: Option<Duration>,

    /// Defaults to [`RetryPolicy::default`] when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    /// Defaults to the workflow's task queue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,
}

impl ActivityOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options with only a StartToClose timeout
    pub fn start_to_close(timeout: Duration) -> Self {
        Self::new().with_start_to_close_timeout(timeout)
    }

    /// Options with only a ScheduleToClose timeout
    pub fn schedule_to_close(timeout: Duration) -> Self {
        Self::new().with_schedule_to_close_timeout(timeout)
    }

    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = Some(timeout);
        self
    }

    pub fn with_schedule_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.schedule_to_close_timeout = Some(timeout);
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    /// Policy the coordinator applies to failed attempts
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.clone().unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.start_to_close_timeout.is_none() && self.schedule_to_close_timeout.is_none() {
            return Err(WorkflowError::configuration(
                "activity options must set StartToCloseTimeout or ScheduleToCloseTimeout",
            ));
        }
        for timeout in [self.start_to_close_timeout, self.schedule_to_close_timeout]
            .into_iter()
            .flatten()
        {
            if timeout.is_zero() {
                return Err(WorkflowError::configuration(
                    "activity timeouts must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

/// Options for starting a child workflow
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChildWorkflowOptions {
    /// Business id of the child; derived from the parent id and seq when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_queue: Option<String>,

    /// Closes the child as TimedOut once elapsed
    #[serde(default, with = "option_duration_millis")]
    pub execution_timeout: Option<Duration>,
}

impl ChildWorkflowOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workflow_id(mut self, workflow_id: impl Into<String>) -> Self {
        self.workflow_id = Some(workflow_id.into());
        self
    }

    pub fn with_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.task_queue = Some(task_queue.into());
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
