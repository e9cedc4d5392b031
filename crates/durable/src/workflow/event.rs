//! History events for persistence and replay

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{ActivityOptions, WorkflowError};
use crate::activity::ActivityError;
use crate::persistence::WorkflowStatus;
use crate::reliability::TimeoutType;

/// Link from a child run back to the parent operation awaiting it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance_id: Uuid,
    /// Correlation id of the `ChildWorkflowStarted` command in the parent
    pub seq: u32,
}

/// Events stored in a workflow instance's history
///
/// History is append-only: events are never mutated or removed, and the
/// in-memory state of a workflow is reconstructed by re-executing its code
/// against them in sequence order.
///
/// Command events (`ActivityScheduled`, `TimerStarted`, `TimerCanceled`,
/// `SideEffectRecorded`, `ChildWorkflowStarted`) record decisions taken by
/// workflow code and are matched one-for-one during replay. Resolution events
/// (completions, fires, signals, cancel requests) wake suspension points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEvent {
    // =========================================================================
    // Workflow Lifecycle Events
    // =========================================================================
    /// First event of every run
    WorkflowStarted {
        workflow_type: String,
        workflow_id: String,
        task_queue: String,
        input: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentLink>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        continued_from: Option<Uuid>,
        /// Cron expression the run recurs on
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cron_schedule: Option<String>,
        /// The code first runs at this time instead of at the event's own
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheduled_start: Option<DateTime<Utc>>,
    },

    /// Cancellation requested from outside; pending awaits wake with a
    /// cancellation error
    WorkflowCancelRequested { reason: String },

    WorkflowCompleted { result: serde_json::Value },

    WorkflowFailed { error: WorkflowError },

    WorkflowCanceled { reason: String },

    /// The run's execution timeout elapsed before it closed
    WorkflowTimedOut,

    /// Closed in favour of a new run with a fresh history
    WorkflowContinuedAsNew {
        input: serde_json::Value,
        new_instance_id: Uuid,
    },

    /// Follows the close event of a cron run: the next run of the schedule
    /// was created and starts at `start_at`
    WorkflowCronScheduled {
        next_instance_id: Uuid,
        start_at: DateTime<Utc>,
    },

    // =========================================================================
    // Activity Events
    // =========================================================================
    ActivityScheduled {
        seq: u32,
        activity_type: String,
        task_queue: String,
        input: serde_json::Value,
        options: ActivityOptions,
    },

    ActivityCompleted {
        seq: u32,
        result: serde_json::Value,
        attempt: u32,
    },

    /// Terminal failure; intermediate retry attempts are never recorded
    ActivityFailed {
        seq: u32,
        error: ActivityError,
        attempt: u32,
    },

    ActivityTimedOut {
        seq: u32,
        timeout_type: TimeoutType,
        attempt: u32,
    },

    // =========================================================================
    // Timer Events
    // =========================================================================
    TimerStarted {
        seq: u32,
        fire_at: DateTime<Utc>,
        duration_ms: u64,
    },

    TimerFired { seq: u32 },

    TimerCanceled { seq: u32 },

    // =========================================================================
    // Signal and Side-Effect Events
    // =========================================================================
    SignalReceived {
        signal_name: String,
        payload: serde_json::Value,
    },

    SideEffectRecorded {
        seq: u32,
        value: serde_json::Value,
    },

    // =========================================================================
    // Child Workflow Events
    // =========================================================================
    ChildWorkflowStarted {
        seq: u32,
        workflow_type: String,
        workflow_id: String,
        instance_id: Uuid,
        input: serde_json::Value,
    },

    ChildWorkflowCompleted {
        seq: u32,
        result: serde_json::Value,
    },

    ChildWorkflowFailed { seq: u32, error: WorkflowError },
}

impl HistoryEvent {
    /// Event type name as stored in the `event_type` column
    pub fn name(&self) -> &'static str {
        match self {
            HistoryEvent::WorkflowStarted { .. } => "workflow_started",
            HistoryEvent::WorkflowCancelRequested { .. } => "workflow_cancel_requested",
            HistoryEvent::WorkflowCompleted { .. } => "workflow_completed",
            HistoryEvent::WorkflowFailed { .. } => "workflow_failed",
            HistoryEvent::WorkflowCanceled { .. } => "workflow_canceled",
            HistoryEvent::WorkflowTimedOut => "workflow_timed_out",
            HistoryEvent::WorkflowContinuedAsNew { .. } => "workflow_continued_as_new",
            HistoryEvent::WorkflowCronScheduled { .. } => "workflow_cron_scheduled",
            HistoryEvent::ActivityScheduled { .. } => "activity_scheduled",
            HistoryEvent::ActivityCompleted { .. } => "activity_completed",
            HistoryEvent::ActivityFailed { .. } => "activity_failed",
            HistoryEvent::ActivityTimedOut { .. } => "activity_timed_out",
            HistoryEvent::TimerStarted { .. } => "timer_started",
            HistoryEvent::TimerFired { .. } => "timer_fired",
            HistoryEvent::TimerCanceled { .. } => "timer_canceled",
            HistoryEvent::SignalReceived { .. } => "signal_received",
            HistoryEvent::SideEffectRecorded { .. } => "side_effect_recorded",
            HistoryEvent::ChildWorkflowStarted { .. } => "child_workflow_started",
            HistoryEvent::ChildWorkflowCompleted { .. } => "child_workflow_completed",
            HistoryEvent::ChildWorkflowFailed { .. } => "child_workflow_failed",
        }
    }

    /// True for events that record a decision taken by workflow code
    pub fn is_command(&self) -> bool {
        matches!(
            self,
            HistoryEvent::ActivityScheduled { .. }
                | HistoryEvent::TimerStarted { .. }
                | HistoryEvent::TimerCanceled { .. }
                | HistoryEvent::SideEffectRecorded { .. }
                | HistoryEvent::ChildWorkflowStarted { .. }
        )
    }

    /// True for events that can wake a suspension point
    pub fn is_resolution(&self) -> bool {
        matches!(
            self,
            HistoryEvent::ActivityCompleted { .. }
                | HistoryEvent::ActivityFailed { .. }
                | HistoryEvent::ActivityTimedOut { .. }
                | HistoryEvent::TimerFired { .. }
                | HistoryEvent::SignalReceived { .. }
                | HistoryEvent::ChildWorkflowCompleted { .. }
                | HistoryEvent::ChildWorkflowFailed { .. }
                | HistoryEvent::WorkflowCancelRequested { .. }
        )
    }

    /// Correlation id of the operation this event completes, if any
    pub fn resolved_seq(&self) -> Option<u32> {
        match self {
            HistoryEvent::ActivityCompleted { seq, .. }
            | HistoryEvent::ActivityFailed { seq, .. }
            | HistoryEvent::ActivityTimedOut { seq, .. }
            | HistoryEvent::TimerFired { seq }
            | HistoryEvent::TimerCanceled { seq }
            | HistoryEvent::ChildWorkflowCompleted { seq, .. }
            | HistoryEvent::ChildWorkflowFailed { seq, .. } => Some(*seq),
            _ => None,
        }
    }

    /// Status a run ends in when this event is appended
    pub fn terminal_status(&self) -> Option<WorkflowStatus> {
        match self {
            HistoryEvent::WorkflowCompleted { .. } => Some(WorkflowStatus::Completed),
            HistoryEvent::WorkflowFailed { .. } => Some(WorkflowStatus::Failed),
            HistoryEvent::WorkflowCanceled { .. } => Some(WorkflowStatus::Canceled),
            HistoryEvent::WorkflowTimedOut => Some(WorkflowStatus::TimedOut),
            HistoryEvent::WorkflowContinuedAsNew { .. } => Some(WorkflowStatus::ContinuedAsNew),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal_status().is_some()
    }

    /// Run that carries on this one's workflow id, if this event links one
    pub fn successor(&self) -> Option<Uuid> {
        match self {
            HistoryEvent::WorkflowContinuedAsNew {
                new_instance_id, ..
            } => Some(*new_instance_id),
            HistoryEvent::WorkflowCronScheduled {
                next_instance_id, ..
            } => Some(*next_instance_id),
            _ => None,
        }
    }
}

/// A history event together with its position and timestamp
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    /// Monotonically increasing position within the instance, starting at 0
    pub sequence: i64,
    pub recorded_at: DateTime<Utc>,
    pub event: HistoryEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_tagging() {
        let event = HistoryEvent::TimerFired { seq: 3 };
        let json = serde_json::to_value(&event).expect("should serialize");
        assert_eq!(json, json!({"type": "timer_fired", "seq": 3}));
    }

    #[test]
    fn test_workflow_started_omits_empty_links() {
        let event = HistoryEvent::WorkflowStarted {
            workflow_type: "background_check".into(),
            workflow_id: "bg-1".into(),
            task_queue: "default".into(),
            input: json!("555-55-5555"),
            parent: None,
            continued_from: None,
            cron_schedule: None,
            scheduled_start: None,
        };
        let json = serde_json::to_value(&event).expect("should serialize");
        assert!(json.get("parent").is_none());
        assert!(json.get("cron_schedule").is_none());

        let parsed: HistoryEvent = serde_json::from_value(json).expect("should deserialize");
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_name_matches_serde_tag() {
        let events = vec![
            HistoryEvent::SignalReceived {
                signal_name: "submission".into(),
                payload: json!({}),
            },
            HistoryEvent::WorkflowTimedOut,
            HistoryEvent::SideEffectRecorded {
                seq: 1,
                value: json!(4),
            },
            HistoryEvent::WorkflowCronScheduled {
                next_instance_id: Uuid::nil(),
                start_at: DateTime::UNIX_EPOCH,
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).expect("should serialize");
            assert_eq!(json["type"], event.name());
        }
    }

    #[test]
    fn test_successor_links() {
        let next = Uuid::now_v7();
        let cron = HistoryEvent::WorkflowCronScheduled {
            next_instance_id: next,
            start_at: DateTime::UNIX_EPOCH,
        };
        assert_eq!(cron.successor(), Some(next));
        assert!(!cron.is_command() && !cron.is_resolution() && !cron.is_terminal());

        let continued = HistoryEvent::WorkflowContinuedAsNew {
            input: json!(1),
            new_instance_id: next,
        };
        assert_eq!(continued.successor(), Some(next));
        assert_eq!(HistoryEvent::WorkflowTimedOut.successor(), None);
    }

    #[test]
    fn test_classification() {
        let scheduled = HistoryEvent::ActivityScheduled {
            seq: 1,
            activity_type: "ssn_trace".into(),
            task_queue: "default".into(),
            input: json!("555-55-5555"),
            options: ActivityOptions::default(),
        };
        assert!(scheduled.is_command());
        assert!(!scheduled.is_resolution());

        let completed = HistoryEvent::ActivityCompleted {
            seq: 1,
            result: json!("pass"),
            attempt: 1,
        };
        assert!(completed.is_resolution());
        assert_eq!(completed.resolved_seq(), Some(1));

        assert_eq!(
            HistoryEvent::WorkflowCanceled { reason: "x".into() }.terminal_status(),
            Some(WorkflowStatus::Canceled)
        );
        assert!(!completed.is_terminal());
    }
}
