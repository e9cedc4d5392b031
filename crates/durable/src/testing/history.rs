//! Hand-built histories for replay tests

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::reliability::{chrono_duration, TimeoutType};
use crate::workflow::{ActivityOptions, EventRecord, HistoryEvent, WorkflowError};

/// Builder for a run's event history
///
/// Sequences are assigned in call order starting at 0. Every event is
/// stamped one second after the previous one unless [`at`](Self::at)
/// moves the clock; timer deadlines are computed from the current stamp.
///
/// ```
/// use durable_replay::testing::HistoryBuilder;
/// use serde_json::json;
///
/// let history = HistoryBuilder::new("greet", json!("ada"))
///     .timer_started(1, std::time::Duration::from_secs(60))
///     .timer_fired(1)
///     .build();
/// assert_eq!(history.len(), 3);
/// assert_eq!(history[2].event.name(), "timer_fired");
/// ```
#[derive(Debug, Clone)]
pub struct HistoryBuilder {
    records: Vec<EventRecord>,
    task_queue: String,
    now: DateTime<Utc>,
}

impl HistoryBuilder {
    /// Start a history with `WorkflowStarted` at the Unix epoch
    pub fn new(workflow_type: &str, input: Value) -> Self {
        Self::with_workflow_id(workflow_type, &Uuid::nil().to_string(), input)
    }

    pub fn with_workflow_id(workflow_type: &str, workflow_id: &str, input: Value) -> Self {
        let mut builder = Self {
            records: Vec::new(),
            task_queue: "default".to_string(),
            now: DateTime::UNIX_EPOCH,
        };
        builder.records.push(EventRecord {
            sequence: 0,
            recorded_at: builder.now,
            event: HistoryEvent::WorkflowStarted {
                workflow_type: workflow_type.to_string(),
                workflow_id: workflow_id.to_string(),
                task_queue: builder.task_queue.clone(),
                input,
                parent: None,
                continued_from: None,
                cron_schedule: None,
                scheduled_start: None,
            },
        });
        builder
    }

    /// Stamp the following events at `at`
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.now = at;
        self
    }

    /// Append an arbitrary event
    pub fn event(mut self, event: HistoryEvent) -> Self {
        self.now += chrono::Duration::seconds(1);
        self.records.push(EventRecord {
            sequence: self.records.len() as i64,
            recorded_at: self.now,
            event,
        });
        self
    }

    pub fn activity_scheduled(
        self,
        seq: u32,
        activity_type: &str,
        input: Value,
        options: ActivityOptions,
    ) -> Self {
        let task_queue = options
            .task_queue
            .clone()
            .unwrap_or_else(|| self.task_queue.clone());
        self.event(HistoryEvent::ActivityScheduled {
            seq,
            activity_type: activity_type.to_string(),
            task_queue,
            input,
            options,
        })
    }

    pub fn activity_completed(self, seq: u32, result: Value) -> Self {
        self.event(HistoryEvent::ActivityCompleted {
            seq,
            result,
            attempt: 1,
        })
    }

    pub fn activity_failed(self, seq: u32, error: ActivityError, attempt: u32) -> Self {
        self.event(HistoryEvent::ActivityFailed {
            seq,
            error,
            attempt,
        })
    }

    pub fn activity_timed_out(self, seq: u32, timeout_type: TimeoutType) -> Self {
        self.event(HistoryEvent::ActivityTimedOut {
            seq,
            timeout_type,
            attempt: 1,
        })
    }

    /// Timer deadline is `duration` after the previous event's stamp plus
    /// one second, the stamp of this event
    pub fn timer_started(self, seq: u32, duration: Duration) -> Self {
        let fire_at = self.now + chrono::Duration::seconds(1) + chrono_duration(duration);
        self.event(HistoryEvent::TimerStarted {
            seq,
            fire_at,
            duration_ms: duration.as_millis() as u64,
        })
    }

    pub fn timer_fired(self, seq: u32) -> Self {
        self.event(HistoryEvent::TimerFired { seq })
    }

    pub fn timer_canceled(self, seq: u32) -> Self {
        self.event(HistoryEvent::TimerCanceled { seq })
    }

    pub fn signal_received(self, signal_name: &str, payload: Value) -> Self {
        self.event(HistoryEvent::SignalReceived {
            signal_name: signal_name.to_string(),
            payload,
        })
    }

    pub fn side_effect(self, seq: u32, value: Value) -> Self {
        self.event(HistoryEvent::SideEffectRecorded { seq, value })
    }

    pub fn child_started(
        self,
        seq: u32,
        workflow_type: &str,
        workflow_id: &str,
        input: Value,
    ) -> Self {
        self.event(HistoryEvent::ChildWorkflowStarted {
            seq,
            workflow_type: workflow_type.to_string(),
            workflow_id: workflow_id.to_string(),
            instance_id: Uuid::nil(),
            input,
        })
    }

    pub fn child_completed(self, seq: u32, result: Value) -> Self {
        self.event(HistoryEvent::ChildWorkflowCompleted { seq, result })
    }

    pub fn child_failed(self, seq: u32, error: WorkflowError) -> Self {
        self.event(HistoryEvent::ChildWorkflowFailed { seq, error })
    }

    pub fn cancel_requested(self, reason: &str) -> Self {
        self.event(HistoryEvent::WorkflowCancelRequested {
            reason: reason.to_string(),
        })
    }

    pub fn workflow_completed(self, result: Value) -> Self {
        self.event(HistoryEvent::WorkflowCompleted { result })
    }

    pub fn workflow_failed(self, error: WorkflowError) -> Self {
        self.event(HistoryEvent::WorkflowFailed { error })
    }

    pub fn workflow_canceled(self, reason: &str) -> Self {
        self.event(HistoryEvent::WorkflowCanceled {
            reason: reason.to_string(),
        })
    }

    pub fn build(self) -> Vec<EventRecord> {
        self.records
    }
}
