//! Activity result handling
//!
//! Workers report each attempt's outcome here. The coordinator applies the
//! activity's retry policy and only records terminal results in history:
//! intermediate failures become delayed re-enqueues, never events.

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::persistence::{ClaimedTask, TaskStatus, WorkflowEventStore};
use crate::reliability::{chrono_duration, RetryDecision, TimeoutType};
use crate::workflow::HistoryEvent;

use super::executor::{next_sequence_of, ExecutorError, WorkflowExecutor};

/// Result of one activity attempt
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityOutcome {
    Completed(serde_json::Value),
    Failed(ActivityError),
    TimedOut(TimeoutType),
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Report the outcome of a claimed attempt.
    ///
    /// Results for tasks that were canceled or timed out in the meantime
    /// are dropped.
    #[instrument(skip(self, task, outcome), fields(task_id = %task.id, instance_id = %task.instance_id, seq = task.seq, attempt = task.attempt))]
    pub async fn report_activity_outcome(
        &self,
        task: &ClaimedTask,
        outcome: ActivityOutcome,
    ) -> Result<(), ExecutorError> {
        match outcome {
            ActivityOutcome::Completed(result) => {
                if !self.store.finish_task(task.id, TaskStatus::Completed).await? {
                    warn!("activity result arrived for an inactive task; dropping");
                    return Ok(());
                }
                debug!(activity_type = %task.activity_type, "activity completed");
                self.resolve_activity(
                    task.instance_id,
                    HistoryEvent::ActivityCompleted {
                        seq: task.seq,
                        result,
                        attempt: task.attempt,
                    },
                )
                .await
            }
            ActivityOutcome::Failed(error) => {
                let now = self.clock.now();
                let policy = task.options.effective_retry_policy();
                let decision = policy.decide(
                    task.attempt,
                    error.retryable,
                    error.error_type.as_deref(),
                    task.deadlines().retry_budget(now),
                );

                match decision {
                    RetryDecision::Retry {
                        next_attempt,
                        delay,
                    } => {
                        warn!(
                            activity_type = %task.activity_type,
                            error = %error,
                            next_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "activity attempt failed; retrying"
                        );
                        self.store
                            .retry_task(task.id, now + chrono_duration(delay), &error.to_string())
                            .await?;
                        Ok(())
                    }
                    RetryDecision::GiveUp => {
                        if !self.store.finish_task(task.id, TaskStatus::Failed).await? {
                            warn!("activity failure arrived for an inactive task; dropping");
                            return Ok(());
                        }
                        warn!(activity_type = %task.activity_type, error = %error, "activity failed");
                        self.resolve_activity(
                            task.instance_id,
                            HistoryEvent::ActivityFailed {
                                seq: task.seq,
                                error,
                                attempt: task.attempt,
                            },
                        )
                        .await
                    }
                }
            }
            ActivityOutcome::TimedOut(timeout_type) => {
                if !self.store.finish_task(task.id, TaskStatus::TimedOut).await? {
                    return Ok(());
                }
                warn!(activity_type = %task.activity_type, %timeout_type, "activity timed out");
                self.resolve_activity(
                    task.instance_id,
                    HistoryEvent::ActivityTimedOut {
                        seq: task.seq,
                        timeout_type,
                        attempt: task.attempt,
                    },
                )
                .await
            }
        }
    }

    /// Time out tasks whose deadlines passed without a worker reporting.
    ///
    /// Covers workers that crashed or hung mid-attempt. Returns the number
    /// of activities resolved as timed out.
    #[instrument(skip(self))]
    pub async fn sweep_activity_timeouts(&self) -> Result<usize, ExecutorError> {
        let now = self.clock.now();
        let expired = self.store.expired_tasks(now).await?;
        let mut resolved = 0;

        for task in expired {
            if !self.store.finish_task(task.id, TaskStatus::TimedOut).await? {
                continue;
            }
            info!(
                instance_id = %task.instance_id,
                seq = task.seq,
                timeout_type = %task.timeout_type,
                "activity deadline passed without a result"
            );
            self.resolve_activity(
                task.instance_id,
                HistoryEvent::ActivityTimedOut {
                    seq: task.seq,
                    timeout_type: task.timeout_type,
                    attempt: task.attempt,
                },
            )
            .await?;
            resolved += 1;
        }

        Ok(resolved)
    }

    /// Append a terminal activity event and wake the workflow
    async fn resolve_activity(
        &self,
        instance_id: Uuid,
        event: HistoryEvent,
    ) -> Result<(), ExecutorError> {
        if !self.append_resolution(instance_id, event).await? {
            return Ok(());
        }
        self.process_workflow(instance_id).await?;
        Ok(())
    }

    /// Append an event that settles an operation, unless the run is closed
    /// or the operation is already settled. Returns whether it was appended.
    pub(crate) async fn append_resolution(
        &self,
        instance_id: Uuid,
        event: HistoryEvent,
    ) -> Result<bool, ExecutorError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let status = self.store.get_workflow_status(instance_id).await?;
        if status.is_terminal() {
            debug!(%instance_id, event = event.name(), "workflow closed; ignoring resolution");
            return Ok(false);
        }

        let history = self.store.load_events(instance_id).await?;
        if let Some(seq) = event.resolved_seq() {
            if history
                .iter()
                .any(|record| record.event.resolved_seq() == Some(seq))
            {
                warn!(%instance_id, seq, event = event.name(), "operation already resolved; ignoring");
                return Ok(false);
            }
        }

        self.store
            .append_events(
                instance_id,
                next_sequence_of(&history),
                self.clock.now(),
                vec![event],
            )
            .await?;
        Ok(true)
    }
}
