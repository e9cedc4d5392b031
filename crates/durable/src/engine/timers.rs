//! Durable timer firing and workflow execution timeouts
//!
//! Timers live in the store with their deadlines. A sweep fires the due
//! ones in `(fire_at, started_sequence)` order, so timers sharing a
//! deadline fire in the order they were started.

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{WorkflowEventStore, WorkflowStatus};
use crate::workflow::{HistoryEvent, WorkflowError, WorkflowErrorKind};

use super::executor::{
    next_sequence_of, ExecutorError, FollowUp, WorkflowExecutor, START_TIMER_SEQ,
};

/// Timers fired per store round trip
const TIMER_BATCH_SIZE: usize = 256;

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    /// Fire every timer due at the clock's current time and close runs
    /// whose execution timeout elapsed. Returns the number of timers fired.
    #[instrument(skip(self))]
    pub async fn fire_due_timers(&self) -> Result<usize, ExecutorError> {
        let now = self.clock.now();
        let mut fired = 0;
        let mut follow_ups = Vec::new();

        loop {
            let due = self.store.due_timers(now, TIMER_BATCH_SIZE).await?;
            let batch = due.len();

            for timer in due {
                let lock = self.instance_lock(timer.instance_id);
                let _guard = lock.lock().await;

                // Removal claims the timer; a false return means it was
                // canceled or fired concurrently
                if !self.store.remove_timer(timer.instance_id, timer.seq).await? {
                    continue;
                }
                let status = self.store.get_workflow_status(timer.instance_id).await?;
                if status.is_terminal() {
                    continue;
                }
                if timer.seq == START_TIMER_SEQ {
                    info!(instance_id = %timer.instance_id, "scheduled run due to start");
                    fired += 1;
                    follow_ups.push(FollowUp::Process(timer.instance_id));
                    continue;
                }

                let history = self.store.load_events(timer.instance_id).await?;
                self.store
                    .append_events(
                        timer.instance_id,
                        next_sequence_of(&history),
                        now,
                        vec![HistoryEvent::TimerFired { seq: timer.seq }],
                    )
                    .await?;
                info!(instance_id = %timer.instance_id, seq = timer.seq, "timer fired");

                fired += 1;
                follow_ups.push(FollowUp::Process(timer.instance_id));
            }

            if batch < TIMER_BATCH_SIZE {
                break;
            }
        }

        for instance_id in self.store.expired_workflows(now).await? {
            follow_ups.extend(self.time_out_workflow(instance_id).await?);
        }

        self.drain(follow_ups).await;
        Ok(fired)
    }

    /// Close a run whose execution timeout elapsed
    async fn time_out_workflow(&self, instance_id: Uuid) -> Result<Vec<FollowUp>, ExecutorError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let info = self.store.get_workflow_info(instance_id).await?;
        if info.status.is_terminal() {
            return Ok(vec![]);
        }

        let now = self.clock.now();
        let history = self.store.load_events(instance_id).await?;
        self.store
            .append_events(
                instance_id,
                next_sequence_of(&history),
                now,
                vec![HistoryEvent::WorkflowTimedOut],
            )
            .await?;

        let error = WorkflowError::with_kind(
            WorkflowErrorKind::Timeout,
            "workflow execution timed out",
        );
        self.store
            .update_workflow_status(
                instance_id,
                WorkflowStatus::TimedOut,
                None,
                Some(serde_json::to_value(&error)?),
                now,
            )
            .await?;
        self.store.cancel_workflow_tasks(instance_id).await?;
        self.store.cancel_workflow_timers(instance_id).await?;
        warn!(%instance_id, workflow_type = %info.workflow_type, "workflow execution timed out");

        Ok(info
            .parent
            .map(|parent| FollowUp::NotifyParent {
                parent,
                event: HistoryEvent::ChildWorkflowFailed {
                    seq: parent.seq,
                    error,
                },
            })
            .into_iter()
            .collect())
    }
}
