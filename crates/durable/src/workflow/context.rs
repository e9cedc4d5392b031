//! The API workflow code uses to interact with the engine

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use super::future::{
    ActivityHandle, ChildWorkflowHandle, Selector, SignalChannel, TimerHandle,
};
use super::{ActivityOptions, ChildWorkflowOptions, ParentLink, PendingCommand, Workflow, WorkflowError};
use crate::activity::Activity;
use crate::engine::replay::{ActivationMode, Issued, OperationKind, ReplayState};
use crate::reliability::chrono_duration;

/// Identity of the run being executed
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRunInfo {
    pub namespace: String,
    /// Business id, shared by all runs of a continue-as-new chain
    pub workflow_id: String,
    pub workflow_type: String,
    pub task_queue: String,
    /// Run id
    pub instance_id: Uuid,
    pub parent: Option<ParentLink>,
    pub continued_from: Option<Uuid>,
    pub started_at: DateTime<Utc>,
}

/// Handle to the engine passed to [`Workflow::run`]
///
/// All interaction with the outside world goes through the context so that
/// it can be recorded on first execution and reproduced on replay. The
/// context is cheap to clone and is confined to the activation's thread.
#[derive(Clone)]
pub struct WorkflowContext {
    state: Rc<RefCell<ReplayState>>,
}

impl WorkflowContext {
    pub(crate) fn new(state: Rc<RefCell<ReplayState>>) -> Self {
        Self { state }
    }

    pub fn info(&self) -> WorkflowRunInfo {
        self.state.borrow().info.clone()
    }

    /// Deterministic workflow time: the timestamp of the latest history
    /// event the code has observed
    pub fn now(&self) -> DateTime<Utc> {
        self.state.borrow().now()
    }

    /// True while the code is re-executing already recorded history
    pub fn is_replaying(&self) -> bool {
        self.state.borrow().is_replaying()
    }

    /// Logger that stays silent while replaying
    pub fn logger(&self) -> WorkflowLogger {
        WorkflowLogger {
            state: Rc::clone(&self.state),
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.state.borrow().is_cancel_requested()
    }

    /// True once history is long enough that the run should continue as new
    pub fn is_continue_as_new_suggested(&self) -> bool {
        self.state.borrow().is_continue_as_new_suggested()
    }

    // =========================================================================
    // Activities
    // =========================================================================

    /// Schedule an activity by type name
    ///
    /// Invalid options are rejected before anything is recorded: the
    /// returned handle resolves immediately with a configuration error.
    pub fn execute_activity<I, O>(
        &self,
        activity_type: &str,
        input: &I,
        options: ActivityOptions,
    ) -> ActivityHandle<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        if let Err(err) = options.validate() {
            return ActivityHandle::rejected(Rc::clone(&self.state), err);
        }
        let input = match serde_json::to_value(input) {
            Ok(input) => input,
            Err(err) => return ActivityHandle::rejected(Rc::clone(&self.state), err.into()),
        };

        let mut state = self.state.borrow_mut();
        let seq = state.next_seq();
        let task_queue = options
            .task_queue
            .clone()
            .unwrap_or_else(|| state.info.task_queue.clone());
        state.issue(
            PendingCommand::ScheduleActivity {
                seq,
                activity_type: activity_type.to_string(),
                task_queue,
                input,
                options,
            },
            Some((OperationKind::Activity, activity_type)),
        );
        drop(state);

        ActivityHandle::new(Rc::clone(&self.state), seq)
    }

    /// Schedule a typed [`Activity`]
    pub fn activity<A: Activity>(
        &self,
        input: &A::Input,
        options: ActivityOptions,
    ) -> ActivityHandle<A::Output> {
        self.execute_activity(A::TYPE, input, options)
    }

    // =========================================================================
    // Timers
    // =========================================================================

    /// Start a durable timer firing `duration` after [`now`](Self::now)
    pub fn timer(&self, duration: Duration) -> TimerHandle {
        let mut state = self.state.borrow_mut();
        let seq = state.next_seq();
        let fire_at = state.now() + chrono_duration(duration);
        state.issue(
            PendingCommand::StartTimer {
                seq,
                fire_at,
                duration,
            },
            Some((OperationKind::Timer, "timer")),
        );
        drop(state);

        TimerHandle::new(Rc::clone(&self.state), seq)
    }

    /// Durable sleep; sugar over [`timer`](Self::timer)
    pub fn sleep(&self, duration: Duration) -> TimerHandle {
        self.timer(duration)
    }

    /// Cancel a timer that has not fired yet. Canceling a fired or already
    /// canceled timer records nothing.
    pub fn cancel_timer(&self, timer: &TimerHandle) {
        let mut state = self.state.borrow_mut();
        if state.is_resolved(timer.seq()) {
            return;
        }
        let issued = state.issue(PendingCommand::CancelTimer { seq: timer.seq() }, None);
        if matches!(issued, Issued::Diverged) {
            return;
        }
        state.mark_timer_canceled(timer.seq());
        let wakers = state.take_wakers();
        drop(state);
        wakers.into_iter().for_each(std::task::Waker::wake);
    }

    // =========================================================================
    // Signals
    // =========================================================================

    pub fn signal_channel(&self, name: &str) -> SignalChannel {
        SignalChannel::new(Rc::clone(&self.state), name)
    }

    /// Wait for a payload on `name` for at most `timeout`.
    ///
    /// Returns `None` when the timer wins; when the signal wins the timer
    /// is canceled.
    pub async fn wait_signal_or_timeout<T: DeserializeOwned>(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<Option<T>, WorkflowError> {
        let channel = self.signal_channel(name);
        if let Some(payload) = channel.try_recv()? {
            return Ok(Some(payload));
        }

        let timer = self.timer(timeout);
        let winner = self.selector().add(&channel).add(&timer).select().await?;
        if winner == 0 {
            self.cancel_timer(&timer);
            return channel.try_recv();
        }
        timer.await?;
        Ok(None)
    }

    pub fn selector<'a>(&self) -> Selector<'a> {
        Selector::new(Rc::clone(&self.state))
    }

    // =========================================================================
    // Side Effects
    // =========================================================================

    /// Run `generator` once and record its value; replays return the
    /// recorded value without calling it again.
    ///
    /// Offline replay never calls `generator`: an unrecorded side effect is
    /// reported as the next command and the activation stops there.
    pub fn side_effect<T, F>(&self, generator: F) -> Result<T, WorkflowError>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> T,
    {
        let (seq, replaying, mode) = {
            let mut state = self.state.borrow_mut();
            (state.next_seq(), state.has_recorded_commands(), state.mode)
        };

        if replaying {
            let issued = self.state.borrow_mut().issue(
                PendingCommand::RecordSideEffect {
                    seq,
                    value: serde_json::Value::Null,
                },
                Some((OperationKind::SideEffect, "side_effect")),
            );
            return match issued {
                Issued::Replayed(super::HistoryEvent::SideEffectRecorded { value, .. }) => {
                    Ok(serde_json::from_value(value)?)
                }
                _ => Err(WorkflowError::new(format!(
                    "side effect {seq} does not match recorded history"
                ))),
            };
        }

        match mode {
            ActivationMode::Execute => {}
            ActivationMode::Query => {
                return Err(WorkflowError::new(format!(
                    "side effect {seq} is not recorded and cannot run during a query"
                )));
            }
            ActivationMode::Validate => {
                let mut state = self.state.borrow_mut();
                state.issue(
                    PendingCommand::RecordSideEffect {
                        seq,
                        value: serde_json::Value::Null,
                    },
                    Some((OperationKind::SideEffect, "side_effect")),
                );
                state.halt();
                return Err(WorkflowError::new(format!(
                    "side effect {seq} is not recorded and is not run during offline replay"
                )));
            }
        }

        let value = generator();
        let recorded = serde_json::to_value(&value)?;
        self.state.borrow_mut().issue(
            PendingCommand::RecordSideEffect {
                seq,
                value: recorded,
            },
            Some((OperationKind::SideEffect, "side_effect")),
        );
        Ok(value)
    }

    // =========================================================================
    // Child Workflows
    // =========================================================================

    pub fn start_child_workflow<W: Workflow>(
        &self,
        input: &W::Input,
        options: ChildWorkflowOptions,
    ) -> ChildWorkflowHandle<W::Output> {
        self.start_child_workflow_by_type(W::TYPE, input, options)
    }

    /// Start a child workflow by type name. Its workflow id defaults to
    /// `{parent workflow id}-child-{seq}`.
    pub fn start_child_workflow_by_type<I, O>(
        &self,
        workflow_type: &str,
        input: &I,
        options: ChildWorkflowOptions,
    ) -> ChildWorkflowHandle<O>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = match serde_json::to_value(input) {
            Ok(input) => input,
            Err(err) => return ChildWorkflowHandle::rejected(Rc::clone(&self.state), err.into()),
        };

        let mut state = self.state.borrow_mut();
        let seq = state.next_seq();
        let workflow_id = options
            .workflow_id
            .clone()
            .unwrap_or_else(|| format!("{}-child-{seq}", state.info.workflow_id));
        state.issue(
            PendingCommand::StartChildWorkflow {
                seq,
                workflow_type: workflow_type.to_string(),
                workflow_id,
                input,
                options,
            },
            Some((OperationKind::ChildWorkflow, workflow_type)),
        );
        drop(state);

        ChildWorkflowHandle::new(Rc::clone(&self.state), seq)
    }

    // =========================================================================
    // Queries and Continue-As-New
    // =========================================================================

    /// Answer `name` queries with `handler`, a read-only view of workflow
    /// state. Registering the same name again replaces the handler.
    pub fn set_query_handler<R, F>(&self, name: &str, handler: F)
    where
        R: Serialize,
        F: Fn() -> R + 'static,
    {
        self.state.borrow_mut().query_handlers.insert(
            name.to_string(),
            Box::new(move || Ok(serde_json::to_value(handler())?)),
        );
    }

    /// Error that, returned from `run`, closes this run and starts a new one
    /// with `input`
    pub fn continue_as_new<I: Serialize + ?Sized>(&self, input: &I) -> WorkflowError {
        match serde_json::to_value(input) {
            Ok(input) => WorkflowError::continue_as_new(input),
            Err(err) => err.into(),
        }
    }
}

impl fmt::Debug for WorkflowContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("WorkflowContext")
            .field("instance_id", &state.info.instance_id)
            .field("workflow_type", &state.info.workflow_type)
            .field("replaying", &state.is_replaying())
            .finish()
    }
}

/// Replay-aware logger
///
/// Emits `tracing` events tagged with the run's identity, and drops them
/// while history is being replayed so each line appears once per real
/// progression of the workflow.
pub struct WorkflowLogger {
    state: Rc<RefCell<ReplayState>>,
}

impl WorkflowLogger {
    fn enabled(&self) -> Option<(Uuid, String)> {
        let state = self.state.borrow();
        (!state.is_replaying() && state.mode == ActivationMode::Execute)
            .then(|| (state.info.instance_id, state.info.workflow_type.clone()))
    }

    pub fn debug(&self, message: impl fmt::Display) {
        if let Some((instance_id, workflow_type)) = self.enabled() {
            tracing::debug!(%instance_id, %workflow_type, "{}", message);
        }
    }

    pub fn info(&self, message: impl fmt::Display) {
        if let Some((instance_id, workflow_type)) = self.enabled() {
            tracing::info!(%instance_id, %workflow_type, "{}", message);
        }
    }

    pub fn warn(&self, message: impl fmt::Display) {
        if let Some((instance_id, workflow_type)) = self.enabled() {
            tracing::warn!(%instance_id, %workflow_type, "{}", message);
        }
    }

    pub fn error(&self, message: impl fmt::Display) {
        if let Some((instance_id, workflow_type)) = self.enabled() {
            tracing::error!(%instance_id, %workflow_type, "{}", message);
        }
    }
}
