//! Deterministic replay activation
//!
//! An activation rebuilds a workflow's in-memory state by running its code
//! from the top against the instance history. Command events recorded in
//! history are matched one-for-one, in order, against the commands the code
//! issues; resolution events are made visible one at a time in history
//! order, and the workflow future is polled after each of them. Once history
//! is exhausted the code proceeds live and new commands are collected for
//! the executor to commit.
//!
//! The workflow future is polled on the calling thread with a no-op waker:
//! every suspension point is satisfied by state visible in [`ReplayState`],
//! never by a wakeup from elsewhere, so a poll that returns `Pending` means
//! the code is blocked on something history does not contain yet.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use chrono::{DateTime, Utc};
use futures::task::noop_waker_ref;
use serde_json::Value;
use tracing::{debug, trace};
use uuid::Uuid;

use super::registry::WorkflowDescriptor;
use crate::workflow::{
    EventRecord, HistoryEvent, PendingCommand, WorkflowContext, WorkflowError, WorkflowErrorKind,
    WorkflowOutcome, WorkflowRunInfo,
};

pub(crate) type QueryHandler = Box<dyn Fn() -> Result<Value, WorkflowError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActivationMode {
    /// Live commands are collected for commit
    Execute,
    /// Read-only: live commands are dropped and side effects refuse to run
    Query,
    /// Offline check: live commands are collected, but the activation halts
    /// at the first unrecorded side effect instead of running it
    Validate,
}

/// Kind of durable operation a seq was issued for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OperationKind {
    Activity,
    Timer,
    SideEffect,
    ChildWorkflow,
}

impl OperationKind {
    fn resolved_by(self, event: &HistoryEvent) -> bool {
        matches!(
            (self, event),
            (
                OperationKind::Activity,
                HistoryEvent::ActivityCompleted { .. }
                    | HistoryEvent::ActivityFailed { .. }
                    | HistoryEvent::ActivityTimedOut { .. }
            ) | (OperationKind::Timer, HistoryEvent::TimerFired { .. })
                | (
                    OperationKind::ChildWorkflow,
                    HistoryEvent::ChildWorkflowCompleted { .. }
                        | HistoryEvent::ChildWorkflowFailed { .. }
                )
        )
    }
}

#[derive(Debug, Clone)]
struct Operation {
    kind: OperationKind,
    /// Activity or child workflow type
    name: String,
    /// Sequence of the last visible event when the command was issued
    issued_at: i64,
}

#[derive(Debug, Clone)]
struct Resolution {
    sequence: i64,
    outcome: Result<Value, WorkflowError>,
}

/// What happened to a command handed to [`ReplayState::issue`]
#[derive(Debug)]
pub(crate) enum Issued {
    /// Matched the next recorded command event
    Replayed(HistoryEvent),
    /// New command, collected for commit
    Live,
    /// New command reached during a query; it will never resolve
    Unavailable,
    /// Did not match history; the activation is aborted
    Diverged,
}

/// Mutable state shared between the driver and [`WorkflowContext`]
pub(crate) struct ReplayState {
    pub(crate) info: WorkflowRunInfo,
    pub(crate) mode: ActivationMode,
    now: DateTime<Utc>,
    /// Sequence of the most recently visible event
    visible: i64,
    last_seq: u32,
    recorded: VecDeque<HistoryEvent>,
    pending_resolutions: usize,
    commands: Vec<PendingCommand>,
    operations: HashMap<u32, Operation>,
    resolutions: HashMap<u32, Resolution>,
    /// Timer seq to the visible sequence at cancellation
    canceled_timers: HashMap<u32, i64>,
    signals: HashMap<String, VecDeque<(i64, Value)>>,
    cancel: Option<(i64, String)>,
    pub(crate) query_handlers: HashMap<String, QueryHandler>,
    nondeterminism: Option<String>,
    continue_as_new_after: usize,
    /// Wakers of suspension points parked since the last state change
    wakers: Vec<Waker>,
    /// Set once a validating activation reached an unrecorded side effect
    halted: bool,
}

impl ReplayState {
    fn new(
        info: WorkflowRunInfo,
        mode: ActivationMode,
        started: &EventRecord,
        continue_as_new_after: usize,
    ) -> Self {
        Self {
            now: info.started_at,
            info,
            mode,
            visible: started.sequence,
            last_seq: 0,
            recorded: VecDeque::new(),
            pending_resolutions: 0,
            commands: Vec::new(),
            operations: HashMap::new(),
            resolutions: HashMap::new(),
            canceled_timers: HashMap::new(),
            signals: HashMap::new(),
            cancel: None,
            query_handlers: HashMap::new(),
            nondeterminism: None,
            continue_as_new_after,
            wakers: Vec::new(),
            halted: false,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub(crate) fn visible(&self) -> i64 {
        self.visible
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.pending_resolutions > 0 || !self.recorded.is_empty()
    }

    pub(crate) fn has_recorded_commands(&self) -> bool {
        !self.recorded.is_empty()
    }

    pub(crate) fn is_continue_as_new_suggested(&self) -> bool {
        (self.visible + 1) as usize >= self.continue_as_new_after
    }

    pub(crate) fn next_seq(&mut self) -> u32 {
        self.last_seq += 1;
        self.last_seq
    }

    /// Match `command` against history or collect it as a new command.
    ///
    /// `operation` is `Some((kind, name))` for commands that open a durable
    /// operation under their seq.
    pub(crate) fn issue(
        &mut self,
        command: PendingCommand,
        operation: Option<(OperationKind, &str)>,
    ) -> Issued {
        if self.nondeterminism.is_some() {
            return Issued::Diverged;
        }

        let issued = match self.recorded.front() {
            Some(recorded) if command.matches(recorded) => {
                trace!(seq = command.seq(), command = command.kind(), "matched recorded command");
                self.recorded
                    .pop_front()
                    .map_or(Issued::Diverged, Issued::Replayed)
            }
            Some(recorded) => {
                let message = format!(
                    "workflow issued {} for seq {} but history recorded {} next",
                    command.kind(),
                    command.seq(),
                    describe(recorded),
                );
                self.fail(message);
                return Issued::Diverged;
            }
            None => match self.mode {
                ActivationMode::Execute => {
                    self.commands.push(command.clone());
                    Issued::Live
                }
                ActivationMode::Validate if !self.halted => {
                    self.commands.push(command.clone());
                    Issued::Live
                }
                ActivationMode::Validate | ActivationMode::Query => Issued::Unavailable,
            },
        };

        if let Some((kind, name)) = operation {
            self.operations.insert(
                command.seq(),
                Operation {
                    kind,
                    name: name.to_string(),
                    issued_at: self.visible,
                },
            );
        }
        issued
    }

    /// Stop collecting commands; the activation reports no outcome
    pub(crate) fn halt(&mut self) {
        self.halted = true;
    }

    /// Remember `waker` so the suspension point is polled again after the
    /// next state change
    pub(crate) fn park(&mut self, waker: &Waker) {
        if !self.wakers.iter().any(|parked| parked.will_wake(waker)) {
            self.wakers.push(waker.clone());
        }
    }

    /// Wakers to notify; call `wake` only after releasing the borrow
    pub(crate) fn take_wakers(&mut self) -> Vec<Waker> {
        std::mem::take(&mut self.wakers)
    }

    pub(crate) fn fail(&mut self, message: String) {
        if self.nondeterminism.is_none() {
            self.nondeterminism = Some(message);
        }
    }

    /// Outcome of the operation under `seq`, and the history sequence that
    /// produced it, if it is resolved as of the visible history
    pub(crate) fn outcome(&self, seq: u32) -> Option<(i64, Result<Value, WorkflowError>)> {
        let operation = self.operations.get(&seq)?;

        if let Some(&canceled_at) = self.canceled_timers.get(&seq) {
            return Some((canceled_at, Err(WorkflowError::canceled("timer canceled"))));
        }

        let resolution = self.resolutions.get(&seq);
        let cancel = self
            .cancel
            .as_ref()
            .filter(|(requested_at, _)| operation.issued_at < *requested_at);

        match (resolution, cancel) {
            (Some(resolution), Some((requested_at, _))) if resolution.sequence < *requested_at => {
                Some((resolution.sequence, resolution.outcome.clone()))
            }
            (_, Some((requested_at, reason))) => {
                Some((*requested_at, Err(WorkflowError::canceled(reason.clone()))))
            }
            (Some(resolution), None) => Some((resolution.sequence, resolution.outcome.clone())),
            (None, None) => None,
        }
    }

    pub(crate) fn is_resolved(&self, seq: u32) -> bool {
        self.resolutions.contains_key(&seq) || self.canceled_timers.contains_key(&seq)
    }

    pub(crate) fn mark_timer_canceled(&mut self, seq: u32) {
        let visible = self.visible;
        self.canceled_timers.entry(seq).or_insert(visible);
    }

    /// Cancellation request visible after `since`
    pub(crate) fn cancel_after(&self, since: i64) -> Option<(i64, &str)> {
        self.cancel
            .as_ref()
            .filter(|(requested_at, _)| *requested_at > since)
            .map(|(requested_at, reason)| (*requested_at, reason.as_str()))
    }

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel.is_some()
    }

    pub(crate) fn signal_ready(&self, name: &str) -> Option<i64> {
        self.signals
            .get(name)
            .and_then(|mailbox| mailbox.front())
            .map(|(sequence, _)| *sequence)
    }

    pub(crate) fn take_signal(&mut self, name: &str) -> Option<Value> {
        self.signals
            .get_mut(name)
            .and_then(|mailbox| mailbox.pop_front())
            .map(|(_, payload)| payload)
    }

    fn apply(&mut self, record: &EventRecord) {
        self.pending_resolutions = self.pending_resolutions.saturating_sub(1);
        self.visible = record.sequence;
        self.now = record.recorded_at;
        debug!(sequence = record.sequence, event = record.event.name(), "event visible");

        match &record.event {
            HistoryEvent::SignalReceived {
                signal_name,
                payload,
            } => {
                self.signals
                    .entry(signal_name.clone())
                    .or_default()
                    .push_back((record.sequence, payload.clone()));
            }
            HistoryEvent::WorkflowCancelRequested { reason } => {
                if self.cancel.is_none() {
                    self.cancel = Some((record.sequence, reason.clone()));
                }
            }
            event => {
                let Some(seq) = event.resolved_seq() else {
                    return;
                };
                let Some(operation) = self.operations.get(&seq) else {
                    self.fail(format!(
                        "history resolves seq {seq} with {} but the workflow never issued it",
                        event.name()
                    ));
                    return;
                };
                if !operation.kind.resolved_by(event) {
                    self.fail(format!(
                        "history resolves seq {seq} with {} but the workflow issued a {:?} under it",
                        event.name(),
                        operation.kind
                    ));
                    return;
                }
                if self.resolutions.contains_key(&seq) {
                    debug!(seq, event = event.name(), "ignoring duplicate resolution");
                    return;
                }

                let outcome = match event {
                    HistoryEvent::ActivityCompleted { result, .. }
                    | HistoryEvent::ChildWorkflowCompleted { result, .. } => Ok(result.clone()),
                    HistoryEvent::ActivityFailed { error, attempt, .. } => {
                        Err(WorkflowError::activity_failure(error, *attempt))
                    }
                    HistoryEvent::ActivityTimedOut { timeout_type, .. } => {
                        Err(WorkflowError::activity_timeout(*timeout_type))
                    }
                    HistoryEvent::ChildWorkflowFailed { error, .. } => {
                        Err(WorkflowError::child_failure(&operation.name, error))
                    }
                    _ => Ok(Value::Null),
                };
                self.resolutions.insert(
                    seq,
                    Resolution {
                        sequence: record.sequence,
                        outcome,
                    },
                );
            }
        }
    }
}

fn describe(event: &HistoryEvent) -> String {
    match event.resolved_seq().or(match event {
        HistoryEvent::ActivityScheduled { seq, .. }
        | HistoryEvent::TimerStarted { seq, .. }
        | HistoryEvent::SideEffectRecorded { seq, .. }
        | HistoryEvent::ChildWorkflowStarted { seq, .. } => Some(*seq),
        _ => None,
    }) {
        Some(seq) => format!("{} for seq {seq}", event.name()),
        None => event.name().to_string(),
    }
}

/// Failure that prevents an activation from producing a result
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ActivationError {
    MalformedHistory(String),
    NonDeterminism(String),
}

/// Parameters of one activation
#[derive(Debug, Clone)]
pub(crate) struct ActivationParams {
    pub instance_id: Uuid,
    pub namespace: String,
    pub mode: ActivationMode,
    pub continue_as_new_after: usize,
}

/// Result of one activation; contains only `Send` data
#[derive(Debug, Clone)]
pub(crate) struct ActivationOutput {
    /// New commands issued after history was exhausted
    pub commands: Vec<PendingCommand>,
    /// Set when the workflow code returned
    pub outcome: Option<WorkflowOutcome>,
    /// Terminal event already present in history, if any
    pub recorded_terminal: Option<HistoryEvent>,
    /// Logical time at the end of the activation
    pub now: DateTime<Utc>,
}

/// Result of a query activation
#[derive(Debug)]
pub(crate) enum QueryOutcome {
    Answered(Result<Value, WorkflowError>),
    NotFound,
}

/// Run `descriptor` against `history` and collect its new decisions
pub(crate) fn activate(
    descriptor: &WorkflowDescriptor,
    history: &[EventRecord],
    params: &ActivationParams,
) -> Result<ActivationOutput, ActivationError> {
    let mut activation = Activation::start(descriptor, history, params)?;
    activation.run()
}

/// Replay `history` read-only and answer `query` from the resulting state
pub(crate) fn query(
    descriptor: &WorkflowDescriptor,
    history: &[EventRecord],
    params: &ActivationParams,
    query: &str,
) -> Result<QueryOutcome, ActivationError> {
    let mut activation = Activation::start(descriptor, history, params)?;
    activation.run()?;

    let handler = activation.state.borrow_mut().query_handlers.remove(query);
    Ok(match handler {
        Some(handler) => QueryOutcome::Answered(handler()),
        None => QueryOutcome::NotFound,
    })
}

struct Activation {
    state: Rc<RefCell<ReplayState>>,
    future: Option<futures::future::LocalBoxFuture<'static, Result<Value, WorkflowError>>>,
    resolutions: VecDeque<EventRecord>,
    recorded_terminal: Option<HistoryEvent>,
}

impl Activation {
    fn start(
        descriptor: &WorkflowDescriptor,
        history: &[EventRecord],
        params: &ActivationParams,
    ) -> Result<Self, ActivationError> {
        let (first, rest) = history
            .split_first()
            .ok_or_else(|| ActivationError::MalformedHistory("history is empty".to_string()))?;

        let HistoryEvent::WorkflowStarted {
            workflow_type,
            workflow_id,
            task_queue,
            input,
            parent,
            continued_from,
            scheduled_start,
            ..
        } = &first.event
        else {
            return Err(ActivationError::MalformedHistory(format!(
                "history starts with {} instead of workflow_started",
                first.event.name()
            )));
        };

        if workflow_type != &descriptor.workflow_type {
            return Err(ActivationError::MalformedHistory(format!(
                "history belongs to workflow type {workflow_type}, not {}",
                descriptor.workflow_type
            )));
        }

        let info = WorkflowRunInfo {
            namespace: params.namespace.clone(),
            workflow_id: workflow_id.clone(),
            workflow_type: workflow_type.clone(),
            task_queue: task_queue.clone(),
            instance_id: params.instance_id,
            parent: *parent,
            continued_from: *continued_from,
            started_at: scheduled_start.unwrap_or(first.recorded_at),
        };
        let mut state = ReplayState::new(info, params.mode, first, params.continue_as_new_after);

        let mut resolutions = VecDeque::new();
        let mut recorded_terminal = None;
        for record in rest {
            if record.event.is_command() {
                state.recorded.push_back(record.event.clone());
            } else if record.event.is_resolution() {
                resolutions.push_back(record.clone());
            } else if record.event.is_terminal() {
                recorded_terminal = Some(record.event.clone());
                break;
            } else {
                return Err(ActivationError::MalformedHistory(format!(
                    "unexpected {} at sequence {}",
                    record.event.name(),
                    record.sequence
                )));
            }
        }
        state.pending_resolutions = resolutions.len();

        let state = Rc::new(RefCell::new(state));
        let future = descriptor.instantiate(WorkflowContext::new(Rc::clone(&state)), input.clone());

        Ok(Self {
            state,
            future: Some(future),
            resolutions,
            recorded_terminal,
        })
    }

    fn run(&mut self) -> Result<ActivationOutput, ActivationError> {
        let mut cx = Context::from_waker(noop_waker_ref());
        let mut result = None;

        if let Some(mut future) = self.future.take() {
            loop {
                if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                    result = Some(output);
                    break;
                }
                self.check_divergence()?;

                let Some(record) = self.resolutions.pop_front() else {
                    break;
                };
                let wakers = {
                    let mut state = self.state.borrow_mut();
                    state.apply(&record);
                    state.take_wakers()
                };
                wakers.into_iter().for_each(Waker::wake);
                self.check_divergence()?;
            }
        }
        self.check_divergence()?;

        let mut state = self.state.borrow_mut();
        if let Some(unmatched) = state.recorded.front() {
            return Err(ActivationError::NonDeterminism(format!(
                "workflow {} without issuing recorded {}",
                if result.is_some() { "returned" } else { "blocked" },
                describe(unmatched)
            )));
        }

        if state.halted {
            result = None;
        }
        let outcome = result.map(|output| match output {
            Ok(result) => WorkflowOutcome::Completed { result },
            Err(error) if error.kind == WorkflowErrorKind::ContinueAsNew => {
                WorkflowOutcome::ContinuedAsNew {
                    input: error.details.unwrap_or(Value::Null),
                }
            }
            Err(error) if error.is_canceled() && state.cancel.is_some() => {
                WorkflowOutcome::Canceled {
                    reason: error.message,
                }
            }
            Err(error) => WorkflowOutcome::Failed { error },
        });

        Ok(ActivationOutput {
            commands: std::mem::take(&mut state.commands),
            outcome,
            recorded_terminal: self.recorded_terminal.clone(),
            now: state.now,
        })
    }

    fn check_divergence(&self) -> Result<(), ActivationError> {
        match &self.state.borrow().nondeterminism {
            Some(message) => Err(ActivationError::NonDeterminism(message.clone())),
            None => Ok(()),
        }
    }
}

impl Drop for Activation {
    fn drop(&mut self) {
        // Handlers may capture the context; clearing them breaks the cycle
        self.future = None;
        if let Ok(mut state) = self.state.try_borrow_mut() {
            state.query_handlers.clear();
        }
    }
}
