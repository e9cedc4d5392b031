//! Workflow executor with replay support
//!
//! The `WorkflowExecutor` is responsible for:
//! - Starting new workflow runs
//! - Activating runs: replaying history and committing new commands
//! - Performing committed effects (task dispatch, timers, child runs)
//! - Signals, queries, cancellation and crash recovery
//!
//! Activity results, timer fires and child workflow resolution live in
//! their own `impl` blocks (`coordinator`, `timers`, `children`).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::persistence::{
    NewWorkflowInstance, StoreError, TaskDefinition, TimerDefinition, WorkflowEventStore,
    WorkflowInfo, WorkflowStatus,
};
use crate::reliability::chrono_duration;
use crate::workflow::{
    EventRecord, HistoryEvent, ParentLink, PendingCommand, Workflow, WorkflowContext,
    WorkflowError, WorkflowErrorKind, WorkflowOutcome,
};

use super::clock::{Clock, SystemClock};
use super::registry::{RegistryError, WorkflowRegistry};
use super::replay::{self, ActivationError, ActivationMode, ActivationParams, QueryOutcome};
use super::schedule::CronSchedule;

/// Appends retried after a concurrent writer moved the history
const MAX_CONFLICT_RETRIES: usize = 3;

/// Store timer that wakes a run scheduled to start later; workflow timers
/// are numbered from 1
pub(crate) const START_TIMER_SEQ: u32 = 0;

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub namespace: String,

    /// Task queue for runs started without one
    pub default_task_queue: String,

    /// Maximum events per workflow history (for safety)
    pub max_events_per_workflow: usize,

    /// History length at which `is_continue_as_new_suggested` turns true
    pub continue_as_new_suggested_after: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            default_task_queue: "default".to_string(),
            max_events_per_workflow: 10_000,
            continue_as_new_suggested_after: 2_000,
        }
    }
}

impl ExecutorConfig {
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_default_task_queue(mut self, task_queue: impl Into<String>) -> Self {
        self.default_task_queue = task_queue.into();
        self
    }

    pub fn with_max_events_per_workflow(mut self, max: usize) -> Self {
        self.max_events_per_workflow = max;
        self
    }

    pub fn with_continue_as_new_suggested_after(mut self, events: usize) -> Self {
        self.continue_as_new_suggested_after = events;
        self
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Replay produced a decision inconsistent with recorded history
    #[error("non-determinism in workflow {instance_id}: {message}")]
    NonDeterminism { instance_id: Uuid, message: String },

    #[error("workflow {0} is already closed")]
    WorkflowClosed(Uuid),

    #[error("workflow {instance_id} has no query handler for {query:?}")]
    QueryNotFound { instance_id: Uuid, query: String },

    #[error("query failed: {0}")]
    QueryFailed(WorkflowError),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("workflow {0} has too many events ({1} > {2})")]
    TooManyEvents(Uuid, usize, usize),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("malformed history for workflow {0}: {1}")]
    MalformedHistory(Uuid, String),
}

impl ExecutorError {
    fn from_activation(instance_id: Uuid, err: ActivationError) -> Self {
        match err {
            ActivationError::NonDeterminism(message) => {
                error!(%instance_id, %message, "non-deterministic workflow; nothing committed");
                ExecutorError::NonDeterminism {
                    instance_id,
                    message,
                }
            }
            ActivationError::MalformedHistory(message) => {
                error!(%instance_id, %message, "malformed workflow history");
                ExecutorError::MalformedHistory(instance_id, message)
            }
        }
    }

    fn is_conflict(&self) -> bool {
        matches!(
            self,
            ExecutorError::Store(StoreError::ConcurrencyConflict { .. })
        )
    }
}

/// Options for starting a workflow run
#[derive(Debug, Clone, Default)]
pub struct StartWorkflowOptions {
    /// Business id; defaults to the run id
    pub workflow_id: Option<String>,
    pub task_queue: Option<String>,
    /// Closes the run as TimedOut once elapsed
    pub execution_timeout: Option<Duration>,
    /// Run on this cron schedule instead of right away; see [`CronSchedule`]
    pub cron_schedule: Option<String>,
}

impl StartWorkflowOptions {
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

    pub fn with_cron_schedule(mut self, expression: impl Into<String>) -> Self {
        self.cron_schedule = Some(expression.into());
        self
    }
}

/// Result of processing a workflow
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessResult {
    /// Whether the run is closed
    pub completed: bool,

    pub status: WorkflowStatus,

    /// Number of new events written
    pub events_written: usize,

    /// Number of new commands committed
    pub commands: usize,

    /// Number of signals moved from the inbox into history
    pub signals_processed: usize,
}

impl ProcessResult {
    fn unchanged(status: WorkflowStatus) -> Self {
        Self {
            completed: status.is_terminal(),
            status,
            events_written: 0,
            commands: 0,
            signals_processed: 0,
        }
    }
}

/// Work discovered while processing one instance that touches another
#[derive(Debug)]
pub(crate) enum FollowUp {
    Process(Uuid),
    /// Deliver a child's close to the parent operation awaiting it
    NotifyParent {
        parent: ParentLink,
        event: HistoryEvent,
    },
    Cancel {
        instance_id: Uuid,
        reason: String,
    },
}

/// Run that replaces a closing one under the same workflow id
struct Successor {
    id: Uuid,
    cron_schedule: Option<String>,
    start_at: DateTime<Utc>,
}

/// Start attributes of a run, read from its `WorkflowStarted` event
#[derive(Debug, Default)]
struct StartedRun {
    cron_schedule: Option<String>,
    scheduled_start: Option<DateTime<Utc>>,
}

impl StartedRun {
    fn of(history: &[EventRecord]) -> Self {
        match history.first().map(|record| &record.event) {
            Some(HistoryEvent::WorkflowStarted {
                cron_schedule,
                scheduled_start,
                ..
            }) => Self {
                cron_schedule: cron_schedule.clone(),
                scheduled_start: *scheduled_start,
            },
            _ => Self::default(),
        }
    }
}

/// Effect of a committed command, performed after the commit
enum Effect {
    Enqueue(TaskDefinition),
    ScheduleTimer(TimerDefinition),
    RemoveTimer(u32),
    StartChild(NewWorkflowInstance),
}

/// Workflow executor
///
/// Drives workflow code by replaying its history and committing the
/// commands it issues. Each instance is processed by one activation at a
/// time; distinct instances are processed fully in parallel.
///
/// # Example
///
/// ```ignore
/// use durable_replay::prelude::*;
///
/// let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
/// executor.register::<BackgroundCheck>();
///
/// let instance_id = executor
///     .start_workflow::<BackgroundCheck>(&"555-55-5555".to_string(), StartWorkflowOptions::new())
///     .await?;
/// ```
pub struct WorkflowExecutor<S: WorkflowEventStore> {
    pub(crate) store: Arc<S>,
    pub(crate) workflows: WorkflowRegistry,
    pub(crate) config: ExecutorConfig,
    pub(crate) clock: Arc<dyn Clock>,
    locks: DashMap<Uuid, Arc<tokio::sync::Mutex<()>>>,
}

impl<S: WorkflowEventStore> WorkflowExecutor<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, ExecutorConfig::default())
    }

    pub fn with_config(store: S, config: ExecutorConfig) -> Self {
        Self::from_shared(Arc::new(store), config)
    }

    /// Build on a store shared with other components
    pub fn from_shared(store: Arc<S>, config: ExecutorConfig) -> Self {
        Self {
            store,
            workflows: WorkflowRegistry::new(),
            config,
            clock: Arc::new(SystemClock),
            locks: DashMap::new(),
        }
    }

    /// Replace the time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn register<W: Workflow>(&mut self) -> &mut Self {
        self.workflows.register::<W>();
        info!(workflow_type = W::TYPE, "registered workflow type");
        self
    }

    /// Register a plain async function as a workflow
    pub fn register_fn<I, O, F, Fut>(&mut self, workflow_type: &str, f: F) -> &mut Self
    where
        I: serde::de::DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, WorkflowError>> + 'static,
    {
        self.workflows.register_fn(workflow_type, f);
        info!(%workflow_type, "registered workflow type");
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn shared_store(&self) -> Arc<S> {
        Arc::clone(&self.store)
    }

    pub fn workflows(&self) -> &WorkflowRegistry {
        &self.workflows
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    pub(crate) fn instance_lock(&self, instance_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .value()
            .clone()
    }

    fn forget_lock(&self, instance_id: Uuid) {
        self.locks.remove(&instance_id);
    }

    // =========================================================================
    // Starting Runs
    // =========================================================================

    /// Start a workflow and run it until it first blocks
    #[instrument(skip(self, input, options), fields(workflow_type = W::TYPE))]
    pub async fn start_workflow<W: Workflow>(
        &self,
        input: &W::Input,
        options: StartWorkflowOptions,
    ) -> Result<Uuid, ExecutorError> {
        let input = serde_json::to_value(input)?;
        self.start_workflow_by_type(W::TYPE, input, options).await
    }

    #[instrument(skip(self, input, options))]
    pub async fn start_workflow_by_type(
        &self,
        workflow_type: &str,
        input: serde_json::Value,
        options: StartWorkflowOptions,
    ) -> Result<Uuid, ExecutorError> {
        self.workflows.get(workflow_type)?;

        let now = self.clock.now();
        let schedule = options
            .cron_schedule
            .as_deref()
            .map(|expression| {
                let schedule = CronSchedule::parse(expression)?;
                let first = schedule.next_after(now).ok_or_else(|| {
                    ExecutorError::Configuration(format!(
                        "cron schedule {expression:?} never fires after {now}"
                    ))
                })?;
                Ok::<_, ExecutorError>((schedule, first))
            })
            .transpose()?;

        let instance_id = Uuid::now_v7();
        let run = NewWorkflowInstance {
            id: instance_id,
            namespace: self.config.namespace.clone(),
            workflow_id: options
                .workflow_id
                .unwrap_or_else(|| instance_id.to_string()),
            workflow_type: workflow_type.to_string(),
            task_queue: options
                .task_queue
                .unwrap_or_else(|| self.config.default_task_queue.clone()),
            input,
            parent: None,
            continued_from: None,
            execution_deadline: options
                .execution_timeout
                .map(|timeout| now + chrono_duration(timeout)),
            created_at: now,
        };

        match &schedule {
            Some((schedule, first)) => {
                self.create_scheduled_run(run, Some(schedule.expression()), *first)
                    .await?;
                info!(%instance_id, %workflow_type, cron = schedule.expression(), start_at = %first, "scheduled cron workflow");
            }
            None => {
                self.create_run(run).await?;
                info!(%instance_id, %workflow_type, "started workflow");
            }
        }

        self.process_workflow(instance_id).await?;
        Ok(instance_id)
    }

    /// Persist a run and its `WorkflowStarted` event
    pub(crate) async fn create_run(&self, run: NewWorkflowInstance) -> Result<(), ExecutorError> {
        let created_at = run.created_at;
        self.create_scheduled_run(run, None, created_at).await
    }

    /// Persist a run whose code first runs at `start_at`; a later start is
    /// woken by a store timer
    pub(crate) async fn create_scheduled_run(
        &self,
        run: NewWorkflowInstance,
        cron_schedule: Option<&str>,
        start_at: DateTime<Utc>,
    ) -> Result<(), ExecutorError> {
        let (id, created_at) = (run.id, run.created_at);
        let deferred = start_at > created_at;
        let started = HistoryEvent::WorkflowStarted {
            workflow_type: run.workflow_type.clone(),
            workflow_id: run.workflow_id.clone(),
            task_queue: run.task_queue.clone(),
            input: run.input.clone(),
            parent: run.parent,
            continued_from: run.continued_from,
            cron_schedule: cron_schedule.map(str::to_string),
            scheduled_start: deferred.then_some(start_at),
        };

        self.store.create_workflow(run).await?;
        self.store
            .append_events(id, 0, created_at, vec![started])
            .await?;
        if deferred {
            self.store
                .schedule_timer(TimerDefinition {
                    instance_id: id,
                    seq: START_TIMER_SEQ,
                    fire_at: start_at,
                    started_sequence: 0,
                })
                .await?;
        }
        Ok(())
    }

    // =========================================================================
    // Activation
    // =========================================================================

    /// Activate a run against its current history and commit what it decides.
    ///
    /// Work this uncovers for other instances (child starts, parent
    /// notification) is processed before returning.
    #[instrument(skip(self))]
    pub async fn process_workflow(&self, instance_id: Uuid) -> Result<ProcessResult, ExecutorError> {
        let (result, follow_ups) = self.process_with_retry(instance_id).await?;
        self.drain(follow_ups).await;
        Ok(result)
    }

    async fn process_with_retry(
        &self,
        instance_id: Uuid,
    ) -> Result<(ProcessResult, Vec<FollowUp>), ExecutorError> {
        let mut attempt = 0;
        loop {
            match self.process_once(instance_id).await {
                Err(err) if err.is_conflict() && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(%instance_id, attempt, "history moved during activation; retrying");
                }
                other => return other,
            }
        }
    }

    /// Process queued follow-ups until none remain.
    ///
    /// Failures are logged per instance; they never fail the caller whose
    /// own instance was already committed.
    pub(crate) async fn drain(&self, follow_ups: Vec<FollowUp>) {
        let mut queue: VecDeque<FollowUp> = follow_ups.into();

        while let Some(next) = queue.pop_front() {
            let more = match next {
                FollowUp::Process(instance_id) => self
                    .process_with_retry(instance_id)
                    .await
                    .map(|(_, more)| more)
                    .map_err(|err| (instance_id, err)),
                FollowUp::NotifyParent { parent, event } => self
                    .resolve_child(parent, event)
                    .await
                    .map_err(|err| (parent.instance_id, err)),
                FollowUp::Cancel {
                    instance_id,
                    reason,
                } => match self.request_cancel(instance_id, &reason).await {
                    Ok(more) => Ok(more),
                    Err(ExecutorError::WorkflowClosed(_)) => Ok(vec![]),
                    Err(err) => Err((instance_id, err)),
                },
            };

            match more {
                Ok(more) => queue.extend(more),
                Err((instance_id, err)) => {
                    error!(%instance_id, error = %err, "failed to process follow-up");
                }
            }
        }
    }

    async fn process_once(
        &self,
        instance_id: Uuid,
    ) -> Result<(ProcessResult, Vec<FollowUp>), ExecutorError> {
        let lock = self.instance_lock(instance_id);
        let guard = lock.lock().await;

        let info = self.store.get_workflow_info(instance_id).await?;
        if info.status.is_terminal() {
            debug!(%instance_id, status = %info.status, "workflow already closed");
            return Ok((ProcessResult::unchanged(info.status), vec![]));
        }
        let descriptor = self.workflows.get(&info.workflow_type)?;

        let mut history = self.store.load_events(instance_id).await?;
        let mut next_sequence = next_sequence_of(&history);
        let started = StartedRun::of(&history);

        if let Some(start_at) = started.scheduled_start.filter(|at| *at > self.clock.now()) {
            let cancel = history.iter().find_map(|record| match &record.event {
                HistoryEvent::WorkflowCancelRequested { reason } => Some(reason.clone()),
                _ => None,
            });
            let Some(reason) = cancel else {
                debug!(%instance_id, %start_at, "workflow not due to start yet");
                return Ok((ProcessResult::unchanged(WorkflowStatus::Running), vec![]));
            };

            // Canceled before it ever ran; the schedule ends here
            let now = self.clock.now();
            self.store
                .append_events(
                    instance_id,
                    next_sequence,
                    now,
                    vec![HistoryEvent::WorkflowCanceled {
                        reason: reason.clone(),
                    }],
                )
                .await?;
            let mut follow_ups = Vec::new();
            let status = self
                .close_run(&info, WorkflowOutcome::Canceled { reason }, None, now, &mut follow_ups)
                .await?;
            drop(guard);
            self.forget_lock(instance_id);
            return Ok((
                ProcessResult {
                    completed: true,
                    status,
                    events_written: 1,
                    commands: 0,
                    signals_processed: 0,
                },
                follow_ups,
            ));
        }

        // Move buffered signals into history
        let signals = self.store.get_pending_signals(instance_id).await?;
        let signals_processed = signals.len();
        if !signals.is_empty() {
            let now = self.clock.now();
            let events: Vec<_> = signals
                .into_iter()
                .map(|signal| HistoryEvent::SignalReceived {
                    signal_name: signal.signal_name,
                    payload: signal.payload,
                })
                .collect();
            let appended = self
                .store
                .append_events(instance_id, next_sequence, now, events.clone())
                .await?;
            self.store
                .mark_signals_processed(instance_id, signals_processed)
                .await?;

            for (offset, event) in events.into_iter().enumerate() {
                history.push(EventRecord {
                    sequence: next_sequence + offset as i64,
                    recorded_at: now,
                    event,
                });
            }
            next_sequence = appended;
            info!(%instance_id, count = signals_processed, "signals delivered");
        }

        if history.len() > self.config.max_events_per_workflow {
            return Err(ExecutorError::TooManyEvents(
                instance_id,
                history.len(),
                self.config.max_events_per_workflow,
            ));
        }

        let params = self.activation_params(&info, ActivationMode::Execute);
        let output = replay::activate(descriptor, &history, &params)
            .map_err(|err| ExecutorError::from_activation(instance_id, err))?;

        // Commit commands and the close event in one append
        let now = self.clock.now();
        let mut events = Vec::with_capacity(output.commands.len() + 1);
        let mut effects = Vec::with_capacity(output.commands.len());
        let commands = output.commands.len();

        for command in output.commands {
            let started_sequence = next_sequence + events.len() as i64;
            let (event, effect) = self.command_effect(&info, command, now, started_sequence);
            events.push(event);
            effects.extend(effect);
        }

        let closing = match output.outcome {
            Some(outcome) => {
                let new_run =
                    matches!(outcome, WorkflowOutcome::ContinuedAsNew { .. }).then(Uuid::now_v7);
                events.push(outcome.clone().into_event(new_run));

                let next_cron = match (&outcome, started.cron_schedule.as_deref()) {
                    (
                        WorkflowOutcome::Completed { .. } | WorkflowOutcome::Failed { .. },
                        Some(expression),
                    ) => CronSchedule::parse(expression)?
                        .next_after(now)
                        .map(|start_at| (Uuid::now_v7(), expression.to_string(), start_at)),
                    _ => None,
                };
                if let Some((next_instance_id, _, start_at)) = &next_cron {
                    events.push(HistoryEvent::WorkflowCronScheduled {
                        next_instance_id: *next_instance_id,
                        start_at: *start_at,
                    });
                }
                Some((outcome, new_run, next_cron))
            }
            None => None,
        };

        let events_written = events.len() + signals_processed;
        if !events.is_empty() {
            self.store
                .append_events(instance_id, next_sequence, now, events)
                .await?;
        }
        debug!(%instance_id, commands, closed = closing.is_some(), "committed activation");

        let mut follow_ups = Vec::new();
        for effect in effects {
            follow_ups.extend(self.perform(instance_id, effect).await?);
        }

        let status = match closing {
            Some((outcome, new_run, next_cron)) => {
                let successor = match (new_run, next_cron) {
                    (Some(id), _) => Some(Successor {
                        id,
                        cron_schedule: started.cron_schedule,
                        start_at: now,
                    }),
                    (None, Some((id, expression, start_at))) => Some(Successor {
                        id,
                        cron_schedule: Some(expression),
                        start_at,
                    }),
                    (None, None) => None,
                };
                let status = self
                    .close_run(&info, outcome, successor, now, &mut follow_ups)
                    .await?;
                drop(guard);
                self.forget_lock(instance_id);
                status
            }
            None => WorkflowStatus::Running,
        };

        Ok((
            ProcessResult {
                completed: status.is_terminal(),
                status,
                events_written,
                commands,
                signals_processed,
            },
            follow_ups,
        ))
    }

    pub(crate) fn activation_params(&self, info: &WorkflowInfo, mode: ActivationMode) -> ActivationParams {
        ActivationParams {
            instance_id: info.id,
            namespace: info.namespace.clone(),
            mode,
            continue_as_new_after: self.config.continue_as_new_suggested_after,
        }
    }

    fn command_effect(
        &self,
        info: &WorkflowInfo,
        command: PendingCommand,
        now: DateTime<Utc>,
        event_sequence: i64,
    ) -> (HistoryEvent, Option<Effect>) {
        match command {
            PendingCommand::ScheduleActivity {
                seq,
                activity_type,
                task_queue,
                input,
                options,
            } => {
                debug!(instance_id = %info.id, seq, %activity_type, "scheduling activity");
                let task = TaskDefinition {
                    instance_id: info.id,
                    seq,
                    activity_type: activity_type.clone(),
                    task_queue: task_queue.clone(),
                    input: input.clone(),
                    options: options.clone(),
                    scheduled_at: now,
                };
                (
                    HistoryEvent::ActivityScheduled {
                        seq,
                        activity_type,
                        task_queue,
                        input,
                        options,
                    },
                    Some(Effect::Enqueue(task)),
                )
            }
            PendingCommand::StartTimer {
                seq,
                fire_at,
                duration,
            } => {
                debug!(instance_id = %info.id, seq, %fire_at, "starting timer");
                (
                    HistoryEvent::TimerStarted {
                        seq,
                        fire_at,
                        duration_ms: duration.as_millis() as u64,
                    },
                    Some(Effect::ScheduleTimer(TimerDefinition {
                        instance_id: info.id,
                        seq,
                        fire_at,
                        started_sequence: event_sequence,
                    })),
                )
            }
            PendingCommand::CancelTimer { seq } => {
                debug!(instance_id = %info.id, seq, "canceling timer");
                (
                    HistoryEvent::TimerCanceled { seq },
                    Some(Effect::RemoveTimer(seq)),
                )
            }
            PendingCommand::RecordSideEffect { seq, value } => {
                (HistoryEvent::SideEffectRecorded { seq, value }, None)
            }
            PendingCommand::StartChildWorkflow {
                seq,
                workflow_type,
                workflow_id,
                input,
                options,
            } => {
                let child_id = Uuid::now_v7();
                debug!(instance_id = %info.id, seq, %workflow_type, %child_id, "starting child workflow");
                let child = NewWorkflowInstance {
                    id: child_id,
                    namespace: info.namespace.clone(),
                    workflow_id: workflow_id.clone(),
                    workflow_type: workflow_type.clone(),
                    task_queue: options
                        .task_queue
                        .clone()
                        .unwrap_or_else(|| info.task_queue.clone()),
                    input: input.clone(),
                    parent: Some(ParentLink {
                        instance_id: info.id,
                        seq,
                    }),
                    continued_from: None,
                    execution_deadline: options
                        .execution_timeout
                        .map(|timeout| now + chrono_duration(timeout)),
                    created_at: now,
                };
                (
                    HistoryEvent::ChildWorkflowStarted {
                        seq,
                        workflow_type,
                        workflow_id,
                        instance_id: child_id,
                        input,
                    },
                    Some(Effect::StartChild(child)),
                )
            }
        }
    }

    async fn perform(&self, instance_id: Uuid, effect: Effect) -> Result<Vec<FollowUp>, ExecutorError> {
        match effect {
            Effect::Enqueue(task) => {
                self.store.enqueue_task(task).await?;
            }
            Effect::ScheduleTimer(timer) => {
                self.store.schedule_timer(timer).await?;
            }
            Effect::RemoveTimer(seq) => {
                self.store.remove_timer(instance_id, seq).await?;
            }
            Effect::StartChild(child) => {
                return self.start_child_run(child).await;
            }
        }
        Ok(vec![])
    }

    /// Record a run's close in the instance table and clean up its work
    async fn close_run(
        &self,
        info: &WorkflowInfo,
        outcome: WorkflowOutcome,
        successor: Option<Successor>,
        now: DateTime<Utc>,
        follow_ups: &mut Vec<FollowUp>,
    ) -> Result<WorkflowStatus, ExecutorError> {
        let instance_id = info.id;
        self.store.cancel_workflow_tasks(instance_id).await?;
        self.store.cancel_workflow_timers(instance_id).await?;

        let (status, result, error) = match &outcome {
            WorkflowOutcome::Completed { result } => {
                info!(%instance_id, workflow_type = %info.workflow_type, "workflow completed");
                (WorkflowStatus::Completed, Some(result.clone()), None)
            }
            WorkflowOutcome::Failed { error } => {
                warn!(%instance_id, workflow_type = %info.workflow_type, error = %error, "workflow failed");
                (WorkflowStatus::Failed, None, Some(serde_json::to_value(error)?))
            }
            WorkflowOutcome::Canceled { reason } => {
                info!(%instance_id, %reason, "workflow canceled");
                let error = WorkflowError::canceled(reason.clone());
                (WorkflowStatus::Canceled, None, Some(serde_json::to_value(error)?))
            }
            WorkflowOutcome::ContinuedAsNew { .. } => {
                info!(%instance_id, new_run = ?successor.as_ref().map(|next| next.id), "workflow continued as new");
                (WorkflowStatus::ContinuedAsNew, None, None)
            }
        };
        self.store
            .update_workflow_status(instance_id, status, result.clone(), error, now)
            .await?;

        let next_input = match &outcome {
            WorkflowOutcome::ContinuedAsNew { input } => Some(input.clone()),
            _ => None,
        };
        if let Some(successor) = successor {
            let run = NewWorkflowInstance {
                id: successor.id,
                namespace: info.namespace.clone(),
                workflow_id: info.workflow_id.clone(),
                workflow_type: info.workflow_type.clone(),
                task_queue: info.task_queue.clone(),
                input: next_input.unwrap_or_else(|| info.input.clone()),
                parent: info.parent,
                continued_from: Some(instance_id),
                execution_deadline: info.execution_deadline,
                created_at: now,
            };
            self.create_scheduled_run(run, successor.cron_schedule.as_deref(), successor.start_at)
                .await?;
            if successor.start_at > now {
                info!(%instance_id, next_run = %successor.id, start_at = %successor.start_at, "next cron run scheduled");
            } else {
                follow_ups.push(FollowUp::Process(successor.id));
            }
            return Ok(status);
        }

        if let Some(parent) = info.parent {
            follow_ups.push(FollowUp::NotifyParent {
                parent,
                event: child_close_event(parent.seq, outcome),
            });
        }
        Ok(status)
    }

    // =========================================================================
    // Signals, Queries, Cancellation
    // =========================================================================

    /// Deliver a signal and let the workflow react to it
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow(
        &self,
        instance_id: Uuid,
        signal_name: &str,
        payload: serde_json::Value,
    ) -> Result<ProcessResult, ExecutorError> {
        let status = self.store.get_workflow_status(instance_id).await?;
        if status.is_terminal() {
            warn!(%instance_id, %status, "cannot signal a closed workflow");
            return Err(ExecutorError::WorkflowClosed(instance_id));
        }

        let signal =
            crate::workflow::WorkflowSignal::new(signal_name, payload).sent_at(self.clock.now());
        self.store.send_signal(instance_id, signal).await?;
        info!(%instance_id, %signal_name, "signal sent");

        self.process_workflow(instance_id).await
    }

    /// Answer a query from the workflow's replayed state; nothing is
    /// committed
    #[instrument(skip(self))]
    pub async fn query_workflow(
        &self,
        instance_id: Uuid,
        query: &str,
    ) -> Result<serde_json::Value, ExecutorError> {
        let info = self.store.get_workflow_info(instance_id).await?;
        let descriptor = self.workflows.get(&info.workflow_type)?;
        let history = self.store.load_events(instance_id).await?;

        let params = self.activation_params(&info, ActivationMode::Query);
        let outcome = replay::query(descriptor, &history, &params, query)
            .map_err(|err| ExecutorError::from_activation(instance_id, err))?;

        match outcome {
            QueryOutcome::Answered(Ok(value)) => Ok(value),
            QueryOutcome::Answered(Err(err)) => Err(ExecutorError::QueryFailed(err)),
            QueryOutcome::NotFound => Err(ExecutorError::QueryNotFound {
                instance_id,
                query: query.to_string(),
            }),
        }
    }

    /// Request cancellation; the workflow observes it at its pending awaits
    /// and decides how to close
    #[instrument(skip(self))]
    pub async fn cancel_workflow(
        &self,
        instance_id: Uuid,
        reason: &str,
    ) -> Result<ProcessResult, ExecutorError> {
        let follow_ups = self.request_cancel(instance_id, reason).await?;
        self.drain(follow_ups).await;
        self.process_workflow(instance_id).await
    }

    async fn request_cancel(
        &self,
        instance_id: Uuid,
        reason: &str,
    ) -> Result<Vec<FollowUp>, ExecutorError> {
        let lock = self.instance_lock(instance_id);
        let _guard = lock.lock().await;

        let status = self.store.get_workflow_status(instance_id).await?;
        if status.is_terminal() {
            return Err(ExecutorError::WorkflowClosed(instance_id));
        }

        let history = self.store.load_events(instance_id).await?;
        let now = self.clock.now();
        self.store
            .append_events(
                instance_id,
                next_sequence_of(&history),
                now,
                vec![HistoryEvent::WorkflowCancelRequested {
                    reason: reason.to_string(),
                }],
            )
            .await?;
        let tasks = self.store.cancel_workflow_tasks(instance_id).await?;
        let timers = self.store.cancel_workflow_timers(instance_id).await?;
        info!(%instance_id, %reason, tasks, timers, "cancellation requested");

        // Children still running are canceled along with their parent
        let mut follow_ups: Vec<FollowUp> = open_children(&history)
            .into_iter()
            .map(|child| FollowUp::Cancel {
                instance_id: child,
                reason: format!("parent {instance_id} canceled"),
            })
            .collect();
        follow_ups.push(FollowUp::Process(instance_id));
        Ok(follow_ups)
    }

    // =========================================================================
    // Inspection and Recovery
    // =========================================================================

    /// Final result of a workflow, following continue-as-new and cron
    /// chains. `None` while the latest run is still open, so a cron chain
    /// only yields a result once its schedule ends.
    pub async fn get_result(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<Result<serde_json::Value, WorkflowError>>, ExecutorError> {
        let mut current = instance_id;
        loop {
            let info = self.store.get_workflow_info(current).await?;
            if !info.status.is_terminal() {
                return Ok(None);
            }
            if let Some(next) = self.successor(current).await? {
                current = next;
                continue;
            }

            match info.status {
                WorkflowStatus::Completed => {
                    return Ok(Some(Ok(info.result.unwrap_or(serde_json::Value::Null))))
                }
                WorkflowStatus::ContinuedAsNew => {
                    return Err(ExecutorError::MalformedHistory(
                        current,
                        "continued as new without a successor".to_string(),
                    ));
                }
                status => {
                    let error = match info.error {
                        Some(error) => serde_json::from_value(error)?,
                        None => WorkflowError::new(format!("workflow closed as {status}")),
                    };
                    return Ok(Some(Err(error)));
                }
            }
        }
    }

    /// Latest run in the chain starting at `instance_id`, following
    /// continue-as-new and cron successors
    pub async fn latest_run(&self, instance_id: Uuid) -> Result<Uuid, ExecutorError> {
        let mut current = instance_id;
        while self.store.get_workflow_status(current).await?.is_terminal() {
            match self.successor(current).await? {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(current)
    }

    /// Run that carries on a closed run's workflow id
    async fn successor(&self, instance_id: Uuid) -> Result<Option<Uuid>, ExecutorError> {
        let history = self.store.load_events(instance_id).await?;
        Ok(history
            .iter()
            .rev()
            .take_while(|record| record.event.successor().is_some() || record.event.is_terminal())
            .find_map(|record| record.event.successor()))
    }

    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<EventRecord>, ExecutorError> {
        Ok(self.store.load_events(instance_id).await?)
    }

    pub async fn workflow_info(&self, instance_id: Uuid) -> Result<WorkflowInfo, ExecutorError> {
        Ok(self.store.get_workflow_info(instance_id).await?)
    }

    /// Restore the effects of every open run after a crash.
    ///
    /// Re-enqueues unresolved activities, re-registers pending timers and
    /// creates child runs that were committed but never created, then
    /// activates each run. Returns the number of runs recovered.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize, ExecutorError> {
        let running = self.store.list_workflows(Some(WorkflowStatus::Running)).await?;
        let count = running.len();

        for info in running {
            let mut history = self.store.load_events(info.id).await?;
            if history.is_empty() {
                let run = NewWorkflowInstance {
                    id: info.id,
                    namespace: info.namespace.clone(),
                    workflow_id: info.workflow_id.clone(),
                    workflow_type: info.workflow_type.clone(),
                    task_queue: info.task_queue.clone(),
                    input: info.input.clone(),
                    parent: info.parent,
                    continued_from: info.continued_from,
                    execution_deadline: info.execution_deadline,
                    created_at: info.created_at,
                };
                let started = HistoryEvent::WorkflowStarted {
                    workflow_type: run.workflow_type.clone(),
                    workflow_id: run.workflow_id.clone(),
                    task_queue: run.task_queue.clone(),
                    input: run.input.clone(),
                    parent: run.parent,
                    continued_from: run.continued_from,
                    cron_schedule: None,
                    scheduled_start: None,
                };
                self.store
                    .append_events(info.id, 0, run.created_at, vec![started])
                    .await?;
                history = self.store.load_events(info.id).await?;
            }

            let mut follow_ups = Vec::new();
            if let Some(start_at) = StartedRun::of(&history)
                .scheduled_start
                .filter(|at| *at > self.clock.now())
            {
                self.store
                    .schedule_timer(TimerDefinition {
                        instance_id: info.id,
                        seq: START_TIMER_SEQ,
                        fire_at: start_at,
                        started_sequence: 0,
                    })
                    .await?;
            }
            for record in &history {
                if resolved(&history, record) {
                    continue;
                }
                match &record.event {
                    HistoryEvent::ActivityScheduled {
                        seq,
                        activity_type,
                        task_queue,
                        input,
                        options,
                    } => {
                        self.store
                            .enqueue_task(TaskDefinition {
                                instance_id: info.id,
                                seq: *seq,
                                activity_type: activity_type.clone(),
                                task_queue: task_queue.clone(),
                                input: input.clone(),
                                options: options.clone(),
                                scheduled_at: record.recorded_at,
                            })
                            .await?;
                    }
                    HistoryEvent::TimerStarted { seq, fire_at, .. } => {
                        self.store
                            .schedule_timer(TimerDefinition {
                                instance_id: info.id,
                                seq: *seq,
                                fire_at: *fire_at,
                                started_sequence: record.sequence,
                            })
                            .await?;
                    }
                    HistoryEvent::ChildWorkflowStarted {
                        seq,
                        workflow_type,
                        workflow_id,
                        instance_id: child_id,
                        input,
                    } => {
                        match self.store.get_workflow_info(*child_id).await {
                            Ok(_) => {}
                            Err(StoreError::WorkflowNotFound(_)) => {
                                let child = NewWorkflowInstance {
                                    id: *child_id,
                                    namespace: info.namespace.clone(),
                                    workflow_id: workflow_id.clone(),
                                    workflow_type: workflow_type.clone(),
                                    task_queue: info.task_queue.clone(),
                                    input: input.clone(),
                                    parent: Some(ParentLink {
                                        instance_id: info.id,
                                        seq: *seq,
                                    }),
                                    continued_from: None,
                                    execution_deadline: None,
                                    created_at: record.recorded_at,
                                };
                                follow_ups.extend(self.start_child_run(child).await?);
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                    _ => {}
                }
            }

            info!(instance_id = %info.id, "recovered workflow");
            follow_ups.push(FollowUp::Process(info.id));
            self.drain(follow_ups).await;
        }

        Ok(count)
    }
}

/// Sequence the next appended event receives
pub(crate) fn next_sequence_of(history: &[EventRecord]) -> i64 {
    history.last().map_or(0, |record| record.sequence + 1)
}

/// Whether the operation a command event opened is already settled
fn resolved(history: &[EventRecord], command: &EventRecord) -> bool {
    let seq = match &command.event {
        HistoryEvent::ActivityScheduled { seq, .. }
        | HistoryEvent::TimerStarted { seq, .. }
        | HistoryEvent::ChildWorkflowStarted { seq, .. } => *seq,
        _ => return true,
    };
    history
        .iter()
        .any(|record| record.sequence > command.sequence && record.event.resolved_seq() == Some(seq))
}

/// Child runs started by `history` that have not reported back
fn open_children(history: &[EventRecord]) -> Vec<Uuid> {
    history
        .iter()
        .filter(|record| !resolved(history, record))
        .filter_map(|record| match record.event {
            HistoryEvent::ChildWorkflowStarted { instance_id, .. } => Some(instance_id),
            _ => None,
        })
        .collect()
}

/// Event delivered to a parent when its child closes
pub(crate) fn child_close_event(seq: u32, outcome: WorkflowOutcome) -> HistoryEvent {
    match outcome {
        WorkflowOutcome::Completed { result } => HistoryEvent::ChildWorkflowCompleted { seq, result },
        WorkflowOutcome::Failed { error } => HistoryEvent::ChildWorkflowFailed { seq, error },
        WorkflowOutcome::Canceled { reason } => HistoryEvent::ChildWorkflowFailed {
            seq,
            error: WorkflowError::canceled(reason),
        },
        WorkflowOutcome::ContinuedAsNew { .. } => HistoryEvent::ChildWorkflowFailed {
            seq,
            error: WorkflowError::with_kind(
                WorkflowErrorKind::ChildWorkflowFailure,
                "child continued as new",
            ),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use serde_json::json;

    use super::*;
    use crate::engine::ManualClock;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::workflow::ActivityOptions;

    fn executor() -> WorkflowExecutor<InMemoryWorkflowEventStore> {
        let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new())
            .with_clock(Arc::new(ManualClock::new(DateTime::UNIX_EPOCH)));
        executor
            .register_fn("echo", |_ctx: WorkflowContext, input: serde_json::Value| async move {
                Ok::<_, WorkflowError>(input)
            })
            .register_fn("approval", |ctx: WorkflowContext, _: ()| async move {
                let status = Rc::new(RefCell::new("waiting".to_string()));
                let view = Rc::clone(&status);
                ctx.set_query_handler("status", move || view.borrow().clone());

                let approved: bool = ctx.signal_channel("approve").recv().await?;
                *status.borrow_mut() = "decided".to_string();
                Ok::<_, WorkflowError>(approved)
            })
            .register_fn("counter", |ctx: WorkflowContext, n: u32| async move {
                if n < 3 {
                    return Err(ctx.continue_as_new(&(n + 1)));
                }
                Ok::<_, WorkflowError>(n)
            })
            .register_fn("fetch", |ctx: WorkflowContext, _: ()| async move {
                let options = ActivityOptions::start_to_close(Duration::from_secs(30));
                let value: i64 = ctx.execute_activity("fetch", &(), options).await?;
                Ok::<_, WorkflowError>(value)
            });
        executor
    }

    #[tokio::test]
    async fn test_start_completes_immediately() {
        let executor = executor();
        let id = executor
            .start_workflow_by_type("echo", json!({"a": 1}), StartWorkflowOptions::new())
            .await
            .expect("should start");

        assert_eq!(
            executor.get_result(id).await.expect("should load"),
            Some(Ok(json!({"a": 1})))
        );

        let info = executor.workflow_info(id).await.expect("should load");
        assert_eq!(info.status, WorkflowStatus::Completed);
        assert_eq!(info.workflow_id, id.to_string());
        assert_eq!(info.task_queue, "default");
    }

    #[tokio::test]
    async fn test_instance_lock_is_shared_per_run() {
        let executor = executor();
        let id = Uuid::now_v7();

        let first = executor.instance_lock(id);
        let second = executor.instance_lock(id);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &executor.instance_lock(Uuid::now_v7())));

        let _guard = first.lock().await;
        assert!(second.try_lock().is_err());
    }

    #[tokio::test]
    async fn test_start_unknown_type() {
        let executor = executor();
        let result = executor
            .start_workflow_by_type("missing", json!(null), StartWorkflowOptions::new())
            .await;

        assert!(matches!(result, Err(ExecutorError::Registry(_))));
        assert_eq!(executor.store().workflow_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_cron_schedule_creates_nothing() {
        let executor = executor();
        let result = executor
            .start_workflow_by_type(
                "echo",
                json!(null),
                StartWorkflowOptions::new().with_cron_schedule("61 * * * *"),
            )
            .await;

        assert!(matches!(result, Err(ExecutorError::Configuration(_))));
        assert_eq!(executor.store().workflow_count(), 0);
        assert_eq!(executor.store().timer_count(), 0);
    }

    #[tokio::test]
    async fn test_cron_run_waits_for_first_fire_time() {
        let executor = executor();
        let id = executor
            .start_workflow_by_type(
                "echo",
                json!("tick"),
                StartWorkflowOptions::new().with_cron_schedule("0 * * * *"),
            )
            .await
            .expect("should start");

        // Dormant until the top of the hour; the start timer wakes it
        let info = executor.workflow_info(id).await.expect("should load");
        assert_eq!(info.status, WorkflowStatus::Running);
        assert_eq!(executor.store().timer_count(), 1);
        let result = executor.process_workflow(id).await.expect("should process");
        assert_eq!(result.events_written, 0);
        assert_eq!(executor.history(id).await.expect("should load").len(), 1);
    }

    #[tokio::test]
    async fn test_signal_and_query() {
        let executor = executor();
        let id = executor
            .start_workflow_by_type("approval", json!(null), StartWorkflowOptions::new())
            .await
            .expect("should start");

        let status = executor.query_workflow(id, "status").await.expect("should answer");
        assert_eq!(status, json!("waiting"));

        let missing = executor.query_workflow(id, "other").await;
        assert!(matches!(missing, Err(ExecutorError::QueryNotFound { .. })));

        let result = executor
            .signal_workflow(id, "approve", json!(true))
            .await
            .expect("should signal");
        assert!(result.completed);
        assert_eq!(result.signals_processed, 1);

        assert_eq!(
            executor.get_result(id).await.expect("should load"),
            Some(Ok(json!(true)))
        );
        assert_eq!(
            executor.query_workflow(id, "status").await.expect("should answer"),
            json!("decided")
        );

        let closed = executor.signal_workflow(id, "approve", json!(false)).await;
        assert!(matches!(closed, Err(ExecutorError::WorkflowClosed(_))));
    }

    #[tokio::test]
    async fn test_query_does_not_write_history() {
        let executor = executor();
        let id = executor
            .start_workflow_by_type("approval", json!(null), StartWorkflowOptions::new())
            .await
            .expect("should start");
        let before = executor.history(id).await.expect("should load").len();

        executor.query_workflow(id, "status").await.expect("should answer");

        assert_eq!(executor.history(id).await.expect("should load").len(), before);
    }

    #[tokio::test]
    async fn test_cancel_closes_waiting_workflow() {
        let executor = executor();
        let id = executor
            .start_workflow_by_type("approval", json!(null), StartWorkflowOptions::new())
            .await
            .expect("should start");

        let result = executor.cancel_workflow(id, "no longer needed").await.expect("should cancel");
        assert_eq!(result.status, WorkflowStatus::Canceled);

        let err = executor
            .get_result(id)
            .await
            .expect("should load")
            .expect("should be closed")
            .expect_err("should be canceled");
        assert!(err.is_canceled());

        let again = executor.cancel_workflow(id, "twice").await;
        assert!(matches!(again, Err(ExecutorError::WorkflowClosed(_))));
    }

    #[tokio::test]
    async fn test_continue_as_new_chain() {
        let executor = executor();
        let id = executor
            .start_workflow_by_type(
                "counter",
                json!(0),
                StartWorkflowOptions::new().with_workflow_id("counter-1"),
            )
            .await
            .expect("should start");

        assert_eq!(
            executor.get_result(id).await.expect("should load"),
            Some(Ok(json!(3)))
        );

        let first = executor.workflow_info(id).await.expect("should load");
        assert_eq!(first.status, WorkflowStatus::ContinuedAsNew);

        let latest = executor.latest_run(id).await.expect("should follow chain");
        let last = executor.workflow_info(latest).await.expect("should load");
        assert_eq!(last.workflow_id, "counter-1");
        assert_eq!(last.input, json!(3));
        assert!(last.continued_from.is_some());
        assert_eq!(executor.store().workflow_count(), 4);
    }

    #[tokio::test]
    async fn test_activity_dispatch() {
        let executor = executor();
        let id = executor
            .start_workflow_by_type("fetch", json!(null), StartWorkflowOptions::new())
            .await
            .expect("should start");

        assert_eq!(executor.store().pending_task_count(), 1);
        assert!(executor.store().has_task(id, 1).await.expect("should check"));
        assert_eq!(executor.get_result(id).await.expect("should load"), None);
    }

    #[tokio::test]
    async fn test_recover_reissues_lost_effects() {
        let executor = executor();
        let id = Uuid::now_v7();
        let now = executor.now();

        // A commit whose task was never enqueued, as after a crash
        executor
            .create_run(NewWorkflowInstance {
                id,
                namespace: "default".to_string(),
                workflow_id: "fetch-1".to_string(),
                workflow_type: "fetch".to_string(),
                task_queue: "default".to_string(),
                input: json!(null),
                parent: None,
                continued_from: None,
                execution_deadline: None,
                created_at: now,
            })
            .await
            .expect("should create");
        executor
            .store()
            .append_events(
                id,
                1,
                now,
                vec![HistoryEvent::ActivityScheduled {
                    seq: 1,
                    activity_type: "fetch".to_string(),
                    task_queue: "default".to_string(),
                    input: json!(null),
                    options: ActivityOptions::start_to_close(Duration::from_secs(30)),
                }],
            )
            .await
            .expect("should append");
        assert!(!executor.store().has_task(id, 1).await.expect("should check"));

        let recovered = executor.recover().await.expect("should recover");

        assert_eq!(recovered, 1);
        assert!(executor.store().has_task(id, 1).await.expect("should check"));
        assert_eq!(executor.store().pending_task_count(), 1);
        assert_eq!(executor.history(id).await.expect("should load").len(), 2);
    }

    #[tokio::test]
    async fn test_too_many_events() {
        let mut executor = WorkflowExecutor::with_config(
            InMemoryWorkflowEventStore::new(),
            ExecutorConfig::default().with_max_events_per_workflow(2),
        );
        executor.register_fn("approval", |ctx: WorkflowContext, _: ()| async move {
            let channel = ctx.signal_channel("ping");
            while channel.recv::<()>().await.is_ok() {}
            Ok::<_, WorkflowError>(())
        });

        let id = executor
            .start_workflow_by_type("approval", json!(null), StartWorkflowOptions::new())
            .await
            .expect("should start");
        executor
            .signal_workflow(id, "ping", json!(null))
            .await
            .expect("first signal fits");

        let result = executor.signal_workflow(id, "ping", json!(null)).await;
        assert!(matches!(result, Err(ExecutorError::TooManyEvents(_, 3, 2))));
    }

    #[test]
    fn test_config_builders() {
        let config = ExecutorConfig::default()
            .with_namespace("checks")
            .with_default_task_queue("background")
            .with_continue_as_new_suggested_after(500);

        assert_eq!(config.namespace, "checks");
        assert_eq!(config.default_task_queue, "background");
        assert_eq!(config.continue_as_new_suggested_after, 500);
        assert_eq!(config.max_events_per_workflow, 10_000);
    }
}
