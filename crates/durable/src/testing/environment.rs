//! Time-skipping test environment
//!
//! Runs workflows and their activities in-process on an
//! [`InMemoryWorkflowEventStore`] with a [`ManualClock`]. Whenever every
//! run is blocked, [`TestEnvironment::sleep`] jumps the clock straight to
//! the next timer, retry or execution deadline, so a workflow that waits
//! for a week finishes in milliseconds.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::activity::{Activity, ActivityContext, ActivityError, ActivityRegistry};
use crate::engine::{
    ActivityOutcome, Clock, ExecutorConfig, ExecutorError, ManualClock, ProcessResult,
    StartWorkflowOptions, WorkflowExecutor,
};
use crate::persistence::{InMemoryWorkflowEventStore, WorkflowEventStore, WorkflowInfo};
use crate::worker::run_attempt;
use crate::workflow::{EventRecord, Workflow, WorkflowContext, WorkflowError};

const TEST_WORKER_ID: &str = "test-environment";

/// Tasks claimed per queue and pass
const CLAIM_BATCH: usize = 64;

/// Bound on passes without the clock moving; a workflow that keeps
/// scheduling zero-delay work forever trips it
const MAX_IDLE_PASSES: usize = 10_000;

/// In-process workflow runtime with a controllable clock
///
/// # Example
///
/// ```ignore
/// let mut env = TestEnvironment::new();
/// env.register_workflow::<BackgroundCheck>();
/// env.register_activity_fn("ssn_trace", |_ctx, ssn: String| async move {
///     Ok::<_, ActivityError>(if ssn == "555-55-5555" { "pass" } else { "fail" })
/// });
///
/// let result = env
///     .execute_workflow::<BackgroundCheck>(&"555-55-5555".to_string())
///     .await?;
/// assert_eq!(result?, "pass");
/// ```
pub struct TestEnvironment {
    executor: WorkflowExecutor<InMemoryWorkflowEventStore>,
    activities: ActivityRegistry,
    clock: Arc<ManualClock>,
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnvironment {
    /// Environment whose clock starts at the Unix epoch
    pub fn new() -> Self {
        Self::starting_at(DateTime::UNIX_EPOCH)
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self::with_config(start, ExecutorConfig::default())
    }

    pub fn with_config(start: DateTime<Utc>, config: ExecutorConfig) -> Self {
        let clock = Arc::new(ManualClock::new(start));
        let executor = WorkflowExecutor::with_config(InMemoryWorkflowEventStore::new(), config)
            .with_clock(Arc::clone(&clock) as Arc<dyn Clock>);
        Self {
            executor,
            activities: ActivityRegistry::new(),
            clock,
        }
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register_workflow<W: Workflow>(&mut self) -> &mut Self {
        self.executor.register::<W>();
        self
    }

    pub fn register_workflow_fn<I, O, F, Fut>(&mut self, workflow_type: &str, f: F) -> &mut Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, WorkflowError>> + 'static,
    {
        self.executor.register_fn(workflow_type, f);
        self
    }

    pub fn register_activity<A: Activity>(&mut self, activity: A) -> &mut Self {
        self.activities.register(activity);
        self
    }

    pub fn register_activity_fn<I, O, F, Fut>(&mut self, activity_type: &str, f: F) -> &mut Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        self.activities.register_fn(activity_type, f);
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn executor(&self) -> &WorkflowExecutor<InMemoryWorkflowEventStore> {
        &self.executor
    }

    pub fn store(&self) -> &InMemoryWorkflowEventStore {
        self.executor.store()
    }

    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // =========================================================================
    // Driving Workflows
    // =========================================================================

    /// Start a workflow and run everything it triggers without moving time
    pub async fn start_workflow<W: Workflow>(
        &self,
        input: &W::Input,
        options: StartWorkflowOptions,
    ) -> Result<Uuid, ExecutorError> {
        let instance_id = self.executor.start_workflow::<W>(input, options).await?;
        self.run_until_idle().await?;
        Ok(instance_id)
    }

    pub async fn start_workflow_by_type(
        &self,
        workflow_type: &str,
        input: serde_json::Value,
        options: StartWorkflowOptions,
    ) -> Result<Uuid, ExecutorError> {
        let instance_id = self
            .executor
            .start_workflow_by_type(workflow_type, input, options)
            .await?;
        self.run_until_idle().await?;
        Ok(instance_id)
    }

    /// Start a workflow and skip time until it closes.
    ///
    /// The outer error reports engine failures; the inner one is the
    /// workflow's own failure.
    pub async fn execute_workflow<W: Workflow>(
        &self,
        input: &W::Input,
    ) -> Result<Result<W::Output, WorkflowError>, ExecutorError> {
        let instance_id = self
            .start_workflow::<W>(input, StartWorkflowOptions::new())
            .await?;
        match self.wait_for_result(instance_id).await? {
            Some(Ok(value)) => Ok(Ok(serde_json::from_value(value)?)),
            Some(Err(err)) => Ok(Err(err)),
            None => Err(ExecutorError::Configuration(format!(
                "workflow {instance_id} is blocked with nothing scheduled to wake it"
            ))),
        }
    }

    /// Run timers, timeouts and activities that are due now, repeatedly,
    /// until a pass makes no progress
    #[instrument(skip(self))]
    pub async fn run_until_idle(&self) -> Result<(), ExecutorError> {
        for _ in 0..MAX_IDLE_PASSES {
            let mut progressed = self.executor.fire_due_timers().await? > 0;
            progressed |= self.executor.sweep_activity_timeouts().await? > 0;
            progressed |= self.run_pending_activities().await? > 0;
            if !progressed {
                return Ok(());
            }
        }
        Err(ExecutorError::Configuration(format!(
            "no quiescence after {MAX_IDLE_PASSES} passes at {}",
            self.clock.now()
        )))
    }

    /// Advance the clock by `duration`, stopping at every wakeup on the way
    #[instrument(skip(self))]
    pub async fn sleep(&self, duration: Duration) -> Result<(), ExecutorError> {
        let target = self.clock.now() + crate::reliability::chrono_duration(duration);
        loop {
            self.run_until_idle().await?;
            let now = self.clock.now();
            match self.store().next_wakeup(now).await? {
                Some(at) if at > now && at <= target => {
                    debug!(%at, "skipping to next wakeup");
                    self.clock.set(at);
                }
                _ => break,
            }
        }
        self.clock.set(target);
        self.run_until_idle().await
    }

    /// Skip time until the run chain starting at `instance_id` closes.
    ///
    /// Returns `None` when the run is still open and nothing is scheduled
    /// to wake it, e.g. it waits for a signal.
    pub async fn wait_for_result(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<Result<serde_json::Value, WorkflowError>>, ExecutorError> {
        loop {
            self.run_until_idle().await?;
            if let Some(result) = self.executor.get_result(instance_id).await? {
                return Ok(Some(result));
            }

            let now = self.clock.now();
            match self.store().next_wakeup(now).await? {
                Some(at) if at > now => self.clock.set(at),
                _ => return Ok(None),
            }
        }
    }

    // =========================================================================
    // Client Operations
    // =========================================================================

    pub async fn signal<T: Serialize + ?Sized>(
        &self,
        instance_id: Uuid,
        signal_name: &str,
        payload: &T,
    ) -> Result<ProcessResult, ExecutorError> {
        let payload = serde_json::to_value(payload)?;
        let run = self.executor.latest_run(instance_id).await?;
        let result = self
            .executor
            .signal_workflow(run, signal_name, payload)
            .await?;
        self.run_until_idle().await?;
        Ok(result)
    }

    pub async fn query<T: DeserializeOwned>(
        &self,
        instance_id: Uuid,
        query: &str,
    ) -> Result<T, ExecutorError> {
        let run = self.executor.latest_run(instance_id).await?;
        let value = self.executor.query_workflow(run, query).await?;
        Ok(serde_json::from_value(value)?)
    }

    pub async fn cancel(&self, instance_id: Uuid, reason: &str) -> Result<(), ExecutorError> {
        let run = self.executor.latest_run(instance_id).await?;
        self.executor.cancel_workflow(run, reason).await?;
        self.run_until_idle().await
    }

    pub async fn get_result(
        &self,
        instance_id: Uuid,
    ) -> Result<Option<Result<serde_json::Value, WorkflowError>>, ExecutorError> {
        self.executor.get_result(instance_id).await
    }

    pub async fn history(&self, instance_id: Uuid) -> Result<Vec<EventRecord>, ExecutorError> {
        self.executor.history(instance_id).await
    }

    /// Event names of a run's history, in order
    pub async fn event_names(&self, instance_id: Uuid) -> Result<Vec<&'static str>, ExecutorError> {
        Ok(self
            .history(instance_id)
            .await?
            .iter()
            .map(|record| record.event.name())
            .collect())
    }

    pub async fn workflow_info(&self, instance_id: Uuid) -> Result<WorkflowInfo, ExecutorError> {
        self.executor.workflow_info(instance_id).await
    }

    /// Claim and run every visible task with a registered handler.
    ///
    /// Attempts run one at a time; the clock advances by the tokio time
    /// each attempt took, so paused-time tests observe their timeouts.
    async fn run_pending_activities(&self) -> Result<usize, ExecutorError> {
        let activity_types = self.activities.activity_types();
        if activity_types.is_empty() {
            return Ok(0);
        }

        let mut ran = 0;
        for task_queue in self.store().pending_task_queues() {
            let tasks = self
                .store()
                .claim_tasks(
                    TEST_WORKER_ID,
                    &task_queue,
                    &activity_types,
                    CLAIM_BATCH,
                    self.clock.now(),
                )
                .await?;

            for task in tasks {
                let Some(descriptor) = self.activities.get(&task.activity_type) else {
                    continue;
                };
                let started = tokio::time::Instant::now();
                let outcome: ActivityOutcome = run_attempt(
                    self.executor.shared_store(),
                    self.executor.clock(),
                    descriptor,
                    &task,
                    None,
                )
                .await;
                self.clock.advance(started.elapsed());

                self.executor.report_activity_outcome(&task, outcome).await?;
                ran += 1;
            }
        }
        Ok(ran)
    }
}

impl std::fmt::Debug for TestEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnvironment")
            .field("now", &self.clock.now())
            .field("workflows", &self.executor.workflows())
            .field("activities", &self.activities)
            .finish()
    }
}
