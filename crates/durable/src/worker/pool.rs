//! Worker pool for activity execution
//!
//! Claims activity tasks from one task queue, runs them with bounded
//! concurrency and reports each attempt back to the executor. The pool
//! also drives the periodic sweeps a host needs: due timers and expired
//! activity deadlines.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::poller::{duration_millis, PollerConfig, PollerError, TaskPoller};
use crate::activity::{ActivityContext, ActivityDescriptor, ActivityRegistry};
use crate::engine::{ActivityOutcome, Clock, WorkflowExecutor};
use crate::persistence::{ClaimedTask, StoreError, WorkflowEventStore};

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Unique worker ID (generated if not provided)
    pub worker_id: String,

    /// Task queue this worker polls
    pub task_queue: String,

    /// Maximum concurrent activity attempts
    pub max_concurrent_tasks: usize,

    pub poller: PollerConfig,

    /// How often running attempts report heartbeats
    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// How often due timers are fired
    #[serde(with = "duration_millis")]
    pub timer_interval: Duration,

    /// How often expired activity deadlines are swept
    #[serde(with = "duration_millis")]
    pub timeout_sweep_interval: Duration,

    /// Graceful shutdown timeout
    #[serde(with = "duration_millis")]
    pub shutdown_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            task_queue: "default".to_string(),
            max_concurrent_tasks: 10,
            poller: PollerConfig::default(),
            heartbeat_interval: Duration::from_secs(5),
            timer_interval: Duration::from_millis(250),
            timeout_sweep_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max.max(1);
        self
    }

    /// Poll interval while tasks keep arriving
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poller.min_interval = interval;
        self
    }

    /// Poll interval ceiling while the queue is idle
    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.poller.max_interval = interval;
        self
    }

    pub fn with_poller(mut self, config: PollerConfig) -> Self {
        self.poller = config;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_timer_interval(mut self, interval: Duration) -> Self {
        self.timer_interval = interval;
        self
    }

    pub fn with_timeout_sweep_interval(mut self, interval: Duration) -> Self {
        self.timeout_sweep_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Worker pool status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPoolStatus {
    /// Worker is running and accepting tasks
    Running,
    /// Worker is draining (completing current tasks, not accepting new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker pool errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerPoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("poller error: {0}")]
    Poller(#[from] PollerError),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("graceful shutdown timed out")]
    ShutdownTimeout,
}

/// Worker pool executing activities for one task queue
///
/// # Example
///
/// ```ignore
/// use durable_replay::worker::{WorkerPool, WorkerPoolConfig};
///
/// let mut activities = ActivityRegistry::new();
/// activities.register(SsnTrace::new(client));
///
/// let pool = WorkerPool::new(executor, activities, WorkerPoolConfig::new("background-checks"));
/// pool.start()?;
///
/// // ... later, graceful shutdown
/// pool.shutdown().await?;
/// ```
pub struct WorkerPool<S: WorkflowEventStore> {
    executor: Arc<WorkflowExecutor<S>>,
    activities: Arc<ActivityRegistry>,
    config: WorkerPoolConfig,
    shutdown_tx: watch::Sender<bool>,
    status: RwLock<WorkerPoolStatus>,
    active_tasks: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl<S: WorkflowEventStore> WorkerPool<S> {
    pub fn new(
        executor: Arc<WorkflowExecutor<S>>,
        activities: ActivityRegistry,
        config: WorkerPoolConfig,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            executor,
            activities: Arc::new(activities),
            active_tasks: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            shutdown_tx,
            status: RwLock::new(WorkerPoolStatus::Stopped),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start polling and the periodic sweeps
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub fn start(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status != WorkerPoolStatus::Stopped {
                return Err(WorkerPoolError::AlreadyRunning);
            }
            *status = WorkerPoolStatus::Running;
        }

        info!(
            worker_id = %self.config.worker_id,
            task_queue = %self.config.task_queue,
            activity_types = ?self.activities.activity_types(),
            max_concurrent_tasks = self.config.max_concurrent_tasks,
            "starting worker pool"
        );
        self.shutdown_tx.send_replace(false);

        let mut handles = self.handles.lock();
        if !self.activities.is_empty() {
            handles.push(self.start_poll_loop());
        }
        handles.push(self.start_timer_loop());
        handles.push(self.start_timeout_sweep_loop());

        Ok(())
    }

    /// Stop claiming tasks and wait for running attempts to finish
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn shutdown(&self) -> Result<(), WorkerPoolError> {
        {
            let mut status = self.status.write();
            if *status == WorkerPoolStatus::Stopped {
                return Ok(());
            }
            *status = WorkerPoolStatus::Draining;
        }

        info!(worker_id = %self.config.worker_id, "initiating graceful shutdown");
        self.shutdown_tx.send_replace(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background loop ended abnormally");
            }
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            let available = self.active_tasks.available_permits();
            if available == self.config.max_concurrent_tasks {
                debug!("all tasks completed");
                break;
            }

            if tokio::time::Instant::now() >= deadline {
                warn!(
                    remaining_tasks = self.config.max_concurrent_tasks - available,
                    "shutdown timeout reached"
                );
                *self.status.write() = WorkerPoolStatus::Stopped;
                return Err(WorkerPoolError::ShutdownTimeout);
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        *self.status.write() = WorkerPoolStatus::Stopped;
        info!(worker_id = %self.config.worker_id, "worker pool stopped");
        Ok(())
    }

    pub fn status(&self) -> WorkerPoolStatus {
        *self.status.read()
    }

    /// Number of attempts currently running
    pub fn current_load(&self) -> usize {
        self.config.max_concurrent_tasks - self.active_tasks.available_permits()
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    fn start_poll_loop(&self) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let activities = Arc::clone(&self.activities);
        let config = self.config.clone();
        let active_tasks = Arc::clone(&self.active_tasks);

        let mut poller = TaskPoller::new(
            executor.shared_store(),
            executor.clock(),
            config.worker_id.clone(),
            config.task_queue.clone(),
            activities.activity_types(),
            config.poller.clone(),
            self.shutdown_tx.subscribe(),
        );

        tokio::spawn(async move {
            loop {
                if poller.is_shutdown() {
                    debug!("poll loop: shutdown requested");
                    break;
                }

                let available_slots = active_tasks.available_permits();
                if available_slots > 0 {
                    match poller.poll(available_slots).await {
                        Ok(tasks) => {
                            for task in tasks {
                                let Some(descriptor) = activities.get(&task.activity_type).cloned()
                                else {
                                    warn!(activity_type = %task.activity_type, "no activity registered");
                                    continue;
                                };
                                let Ok(permit) = Arc::clone(&active_tasks).try_acquire_owned() else {
                                    warn!(task_id = %task.id, "claimed more tasks than permits");
                                    break;
                                };

                                let executor = Arc::clone(&executor);
                                let heartbeat_interval = config.heartbeat_interval;
                                tokio::spawn(async move {
                                    let outcome = run_attempt(
                                        executor.shared_store(),
                                        executor.clock(),
                                        &descriptor,
                                        &task,
                                        Some(heartbeat_interval),
                                    )
                                    .await;

                                    if let Err(e) =
                                        executor.report_activity_outcome(&task, outcome).await
                                    {
                                        error!(task_id = %task.id, error = %e, "failed to report activity outcome");
                                    }
                                    drop(permit);
                                });
                            }
                        }
                        Err(e) => error!(error = %e, "poll error"),
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("poll loop exited");
        })
    }

    fn start_timer_loop(&self) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let interval = self.config.timer_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = executor.fire_due_timers().await {
                            error!(error = %e, "timer sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("timer loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn start_timeout_sweep_loop(&self) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let interval = self.config.timeout_sweep_interval;
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match executor.sweep_activity_timeouts().await {
                            Ok(0) => {}
                            Ok(count) => info!(count, "timed out abandoned activities"),
                            Err(e) => error!(error = %e, "activity timeout sweep failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("timeout sweep loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

/// Run one attempt of a claimed task, bounded by its deadlines.
///
/// With a heartbeat interval, recorded heartbeats are forwarded to the
/// store and a `should_cancel` response cancels the attempt's token.
pub(crate) async fn run_attempt<S: WorkflowEventStore>(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    descriptor: &ActivityDescriptor,
    task: &ClaimedTask,
    heartbeat_interval: Option<Duration>,
) -> ActivityOutcome {
    let policy = task.options.effective_retry_policy();
    let ctx = ActivityContext::new(
        task.id,
        task.instance_id,
        task.seq,
        task.activity_type.clone(),
        task.attempt,
        policy.max_attempts,
    );
    let token = ctx.cancellation_token();
    let limit = task.deadlines().attempt_limit(clock.now());

    let heartbeats = heartbeat_interval
        .map(|interval| spawn_heartbeats(store, Arc::clone(&clock), ctx.clone(), interval));

    let invocation = descriptor.invoke(ctx, task.input.clone());
    let outcome = match limit {
        Some((limit, timeout_type)) => match tokio::time::timeout(limit, invocation).await {
            Ok(result) => into_outcome(result),
            Err(_) => {
                token.cancel();
                ActivityOutcome::TimedOut(timeout_type)
            }
        },
        None => into_outcome(invocation.await),
    };

    if let Some(heartbeats) = heartbeats {
        heartbeats.abort();
    }
    outcome
}

fn into_outcome(
    result: Result<serde_json::Value, crate::activity::ActivityError>,
) -> ActivityOutcome {
    match result {
        Ok(value) => ActivityOutcome::Completed(value),
        Err(error) => ActivityOutcome::Failed(error),
    }
}

fn spawn_heartbeats<S: WorkflowEventStore>(
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ctx: ActivityContext,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match store
                .heartbeat_task(ctx.task_id, ctx.take_heartbeat(), clock.now())
                .await
            {
                Ok(response) if response.should_cancel => {
                    info!(task_id = %ctx.task_id, "activity cancellation requested");
                    ctx.cancellation_token().cancel();
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!(task_id = %ctx.task_id, error = %e, "heartbeat failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::activity::ActivityError;
    use crate::engine::StartWorkflowOptions;
    use crate::persistence::InMemoryWorkflowEventStore;
    use crate::workflow::{ActivityOptions, WorkflowContext, WorkflowError};

    #[test]
    fn test_config_builder() {
        let config = WorkerPoolConfig::new("checks")
            .with_worker_id("test-worker")
            .with_max_concurrent_tasks(0)
            .with_poll_interval(Duration::from_millis(10))
            .with_max_poll_interval(Duration::from_millis(50))
            .with_heartbeat_interval(Duration::from_secs(10));

        assert_eq!(config.worker_id, "test-worker");
        assert_eq!(config.task_queue, "checks");
        assert_eq!(config.max_concurrent_tasks, 1);
        assert_eq!(config.poller.min_interval, Duration::from_millis(10));
        assert_eq!(config.poller.max_interval, Duration::from_millis(50));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn test_default_config() {
        let config = WorkerPoolConfig::default();
        assert!(config.worker_id.starts_with("worker-"));
        assert_eq!(config.task_queue, "default");
        assert_eq!(config.max_concurrent_tasks, 10);
    }

    fn executor() -> Arc<WorkflowExecutor<InMemoryWorkflowEventStore>> {
        let mut executor = WorkflowExecutor::new(InMemoryWorkflowEventStore::new());
        executor.register_fn("shout", |ctx: WorkflowContext, word: String| async move {
            let options = ActivityOptions::start_to_close(Duration::from_secs(5));
            let loud: String = ctx.execute_activity("uppercase", &word, options).await?;
            Ok::<_, WorkflowError>(loud)
        });
        Arc::new(executor)
    }

    fn activities() -> ActivityRegistry {
        let mut activities = ActivityRegistry::new();
        activities.register_fn("uppercase", |_ctx, word: String| async move {
            Ok::<_, ActivityError>(word.to_uppercase())
        });
        activities
    }

    #[tokio::test]
    async fn test_pool_runs_activities_end_to_end() {
        let executor = executor();
        let config = WorkerPoolConfig::new("default")
            .with_poll_interval(Duration::from_millis(10))
            .with_max_poll_interval(Duration::from_millis(20));
        let pool = WorkerPool::new(Arc::clone(&executor), activities(), config);
        pool.start().expect("should start");
        assert!(matches!(pool.start(), Err(WorkerPoolError::AlreadyRunning)));

        let id = executor
            .start_workflow_by_type("shout", json!("pass"), StartWorkflowOptions::new())
            .await
            .expect("should start");

        let result = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(result) = executor.get_result(id).await.expect("should load") {
                    return result;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("workflow should finish");

        assert_eq!(result, Ok(json!("PASS")));

        pool.shutdown().await.expect("should shut down");
        assert_eq!(pool.status(), WorkerPoolStatus::Stopped);
        assert_eq!(pool.current_load(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_exceeding_start_to_close_times_out() {
        let mut activities = ActivityRegistry::new();
        activities.register_fn("hang", |_ctx, _: ()| async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ActivityError>(())
        });
        let descriptor = activities.get("hang").cloned().expect("should be registered");

        let now = chrono::Utc::now();
        let task = ClaimedTask {
            id: Uuid::now_v7(),
            instance_id: Uuid::now_v7(),
            seq: 1,
            activity_type: "hang".to_string(),
            task_queue: "default".to_string(),
            input: json!(null),
            options: ActivityOptions::start_to_close(Duration::from_secs(1)),
            attempt: 1,
            scheduled_at: now,
            started_at: now,
        };

        let outcome = run_attempt(
            Arc::new(InMemoryWorkflowEventStore::new()),
            Arc::new(crate::engine::SystemClock),
            &descriptor,
            &task,
            None,
        )
        .await;

        assert_eq!(
            outcome,
            ActivityOutcome::TimedOut(crate::reliability::TimeoutType::StartToClose)
        );
    }
}
