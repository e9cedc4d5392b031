//! In-memory implementation of WorkflowEventStore for testing

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::reliability::ActivityDeadlines;
use crate::workflow::{EventRecord, HistoryEvent, WorkflowSignal};

struct WorkflowState {
    info: WorkflowInfo,
    events: Vec<EventRecord>,
    signals: Vec<WorkflowSignal>,
}

struct TaskState {
    definition: TaskDefinition,
    status: TaskStatus,
    attempt: u32,
    visible_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    cancel_requested: bool,
    last_heartbeat: Option<serde_json::Value>,
    last_error: Option<String>,
    enqueue_order: u64,
}

impl TaskState {
    fn deadlines(&self) -> ActivityDeadlines {
        ActivityDeadlines {
            scheduled_at: self.definition.scheduled_at,
            started_at: self.started_at,
            start_to_close: self.definition.options.start_to_close_timeout,
            schedule_to_close: self.definition.options.schedule_to_close_timeout,
        }
    }
}

/// In-memory implementation of WorkflowEventStore
///
/// Stores everything behind `parking_lot` locks and provides the same
/// semantics as the PostgreSQL implementation. Used by the test
/// environment and by the worker when no database is configured.
///
/// # Example
///
/// ```
/// use durable_replay::InMemoryWorkflowEventStore;
///
/// let store = InMemoryWorkflowEventStore::new();
/// assert_eq!(store.workflow_count(), 0);
/// ```
pub struct InMemoryWorkflowEventStore {
    workflows: RwLock<HashMap<Uuid, WorkflowState>>,
    tasks: RwLock<HashMap<Uuid, TaskState>>,
    /// Keyed by (instance, seq)
    timers: RwLock<BTreeMap<(Uuid, u32), TimerDefinition>>,
    enqueue_counter: AtomicU64,
}

impl InMemoryWorkflowEventStore {
    pub fn new() -> Self {
        Self {
            workflows: RwLock::new(HashMap::new()),
            tasks: RwLock::new(HashMap::new()),
            timers: RwLock::new(BTreeMap::new()),
            enqueue_counter: AtomicU64::new(0),
        }
    }

    pub fn workflow_count(&self) -> usize {
        self.workflows.read().len()
    }

    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .count()
    }

    /// Task queues holding pending tasks, sorted
    pub fn pending_task_queues(&self) -> Vec<String> {
        let mut queues: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending)
            .map(|t| t.definition.task_queue.clone())
            .collect();
        queues.sort_unstable();
        queues.dedup();
        queues
    }

    pub fn timer_count(&self) -> usize {
        self.timers.read().len()
    }

    /// Status of the task for `(instance_id, seq)`, if any
    pub fn task_status(&self, instance_id: Uuid, seq: u32) -> Option<TaskStatus> {
        self.tasks
            .read()
            .values()
            .find(|t| t.definition.instance_id == instance_id && t.definition.seq == seq)
            .map(|t| t.status)
    }

    /// Latest heartbeat details for `task_id`
    pub fn last_heartbeat(&self, task_id: Uuid) -> Option<serde_json::Value> {
        self.tasks
            .read()
            .get(&task_id)
            .and_then(|t| t.last_heartbeat.clone())
    }

    pub fn clear(&self) {
        self.workflows.write().clear();
        self.tasks.write().clear();
        self.timers.write().clear();
    }
}

impl Default for InMemoryWorkflowEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkflowEventStore for InMemoryWorkflowEventStore {
    async fn create_workflow(&self, workflow: NewWorkflowInstance) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        if workflows.contains_key(&workflow.id) {
            return Err(StoreError::Database(format!(
                "workflow already exists: {}",
                workflow.id
            )));
        }
        workflows.insert(
            workflow.id,
            WorkflowState {
                info: workflow.into(),
                events: vec![],
                signals: vec![],
            },
        );
        Ok(())
    }

    async fn get_workflow_info(&self, instance_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        self.workflows
            .read()
            .get(&instance_id)
            .map(|w| w.info.clone())
            .ok_or(StoreError::WorkflowNotFound(instance_id))
    }

    async fn update_workflow_status(
        &self,
        instance_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&instance_id)
            .ok_or(StoreError::WorkflowNotFound(instance_id))?;

        workflow.info.status = status;
        workflow.info.result = result;
        workflow.info.error = error;
        if status.is_terminal() {
            workflow.info.closed_at = Some(at);
        }
        Ok(())
    }

    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInfo>, StoreError> {
        let mut infos: Vec<_> = self
            .workflows
            .read()
            .values()
            .filter(|w| status.map_or(true, |s| w.info.status == s))
            .map(|w| w.info.clone())
            .collect();
        infos.sort_by_key(|info| (info.created_at, info.id));
        Ok(infos)
    }

    async fn expired_workflows(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .filter(|w| w.info.status == WorkflowStatus::Running)
            .filter(|w| w.info.execution_deadline.is_some_and(|d| d <= now))
            .map(|w| w.info.id)
            .collect())
    }

    async fn append_events(
        &self,
        instance_id: Uuid,
        expected_sequence: i64,
        recorded_at: DateTime<Utc>,
        events: Vec<HistoryEvent>,
    ) -> Result<i64, StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&instance_id)
            .ok_or(StoreError::WorkflowNotFound(instance_id))?;

        let actual = workflow.events.len() as i64;
        if actual != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual,
            });
        }

        for (offset, event) in events.into_iter().enumerate() {
            workflow.events.push(EventRecord {
                sequence: expected_sequence + offset as i64,
                recorded_at,
                event,
            });
        }

        Ok(workflow.events.len() as i64)
    }

    fn read_from(
        &self,
        instance_id: Uuid,
        from_sequence: i64,
    ) -> BoxStream<'_, Result<EventRecord, StoreError>> {
        let snapshot = match self.workflows.read().get(&instance_id) {
            Some(workflow) => workflow
                .events
                .iter()
                .filter(|r| r.sequence >= from_sequence)
                .cloned()
                .map(Ok)
                .collect::<Vec<_>>(),
            None => vec![Err(StoreError::WorkflowNotFound(instance_id))],
        };
        stream::iter(snapshot).boxed()
    }

    async fn next_sequence(&self, instance_id: Uuid) -> Result<i64, StoreError> {
        self.workflows
            .read()
            .get(&instance_id)
            .map(|w| w.events.len() as i64)
            .ok_or(StoreError::WorkflowNotFound(instance_id))
    }

    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let mut tasks = self.tasks.write();
        if let Some((id, _)) = tasks.iter().find(|(_, t)| {
            t.definition.instance_id == task.instance_id && t.definition.seq == task.seq
        }) {
            return Ok(*id);
        }

        let task_id = Uuid::now_v7();
        tasks.insert(
            task_id,
            TaskState {
                visible_at: task.scheduled_at,
                definition: task,
                status: TaskStatus::Pending,
                attempt: 0,
                started_at: None,
                claimed_by: None,
                cancel_requested: false,
                last_heartbeat: None,
                last_error: None,
                enqueue_order: self.enqueue_counter.fetch_add(1, Ordering::Relaxed),
            },
        );
        Ok(task_id)
    }

    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let mut tasks = self.tasks.write();

        let mut candidates: Vec<(DateTime<Utc>, u64, Uuid)> = tasks
            .iter()
            .filter(|(_, t)| {
                t.status == TaskStatus::Pending
                    && t.visible_at <= now
                    && t.definition.task_queue == task_queue
                    && (activity_types.is_empty()
                        || activity_types.contains(&t.definition.activity_type))
            })
            .map(|(id, t)| (t.visible_at, t.enqueue_order, *id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, _, task_id) in candidates.into_iter().take(max_tasks) {
            let Some(task) = tasks.get_mut(&task_id) else {
                continue;
            };
            task.status = TaskStatus::Claimed;
            task.attempt += 1;
            task.started_at = Some(now);
            task.claimed_by = Some(worker_id.to_string());

            claimed.push(ClaimedTask {
                id: task_id,
                instance_id: task.definition.instance_id,
                seq: task.definition.seq,
                activity_type: task.definition.activity_type.clone(),
                task_queue: task.definition.task_queue.clone(),
                input: task.definition.input.clone(),
                options: task.definition.options.clone(),
                attempt: task.attempt,
                scheduled_at: task.definition.scheduled_at,
                started_at: now,
            });
        }

        Ok(claimed)
    }

    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        details: Option<serde_json::Value>,
        _now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if details.is_some() {
            task.last_heartbeat = details;
        }
        Ok(HeartbeatResponse {
            should_cancel: task.cancel_requested || !task.status.is_active(),
        })
    }

    async fn retry_task(
        &self,
        task_id: Uuid,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if task.status == TaskStatus::Claimed {
            task.status = TaskStatus::Pending;
            task.visible_at = visible_at;
            task.started_at = None;
            task.claimed_by = None;
            task.last_error = Some(error.to_string());
        }
        Ok(())
    }

    async fn finish_task(&self, task_id: Uuid, status: TaskStatus) -> Result<bool, StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;

        if !task.status.is_active() || task.cancel_requested {
            return Ok(false);
        }
        task.status = status;
        Ok(true)
    }

    async fn expired_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>, StoreError> {
        let mut expired: Vec<_> = self
            .tasks
            .read()
            .iter()
            .filter(|(_, t)| t.status.is_active() && !t.cancel_requested)
            .filter_map(|(id, t)| {
                t.deadlines().expired(now).map(|timeout_type| ExpiredTask {
                    id: *id,
                    instance_id: t.definition.instance_id,
                    seq: t.definition.seq,
                    attempt: t.attempt.max(1),
                    timeout_type,
                })
            })
            .collect();
        expired.sort_by_key(|t| t.id);
        Ok(expired)
    }

    async fn cancel_workflow_tasks(&self, instance_id: Uuid) -> Result<usize, StoreError> {
        let mut tasks = self.tasks.write();
        let mut count = 0;
        for task in tasks
            .values_mut()
            .filter(|t| t.definition.instance_id == instance_id && t.status.is_active())
        {
            match task.status {
                TaskStatus::Pending => task.status = TaskStatus::Canceled,
                _ => task.cancel_requested = true,
            }
            count += 1;
        }
        Ok(count)
    }

    async fn has_task(&self, instance_id: Uuid, seq: u32) -> Result<bool, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .any(|t| t.definition.instance_id == instance_id && t.definition.seq == seq))
    }

    async fn schedule_timer(&self, timer: TimerDefinition) -> Result<(), StoreError> {
        self.timers
            .write()
            .entry((timer.instance_id, timer.seq))
            .or_insert(timer);
        Ok(())
    }

    async fn remove_timer(&self, instance_id: Uuid, seq: u32) -> Result<bool, StoreError> {
        Ok(self.timers.write().remove(&(instance_id, seq)).is_some())
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerDefinition>, StoreError> {
        let mut due: Vec<_> = self
            .timers
            .read()
            .values()
            .filter(|t| t.fire_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|t| (t.fire_at, t.started_sequence, t.instance_id));
        due.truncate(limit);
        Ok(due)
    }

    async fn cancel_workflow_timers(&self, instance_id: Uuid) -> Result<usize, StoreError> {
        let mut timers = self.timers.write();
        let before = timers.len();
        timers.retain(|(owner, _), _| *owner != instance_id);
        Ok(before - timers.len())
    }

    async fn next_wakeup(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let timer = self.timers.read().values().map(|t| t.fire_at).min();
        let retry = self
            .tasks
            .read()
            .values()
            .filter(|t| t.status == TaskStatus::Pending && t.visible_at > after)
            .map(|t| t.visible_at)
            .min();
        let deadline = self
            .workflows
            .read()
            .values()
            .filter(|w| w.info.status == WorkflowStatus::Running)
            .filter_map(|w| w.info.execution_deadline)
            .min();

        Ok([timer, retry, deadline].into_iter().flatten().min())
    }

    async fn send_signal(
        &self,
        instance_id: Uuid,
        signal: WorkflowSignal,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&instance_id)
            .ok_or(StoreError::WorkflowNotFound(instance_id))?;
        workflow.signals.push(signal);
        Ok(())
    }

    async fn get_pending_signals(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowSignal>, StoreError> {
        self.workflows
            .read()
            .get(&instance_id)
            .map(|w| w.signals.clone())
            .ok_or(StoreError::WorkflowNotFound(instance_id))
    }

    async fn mark_signals_processed(
        &self,
        instance_id: Uuid,
        count: usize,
    ) -> Result<(), StoreError> {
        let mut workflows = self.workflows.write();
        let workflow = workflows
            .get_mut(&instance_id)
            .ok_or(StoreError::WorkflowNotFound(instance_id))?;
        let count = count.min(workflow.signals.len());
        workflow.signals.drain(..count);
        Ok(())
    }
}
