//! PostgreSQL implementation of WorkflowEventStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency on history appends (instance row lock + length check)
//! - Task claiming with SKIP LOCKED
//! - Idempotent task and timer registration keyed by `(instance_id, seq)`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::reliability::ActivityDeadlines;
use crate::workflow::{ActivityOptions, EventRecord, HistoryEvent, ParentLink, WorkflowSignal};

/// PostgreSQL implementation of WorkflowEventStore
///
/// # Example
///
/// ```ignore
/// use durable_replay::PostgresWorkflowEventStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/durable").await?;
/// let store = PostgresWorkflowEventStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowEventStore {
    pool: PgPool,
}

impl PostgresWorkflowEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` with a pool of `max_connections`
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| db_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn task_exists(&self, task_id: Uuid) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM durable_task_queue WHERE id = $1) AS found")
            .bind(task_id)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| db_error("check task", e))?;
        Ok(row.get("found"))
    }
}

fn db_error(operation: &str, e: sqlx::Error) -> StoreError {
    error!("Failed to {}: {}", operation, e);
    StoreError::Database(e.to_string())
}

fn millis(duration: Option<std::time::Duration>) -> Option<i64> {
    duration.map(|d| d.as_millis() as i64)
}

fn workflow_info_from_row(row: &PgRow) -> Result<WorkflowInfo, StoreError> {
    let status: String = row.get("status");
    let parent_instance_id: Option<Uuid> = row.get("parent_instance_id");
    let parent_seq: Option<i32> = row.get("parent_seq");

    Ok(WorkflowInfo {
        id: row.get("id"),
        namespace: row.get("namespace"),
        workflow_id: row.get("workflow_id"),
        workflow_type: row.get("workflow_type"),
        task_queue: row.get("task_queue"),
        status: status.parse()?,
        input: row.get("input"),
        result: row.get("result"),
        error: row.get("error"),
        parent: parent_instance_id
            .zip(parent_seq)
            .map(|(instance_id, seq)| ParentLink {
                instance_id,
                seq: seq as u32,
            }),
        continued_from: row.get("continued_from"),
        execution_deadline: row.get("execution_deadline"),
        created_at: row.get("created_at"),
        closed_at: row.get("closed_at"),
    })
}

fn event_record_from_row(row: &PgRow) -> Result<EventRecord, StoreError> {
    let data: serde_json::Value = row.get("event_data");
    Ok(EventRecord {
        sequence: row.get("sequence_num"),
        recorded_at: row.get("recorded_at"),
        event: serde_json::from_value(data)?,
    })
}

fn timer_from_row(row: &PgRow) -> TimerDefinition {
    TimerDefinition {
        instance_id: row.get("instance_id"),
        seq: row.get::<i32, _>("seq") as u32,
        fire_at: row.get("fire_at"),
        started_sequence: row.get("started_sequence"),
    }
}

const WORKFLOW_COLUMNS: &str = "id, namespace, workflow_id, workflow_type, task_queue, status, \
     input, result, error, parent_instance_id, parent_seq, continued_from, \
     execution_deadline, created_at, closed_at";

#[async_trait]
impl WorkflowEventStore for PostgresWorkflowEventStore {
    #[instrument(skip(self, workflow), fields(instance_id = %workflow.id))]
    async fn create_workflow(&self, workflow: NewWorkflowInstance) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_workflow_instances (
                id, namespace, workflow_id, workflow_type, task_queue, status, input,
                parent_instance_id, parent_seq, continued_from, execution_deadline, created_at
            )
            VALUES ($1, $2, $3, $4, $5, 'running', $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(workflow.id)
        .bind(&workflow.namespace)
        .bind(&workflow.workflow_id)
        .bind(&workflow.workflow_type)
        .bind(&workflow.task_queue)
        .bind(&workflow.input)
        .bind(workflow.parent.map(|p| p.instance_id))
        .bind(workflow.parent.map(|p| p.seq as i32))
        .bind(workflow.continued_from)
        .bind(workflow.execution_deadline)
        .bind(workflow.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("create workflow", e))?;

        debug!(workflow_type = %workflow.workflow_type, "created workflow");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_workflow_info(&self, instance_id: Uuid) -> Result<WorkflowInfo, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM durable_workflow_instances WHERE id = $1"
        ))
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get workflow info", e))?
        .ok_or(StoreError::WorkflowNotFound(instance_id))?;

        workflow_info_from_row(&row)
    }

    #[instrument(skip(self, result, error))]
    async fn update_workflow_status(
        &self,
        instance_id: Uuid,
        status: WorkflowStatus,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let closed_at = status.is_terminal().then_some(at);
        let updated = sqlx::query(
            r#"
            UPDATE durable_workflow_instances
            SET status = $2, result = $3, error = $4, closed_at = COALESCE($5, closed_at)
            WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(status.as_str())
        .bind(&result)
        .bind(&error)
        .bind(closed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("update workflow status", e))?;

        if updated.rows_affected() == 0 {
            return Err(StoreError::WorkflowNotFound(instance_id));
        }
        debug!(%instance_id, %status, "updated workflow status");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_workflows(
        &self,
        status: Option<WorkflowStatus>,
    ) -> Result<Vec<WorkflowInfo>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {WORKFLOW_COLUMNS} FROM durable_workflow_instances \
             WHERE $1::TEXT IS NULL OR status = $1 ORDER BY created_at, id"
        ))
        .bind(status.map(|s| s.as_str()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list workflows", e))?;

        rows.iter().map(workflow_info_from_row).collect()
    }

    async fn expired_workflows(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id FROM durable_workflow_instances
            WHERE status = 'running' AND execution_deadline <= $1
            ORDER BY execution_deadline
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list expired workflows", e))?;

        Ok(rows.iter().map(|row| row.get("id")).collect())
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_events(
        &self,
        instance_id: Uuid,
        expected_sequence: i64,
        recorded_at: DateTime<Utc>,
        events: Vec<HistoryEvent>,
    ) -> Result<i64, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))?;

        // Serialize appenders on the instance row
        sqlx::query("SELECT id FROM durable_workflow_instances WHERE id = $1 FOR UPDATE")
            .bind(instance_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("lock workflow", e))?
            .ok_or(StoreError::WorkflowNotFound(instance_id))?;

        let row = sqlx::query(
            r#"
            SELECT COALESCE(MAX(sequence_num) + 1, 0) AS next_seq
            FROM durable_workflow_events
            WHERE instance_id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("read sequence", e))?;

        let actual: i64 = row.get("next_seq");
        if actual != expected_sequence {
            return Err(StoreError::ConcurrencyConflict {
                expected: expected_sequence,
                actual,
            });
        }

        let mut next = actual;
        for event in events {
            let event_data = serde_json::to_value(&event)?;
            sqlx::query(
                r#"
                INSERT INTO durable_workflow_events
                    (instance_id, sequence_num, event_type, event_data, recorded_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(instance_id)
            .bind(next)
            .bind(event.name())
            .bind(&event_data)
            .bind(recorded_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("insert event", e))?;
            next += 1;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("commit events", e))?;

        debug!(%instance_id, next, "appended events");
        Ok(next)
    }

    fn read_from(
        &self,
        instance_id: Uuid,
        from_sequence: i64,
    ) -> BoxStream<'_, Result<EventRecord, StoreError>> {
        sqlx::query(
            r#"
            SELECT sequence_num, event_data, recorded_at
            FROM durable_workflow_events
            WHERE instance_id = $1 AND sequence_num >= $2
            ORDER BY sequence_num
            "#,
        )
        .bind(instance_id)
        .bind(from_sequence)
        .fetch(&self.pool)
        .map(|row| {
            let row = row.map_err(|e| db_error("read events", e))?;
            event_record_from_row(&row)
        })
        .boxed()
    }

    async fn next_sequence(&self, instance_id: Uuid) -> Result<i64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT i.id, COALESCE((
                SELECT MAX(sequence_num) + 1 FROM durable_workflow_events e
                WHERE e.instance_id = i.id
            ), 0) AS next_seq
            FROM durable_workflow_instances i
            WHERE i.id = $1
            "#,
        )
        .bind(instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("read sequence", e))?
        .ok_or(StoreError::WorkflowNotFound(instance_id))?;

        Ok(row.get("next_seq"))
    }

    #[instrument(skip(self, task), fields(instance_id = %task.instance_id, seq = task.seq))]
    async fn enqueue_task(&self, task: TaskDefinition) -> Result<Uuid, StoreError> {
        let options = serde_json::to_value(&task.options)?;

        // The no-op update makes RETURNING yield the existing row on conflict
        let row = sqlx::query(
            r#"
            INSERT INTO durable_task_queue (
                id, instance_id, seq, activity_type, task_queue, input, options,
                scheduled_at, visible_at, start_to_close_ms, schedule_to_close_ms
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8, $9, $10)
            ON CONFLICT (instance_id, seq) DO UPDATE SET instance_id = EXCLUDED.instance_id
            RETURNING id
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(task.instance_id)
        .bind(task.seq as i32)
        .bind(&task.activity_type)
        .bind(&task.task_queue)
        .bind(&task.input)
        .bind(&options)
        .bind(task.scheduled_at)
        .bind(millis(task.options.start_to_close_timeout))
        .bind(millis(task.options.schedule_to_close_timeout))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("enqueue task", e))?;

        let task_id: Uuid = row.get("id");
        debug!(%task_id, activity_type = %task.activity_type, "enqueued task");
        Ok(task_id)
    }

    #[instrument(skip(self, activity_types))]
    async fn claim_tasks(
        &self,
        worker_id: &str,
        task_queue: &str,
        activity_types: &[String],
        max_tasks: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ClaimedTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM durable_task_queue
                WHERE status = 'pending'
                  AND task_queue = $1
                  AND (cardinality($2::TEXT[]) = 0 OR activity_type = ANY($2))
                  AND visible_at <= $3
                ORDER BY visible_at, id
                LIMIT $4
                FOR UPDATE SKIP LOCKED
            )
            UPDATE durable_task_queue t
            SET status = 'claimed',
                claimed_by = $5,
                started_at = $3,
                heartbeat_at = $3,
                attempt = attempt + 1
            FROM claimable c
            WHERE t.id = c.id
            RETURNING t.id, t.instance_id, t.seq, t.activity_type, t.task_queue,
                      t.input, t.options, t.attempt, t.scheduled_at, t.started_at
            "#,
        )
        .bind(task_queue)
        .bind(activity_types)
        .bind(now)
        .bind(max_tasks as i64)
        .bind(worker_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("claim tasks", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let options: ActivityOptions = serde_json::from_value(row.get("options"))?;
            claimed.push(ClaimedTask {
                id: row.get("id"),
                instance_id: row.get("instance_id"),
                seq: row.get::<i32, _>("seq") as u32,
                activity_type: row.get("activity_type"),
                task_queue: row.get("task_queue"),
                input: row.get("input"),
                options,
                attempt: row.get::<i32, _>("attempt") as u32,
                scheduled_at: row.get("scheduled_at"),
                started_at: row.get("started_at"),
            });
        }

        if !claimed.is_empty() {
            debug!(worker_id, count = claimed.len(), "claimed tasks");
        }
        Ok(claimed)
    }

    #[instrument(skip(self, details))]
    async fn heartbeat_task(
        &self,
        task_id: Uuid,
        details: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<HeartbeatResponse, StoreError> {
        let row = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET heartbeat_at = $2,
                heartbeat_details = COALESCE($3, heartbeat_details)
            WHERE id = $1
            RETURNING status, cancel_requested
            "#,
        )
        .bind(task_id)
        .bind(now)
        .bind(&details)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("heartbeat task", e))?
        .ok_or(StoreError::TaskNotFound(task_id))?;

        let status: String = row.get("status");
        let cancel_requested: bool = row.get("cancel_requested");
        Ok(HeartbeatResponse {
            should_cancel: cancel_requested || !matches!(status.as_str(), "pending" | "claimed"),
        })
    }

    #[instrument(skip(self))]
    async fn retry_task(
        &self,
        task_id: Uuid,
        visible_at: DateTime<Utc>,
        error: &str,
    ) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = 'pending',
                visible_at = $2,
                last_error = $3,
                started_at = NULL,
                claimed_by = NULL
            WHERE id = $1 AND status = 'claimed'
            "#,
        )
        .bind(task_id)
        .bind(visible_at)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("retry task", e))?;

        if updated.rows_affected() == 0 && !self.task_exists(task_id).await? {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn finish_task(&self, task_id: Uuid, status: TaskStatus) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = $2
            WHERE id = $1 AND status IN ('pending', 'claimed') AND NOT cancel_requested
            "#,
        )
        .bind(task_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("finish task", e))?;

        if updated.rows_affected() == 1 {
            return Ok(true);
        }
        if !self.task_exists(task_id).await? {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(false)
    }

    async fn expired_tasks(&self, now: DateTime<Utc>) -> Result<Vec<ExpiredTask>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, instance_id, seq, attempt, scheduled_at, started_at,
                   start_to_close_ms, schedule_to_close_ms
            FROM durable_task_queue
            WHERE status IN ('pending', 'claimed')
              AND NOT cancel_requested
              AND (
                (schedule_to_close_ms IS NOT NULL
                  AND scheduled_at + schedule_to_close_ms * INTERVAL '1 millisecond' <= $1)
                OR (status = 'claimed' AND start_to_close_ms IS NOT NULL
                  AND started_at + start_to_close_ms * INTERVAL '1 millisecond' <= $1)
              )
            ORDER BY id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list expired tasks", e))?;

        let from_millis = |ms: Option<i64>| ms.map(|ms| std::time::Duration::from_millis(ms as u64));
        Ok(rows
            .iter()
            .filter_map(|row| {
                let deadlines = ActivityDeadlines {
                    scheduled_at: row.get("scheduled_at"),
                    started_at: row.get("started_at"),
                    start_to_close: from_millis(row.get("start_to_close_ms")),
                    schedule_to_close: from_millis(row.get("schedule_to_close_ms")),
                };
                deadlines.expired(now).map(|timeout_type| ExpiredTask {
                    id: row.get("id"),
                    instance_id: row.get("instance_id"),
                    seq: row.get::<i32, _>("seq") as u32,
                    attempt: (row.get::<i32, _>("attempt") as u32).max(1),
                    timeout_type,
                })
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn cancel_workflow_tasks(&self, instance_id: Uuid) -> Result<usize, StoreError> {
        let updated = sqlx::query(
            r#"
            UPDATE durable_task_queue
            SET status = CASE WHEN status = 'pending' THEN 'canceled' ELSE status END,
                cancel_requested = (status = 'claimed')
            WHERE instance_id = $1 AND status IN ('pending', 'claimed')
            "#,
        )
        .bind(instance_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("cancel workflow tasks", e))?;

        Ok(updated.rows_affected() as usize)
    }

    async fn has_task(&self, instance_id: Uuid, seq: u32) -> Result<bool, StoreError> {
        let row = sqlx::query(
            "SELECT EXISTS(SELECT 1 FROM durable_task_queue WHERE instance_id = $1 AND seq = $2) AS found",
        )
        .bind(instance_id)
        .bind(seq as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("check task", e))?;
        Ok(row.get("found"))
    }

    #[instrument(skip(self, timer), fields(instance_id = %timer.instance_id, seq = timer.seq))]
    async fn schedule_timer(&self, timer: TimerDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_timers (instance_id, seq, fire_at, started_sequence)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (instance_id, seq) DO NOTHING
            "#,
        )
        .bind(timer.instance_id)
        .bind(timer.seq as i32)
        .bind(timer.fire_at)
        .bind(timer.started_sequence)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("schedule timer", e))?;
        Ok(())
    }

    async fn remove_timer(&self, instance_id: Uuid, seq: u32) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM durable_timers WHERE instance_id = $1 AND seq = $2")
            .bind(instance_id)
            .bind(seq as i32)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("remove timer", e))?;
        Ok(deleted.rows_affected() == 1)
    }

    async fn due_timers(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<TimerDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT instance_id, seq, fire_at, started_sequence
            FROM durable_timers
            WHERE fire_at <= $1
            ORDER BY fire_at, started_sequence, instance_id
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list due timers", e))?;

        Ok(rows.iter().map(timer_from_row).collect())
    }

    async fn cancel_workflow_timers(&self, instance_id: Uuid) -> Result<usize, StoreError> {
        let deleted = sqlx::query("DELETE FROM durable_timers WHERE instance_id = $1")
            .bind(instance_id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("cancel workflow timers", e))?;
        Ok(deleted.rows_affected() as usize)
    }

    async fn next_wakeup(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT LEAST(
                (SELECT MIN(fire_at) FROM durable_timers),
                (SELECT MIN(visible_at) FROM durable_task_queue
                  WHERE status = 'pending' AND visible_at > $1),
                (SELECT MIN(execution_deadline) FROM durable_workflow_instances
                  WHERE status = 'running')
            ) AS wakeup
            "#,
        )
        .bind(after)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("compute next wakeup", e))?;

        Ok(row.get("wakeup"))
    }

    #[instrument(skip(self, signal), fields(signal_name = %signal.signal_name))]
    async fn send_signal(
        &self,
        instance_id: Uuid,
        signal: WorkflowSignal,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO durable_signals (instance_id, signal_name, payload, sent_at)
            SELECT id, $2, $3, $4 FROM durable_workflow_instances WHERE id = $1
            "#,
        )
        .bind(instance_id)
        .bind(&signal.signal_name)
        .bind(&signal.payload)
        .bind(signal.sent_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("send signal", e))
        .and_then(|done| match done.rows_affected() {
            0 => Err(StoreError::WorkflowNotFound(instance_id)),
            _ => Ok(()),
        })
    }

    async fn get_pending_signals(
        &self,
        instance_id: Uuid,
    ) -> Result<Vec<WorkflowSignal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT signal_name, payload, sent_at
            FROM durable_signals
            WHERE instance_id = $1 AND NOT processed
            ORDER BY id
            "#,
        )
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("get pending signals", e))?;

        Ok(rows
            .iter()
            .map(|row| WorkflowSignal {
                signal_name: row.get("signal_name"),
                payload: row.get("payload"),
                sent_at: row.get("sent_at"),
            })
            .collect())
    }

    async fn mark_signals_processed(
        &self,
        instance_id: Uuid,
        count: usize,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE durable_signals SET processed = TRUE
            WHERE id IN (
                SELECT id FROM durable_signals
                WHERE instance_id = $1 AND NOT processed
                ORDER BY id
                LIMIT $2
            )
            "#,
        )
        .bind(instance_id)
        .bind(count as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark signals processed", e))?;
        Ok(())
    }
}
