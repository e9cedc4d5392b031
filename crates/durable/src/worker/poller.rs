//! Task polling with exponential backoff
//!
//! Claims tasks from one task queue, backing off while the queue is idle
//! and snapping back to the minimum interval as soon as work appears.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::engine::Clock;
use crate::persistence::{ClaimedTask, StoreError, WorkflowEventStore};

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollerConfig {
    /// Poll interval while tasks keep arriving
    #[serde(with = "duration_millis")]
    pub min_interval: Duration,

    /// Poll interval ceiling while idle
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no tasks found
    pub backoff_multiplier: f64,

    /// Maximum tasks to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Task poller with adaptive backoff
pub struct TaskPoller<S: WorkflowEventStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    worker_id: String,
    task_queue: String,
    activity_types: Vec<String>,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl<S: WorkflowEventStore> TaskPoller<S> {
    pub fn new(
        store: Arc<S>,
        clock: Arc<dyn Clock>,
        worker_id: String,
        task_queue: String,
        activity_types: Vec<String>,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            clock,
            worker_id,
            task_queue,
            activity_types,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Claim up to `max_tasks` tasks and adjust the backoff
    #[instrument(skip(self), fields(worker_id = %self.worker_id, task_queue = %self.task_queue))]
    pub async fn poll(&mut self, max_tasks: usize) -> Result<Vec<ClaimedTask>, PollerError> {
        if self.is_shutdown() {
            debug!("poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_tasks.min(self.config.batch_size);
        let tasks = self
            .store
            .claim_tasks(
                &self.worker_id,
                &self.task_queue,
                &self.activity_types,
                batch_size,
                self.clock.now(),
            )
            .await?;

        if tasks.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis() as u64,
                "no tasks found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = tasks.len(), "claimed tasks");
        }

        Ok(tasks)
    }

    /// Sleep for the current interval. Returns true if shutdown was
    /// signaled meanwhile.
    pub async fn wait(&mut self) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(self.current_interval) => false,
            _ = shutdown_rx.changed() => {
                debug!("shutdown signal received during wait");
                true
            }
        }
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PollerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ManualClock;
    use crate::persistence::{InMemoryWorkflowEventStore, TaskDefinition};
    use crate::workflow::ActivityOptions;
    use uuid::Uuid;

    fn poller(
        store: Arc<InMemoryWorkflowEventStore>,
        clock: Arc<ManualClock>,
    ) -> (TaskPoller<InMemoryWorkflowEventStore>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(400))
            .with_backoff_multiplier(2.0);
        let poller = TaskPoller::new(
            store,
            clock,
            "worker-1".to_string(),
            "checks".to_string(),
            vec!["ssn_trace".to_string()],
            config,
            rx,
        );
        (poller, tx)
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(0.5)
            .with_batch_size(0);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_while_idle_and_resets() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let clock = Arc::new(ManualClock::default());
        let (mut poller, _tx) = poller(Arc::clone(&store), Arc::clone(&clock));

        for expected in [200, 400, 400] {
            assert!(poller.poll(5).await.expect("should poll").is_empty());
            assert_eq!(poller.current_interval(), Duration::from_millis(expected));
        }

        store
            .enqueue_task(TaskDefinition {
                instance_id: Uuid::now_v7(),
                seq: 1,
                activity_type: "ssn_trace".to_string(),
                task_queue: "checks".to_string(),
                input: serde_json::json!("555-55-5555"),
                options: ActivityOptions::start_to_close(Duration::from_secs(5)),
                scheduled_at: clock.now(),
            })
            .await
            .expect("should enqueue");

        let tasks = poller.poll(5).await.expect("should poll");
        assert_eq!(tasks.len(), 1);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let store = Arc::new(InMemoryWorkflowEventStore::new());
        let (mut poller, tx) = poller(store, Arc::new(ManualClock::default()));

        tx.send(true).expect("receiver should be alive");
        assert!(poller.is_shutdown());
        assert!(poller.poll(5).await.expect("should poll").is_empty());
    }
}
