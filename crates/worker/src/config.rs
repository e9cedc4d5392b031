// Worker configuration

use std::time::Duration;

use uuid::Uuid;

/// Configuration for the worker process, read from the environment
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// PostgreSQL connection string; histories live in memory when unset
    pub database_url: Option<String>,

    /// Maximum database connections
    pub max_db_connections: u32,

    /// Unique worker identifier
    pub worker_id: String,

    /// Namespace recorded on every run this process starts
    pub namespace: String,

    /// Task queue to poll
    pub task_queue: String,

    /// Maximum concurrent activity attempts
    pub max_concurrent_tasks: usize,

    /// Base poll interval when the queue is empty
    pub poll_interval: Duration,

    /// Start a demo background check on boot
    pub run_demo: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_db_connections: 10,
            worker_id: format!("worker-{}", Uuid::now_v7()),
            namespace: "default".to_string(),
            task_queue: "default".to_string(),
            max_concurrent_tasks: 10,
            poll_interval: Duration::from_millis(100),
            run_demo: false,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        Self {
            database_url: var("DATABASE_URL").filter(|url| !url.is_empty()),
            max_db_connections: var("MAX_DB_CONNECTIONS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_db_connections),
            worker_id: var("WORKER_ID").unwrap_or(defaults.worker_id),
            namespace: var("NAMESPACE").unwrap_or(defaults.namespace),
            task_queue: var("TASK_QUEUE").unwrap_or(defaults.task_queue),
            max_concurrent_tasks: var("MAX_CONCURRENT_TASKS")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrent_tasks),
            poll_interval: var("POLL_INTERVAL_MS")
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            run_demo: var("RUN_DEMO")
                .map(|s| matches!(s.as_str(), "1" | "true" | "yes"))
                .unwrap_or(defaults.run_demo),
        }
    }
}
